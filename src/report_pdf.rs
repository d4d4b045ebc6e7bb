//! Fixed A4 report template.
//!
//! Output depends only on the input: no timestamps, no document IDs, object numbers assigned
//! in page order. Two calls with equal `ReportInput`s return identical bytes.

use std::f32::consts::{FRAC_PI_2, PI};

use pdf_writer::{Content, Finish, Name, Pdf, Rect, Ref, Str};

use crate::charts::{ChartOutcome, ChartSpec, ChartType, RenderedChart};
use crate::error::{PipelineError, PipelineResult};
use crate::models::ReportPeriod;

pub const CHARTS_PER_PAGE: usize = 6;

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 40.0;
const GUTTER: f32 = 16.0;
const HEADER_HEIGHT: f32 = 70.0;
const FOOTER_HEIGHT: f32 = 24.0;
const COLUMNS: usize = 2;
const ROWS: usize = 3;

const FONT_REGULAR: Name<'static> = Name(b"F1");
const FONT_BOLD: Name<'static> = Name(b"F2");

const SLICE_PALETTE: [(f32, f32, f32); 6] = [
  (0.15, 0.39, 0.92),
  (0.86, 0.15, 0.15),
  (0.09, 0.64, 0.29),
  (0.92, 0.58, 0.05),
  (0.49, 0.23, 0.93),
  (0.03, 0.57, 0.70),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ReportInput {
  pub company_name: String,
  pub period: ReportPeriod,
  pub catalog_version: String,
  pub charts: Vec<ChartOutcome>,
}

pub fn page_count(chart_count: usize) -> usize {
  chart_count.div_ceil(CHARTS_PER_PAGE).max(1)
}

#[derive(Debug, Clone, Copy)]
struct Cell {
  x: f32,
  y: f32,
  w: f32,
  h: f32,
}

fn cell_at(slot: usize) -> Cell {
  let col = slot % COLUMNS;
  let row = slot / COLUMNS;
  let w = (PAGE_WIDTH - 2.0 * MARGIN - GUTTER * (COLUMNS as f32 - 1.0)) / COLUMNS as f32;
  let grid_top = PAGE_HEIGHT - MARGIN - HEADER_HEIGHT;
  let grid_bottom = MARGIN + FOOTER_HEIGHT;
  let h = (grid_top - grid_bottom - GUTTER * (ROWS as f32 - 1.0)) / ROWS as f32;
  Cell {
    x: MARGIN + col as f32 * (w + GUTTER),
    y: grid_top - (row as f32 + 1.0) * h - row as f32 * GUTTER,
    w,
    h,
  }
}

/// Helvetica is declared without an embedded encoding; keep text to printable ASCII.
fn pdf_text(value: &str) -> Vec<u8> {
  value
    .chars()
    .map(|c| if (' '..='~').contains(&c) { c as u8 } else { b'?' })
    .collect()
}

fn approx_text_width(value: &str, size: f32) -> f32 {
  value.chars().count() as f32 * size * 0.52
}

fn parse_color(hex: &str) -> (f32, f32, f32) {
  let hex = hex.trim().trim_start_matches('#');
  let channel = |i: usize| {
    hex
      .get(i..i + 2)
      .and_then(|v| u8::from_str_radix(v, 16).ok())
      .map(|v| v as f32 / 255.0)
  };
  match (hex.len(), channel(0), channel(2), channel(4)) {
    (6, Some(r), Some(g), Some(b)) => (r, g, b),
    _ => (0.4, 0.4, 0.4),
  }
}

fn format_value(value: f64) -> String {
  format!("{value:.2}")
}

fn text(content: &mut Content, font: Name, size: f32, x: f32, y: f32, value: &str) {
  let bytes = pdf_text(value);
  content.begin_text();
  content.set_font(font, size);
  content.next_line(x, y);
  content.show(Str(&bytes));
  content.end_text();
}

fn draw_header(content: &mut Content, input: &ReportInput, page: usize, pages: usize) {
  let top = PAGE_HEIGHT - MARGIN;
  content.set_fill_rgb(0.1, 0.1, 0.1);
  text(content, FONT_BOLD, 18.0, MARGIN, top - 20.0, &input.company_name);
  content.set_fill_rgb(0.35, 0.35, 0.35);
  text(
    content,
    FONT_REGULAR,
    10.0,
    MARGIN,
    top - 38.0,
    &format!(
      "Marketing performance report  |  {}  |  catalog {}",
      input.period, input.catalog_version
    ),
  );
  content.set_stroke_rgb(0.8, 0.8, 0.8);
  content.set_line_width(0.5);
  content.move_to(MARGIN, top - 50.0);
  content.line_to(PAGE_WIDTH - MARGIN, top - 50.0);
  content.stroke();

  let footer = format!("Page {page} of {pages}");
  text(
    content,
    FONT_REGULAR,
    8.0,
    PAGE_WIDTH - MARGIN - approx_text_width(&footer, 8.0),
    MARGIN,
    &footer,
  );
}

fn draw_cell_frame(content: &mut Content, cell: Cell, title: &str) {
  content.set_stroke_rgb(0.85, 0.85, 0.85);
  content.set_line_width(0.75);
  content.rect(cell.x, cell.y, cell.w, cell.h);
  content.stroke();
  content.set_fill_rgb(0.1, 0.1, 0.1);
  text(content, FONT_BOLD, 10.0, cell.x + 8.0, cell.y + cell.h - 16.0, title);
}

/// Drawing area below the cell title.
fn plot_area(cell: Cell) -> Cell {
  Cell {
    x: cell.x + 28.0,
    y: cell.y + 22.0,
    w: cell.w - 40.0,
    h: cell.h - 50.0,
  }
}

fn draw_placeholder(content: &mut Content, cell: Cell, title: &str) {
  draw_cell_frame(content, cell, title);
  let area = plot_area(cell);
  content.set_fill_rgb(0.95, 0.95, 0.95);
  content.rect(area.x, area.y, area.w, area.h);
  content.fill_nonzero();
  let label = "data unavailable";
  content.set_fill_rgb(0.5, 0.5, 0.5);
  text(
    content,
    FONT_REGULAR,
    11.0,
    area.x + (area.w - approx_text_width(label, 11.0)) / 2.0,
    area.y + area.h / 2.0 - 4.0,
    label,
  );
}

fn draw_partial_mark(content: &mut Content, cell: Cell) {
  let label = "partial data";
  content.set_fill_rgb(0.85, 0.45, 0.0);
  text(
    content,
    FONT_REGULAR,
    8.0,
    cell.x + cell.w - 8.0 - approx_text_width(label, 8.0),
    cell.y + cell.h - 15.0,
    label,
  );
}

fn ensure_finite(spec: &ChartSpec) -> PipelineResult<()> {
  let bad = |v: f64| !v.is_finite();
  let invalid = match &spec.rendered {
    RenderedChart::Series { datasets, .. } => datasets.iter().flat_map(|d| d.values.iter().flatten()).any(|v| bad(*v)),
    RenderedChart::Kpi { value, .. } => value.is_some_and(bad),
    RenderedChart::Slices { slices } => slices.iter().any(|s| bad(s.value) || s.value < 0.0),
  };
  if invalid {
    return Err(PipelineError::Render(format!("chart {} has non-drawable values", spec.key)));
  }
  Ok(())
}

fn draw_axes(content: &mut Content, area: Cell, max: f64, first_label: &str, last_label: &str) {
  content.set_stroke_rgb(0.6, 0.6, 0.6);
  content.set_line_width(0.5);
  content.move_to(area.x, area.y + area.h);
  content.line_to(area.x, area.y);
  content.line_to(area.x + area.w, area.y);
  content.stroke();

  content.set_fill_rgb(0.4, 0.4, 0.4);
  text(content, FONT_REGULAR, 6.0, area.x - 26.0, area.y + area.h - 3.0, &format_value(max));
  text(content, FONT_REGULAR, 6.0, area.x - 8.0, area.y - 2.0, "0");
  text(content, FONT_REGULAR, 6.0, area.x, area.y - 9.0, first_label);
  text(
    content,
    FONT_REGULAR,
    6.0,
    area.x + area.w - approx_text_width(last_label, 6.0),
    area.y - 9.0,
    last_label,
  );
}

fn series_max(spec: &ChartSpec) -> f64 {
  match &spec.rendered {
    RenderedChart::Series { datasets, .. } => datasets
      .iter()
      .flat_map(|d| d.values.iter().flatten())
      .fold(0.0_f64, |acc, v| acc.max(*v)),
    _ => 0.0,
  }
}

fn dataset_color(spec: &ChartSpec, index: usize) -> (f32, f32, f32) {
  if index == 0 {
    parse_color(&spec.color)
  } else {
    SLICE_PALETTE[index % SLICE_PALETTE.len()]
  }
}

fn draw_series(content: &mut Content, cell: Cell, spec: &ChartSpec) {
  let RenderedChart::Series { labels, datasets } = &spec.rendered else {
    return;
  };
  let area = plot_area(cell);
  let max = series_max(spec);
  let first = labels.first().map(|d| d.to_string()).unwrap_or_default();
  let last = labels.last().map(|d| d.to_string()).unwrap_or_default();
  draw_axes(content, area, max, &first, &last);
  if labels.is_empty() {
    return;
  }

  let scale_y = |v: f64| {
    if max > 0.0 {
      area.y + (v / max) as f32 * area.h
    } else {
      area.y
    }
  };
  let n = labels.len();

  match spec.chart_type {
    ChartType::Bar => {
      let slot = area.w / n as f32;
      let bar_w = (slot * 0.8) / datasets.len().max(1) as f32;
      for (di, dataset) in datasets.iter().enumerate() {
        let (r, g, b) = dataset_color(spec, di);
        content.set_fill_rgb(r, g, b);
        for (i, value) in dataset.values.iter().enumerate() {
          // Gaps get no bar at all, unlike a zero.
          let Some(value) = value else {
            continue;
          };
          let x = area.x + i as f32 * slot + slot * 0.1 + di as f32 * bar_w;
          content.rect(x, area.y, bar_w, scale_y(*value) - area.y);
          content.fill_nonzero();
        }
      }
    }
    _ => {
      let step = if n > 1 { area.w / (n - 1) as f32 } else { 0.0 };
      content.set_line_width(1.2);
      for (di, dataset) in datasets.iter().enumerate() {
        let (r, g, b) = dataset_color(spec, di);
        content.set_stroke_rgb(r, g, b);
        content.set_fill_rgb(r, g, b);
        let mut pen_down = false;
        for (i, value) in dataset.values.iter().enumerate() {
          let x = area.x + i as f32 * step;
          match value {
            Some(v) => {
              let y = scale_y(*v);
              if pen_down {
                content.line_to(x, y);
              } else {
                content.move_to(x, y);
                pen_down = true;
              }
            }
            None => {
              if pen_down {
                content.stroke();
              }
              pen_down = false;
            }
          }
        }
        if pen_down {
          content.stroke();
        }
        // Points make isolated days visible between gaps.
        for (i, value) in dataset.values.iter().enumerate() {
          if let Some(v) = value {
            content.rect(area.x + i as f32 * step - 1.0, scale_y(*v) - 1.0, 2.0, 2.0);
            content.fill_nonzero();
          }
        }
      }
    }
  }

  if datasets.len() > 1 {
    let mut x = area.x + 4.0;
    for (di, dataset) in datasets.iter().enumerate() {
      let (r, g, b) = dataset_color(spec, di);
      content.set_fill_rgb(r, g, b);
      content.rect(x, area.y + area.h + 6.0, 5.0, 5.0);
      content.fill_nonzero();
      content.set_fill_rgb(0.3, 0.3, 0.3);
      text(content, FONT_REGULAR, 6.0, x + 7.0, area.y + area.h + 6.5, &dataset.label);
      x += 12.0 + approx_text_width(&dataset.label, 6.0);
    }
  }
}

fn draw_kpi(content: &mut Content, cell: Cell, spec: &ChartSpec) {
  let RenderedChart::Kpi { value, unit } = &spec.rendered else {
    return;
  };
  let area = plot_area(cell);
  let label = match (value, unit) {
    (Some(v), Some(unit)) => format!("{}{unit}", format_value(*v)),
    (Some(v), None) => format_value(*v),
    (None, _) => "n/a".to_string(),
  };
  let (r, g, b) = parse_color(&spec.color);
  content.set_fill_rgb(r, g, b);
  text(
    content,
    FONT_BOLD,
    26.0,
    area.x + (area.w - approx_text_width(&label, 26.0)) / 2.0,
    area.y + area.h / 2.0 - 8.0,
    &label,
  );
}

fn point_on(cx: f32, cy: f32, r: f32, angle: f32) -> (f32, f32) {
  (cx + r * angle.cos(), cy + r * angle.sin())
}

/// Wedge from `start` to `end` (radians, counter-clockwise), arcs approximated by cubic Béziers.
fn wedge(content: &mut Content, cx: f32, cy: f32, r: f32, start: f32, end: f32) {
  content.move_to(cx, cy);
  let (x0, y0) = point_on(cx, cy, r, start);
  content.line_to(x0, y0);
  let mut a0 = start;
  while a0 < end - 1e-4 {
    let a1 = (a0 + FRAC_PI_2).min(end);
    let k = 4.0 / 3.0 * ((a1 - a0) / 4.0).tan();
    let (p0x, p0y) = point_on(cx, cy, r, a0);
    let (p3x, p3y) = point_on(cx, cy, r, a1);
    content.cubic_to(
      p0x - k * r * a0.sin(),
      p0y + k * r * a0.cos(),
      p3x + k * r * a1.sin(),
      p3y - k * r * a1.cos(),
      p3x,
      p3y,
    );
    a0 = a1;
  }
  content.close_path();
  content.fill_nonzero();
}

fn draw_pie(content: &mut Content, cell: Cell, spec: &ChartSpec) {
  let RenderedChart::Slices { slices } = &spec.rendered else {
    return;
  };
  let area = plot_area(cell);
  let total: f64 = slices.iter().map(|s| s.value).sum();
  let r = (area.h / 2.0).min(area.w / 4.0) - 2.0;
  let cx = area.x + r + 4.0;
  let cy = area.y + area.h / 2.0;

  if total <= 0.0 {
    content.set_stroke_rgb(0.7, 0.7, 0.7);
    content.rect(cx - r, cy - r, 2.0 * r, 2.0 * r);
    content.stroke();
  } else {
    let mut angle = FRAC_PI_2;
    for (i, slice) in slices.iter().enumerate() {
      let sweep = (slice.value / total) as f32 * 2.0 * PI;
      if sweep <= 0.0 {
        continue;
      }
      let (cr, cg, cb) = SLICE_PALETTE[i % SLICE_PALETTE.len()];
      content.set_fill_rgb(cr, cg, cb);
      wedge(content, cx, cy, r, angle, angle + sweep);
      angle += sweep;
    }
  }

  let legend_x = cx + r + 14.0;
  let mut legend_y = cy + r - 8.0;
  for (i, slice) in slices.iter().enumerate() {
    let (cr, cg, cb) = SLICE_PALETTE[i % SLICE_PALETTE.len()];
    content.set_fill_rgb(cr, cg, cb);
    content.rect(legend_x, legend_y, 6.0, 6.0);
    content.fill_nonzero();
    content.set_fill_rgb(0.25, 0.25, 0.25);
    text(
      content,
      FONT_REGULAR,
      7.0,
      legend_x + 10.0,
      legend_y,
      &format!("{}  {}", slice.label, format_value(slice.value)),
    );
    legend_y -= 12.0;
  }
}

fn draw_chart(content: &mut Content, cell: Cell, outcome: &ChartOutcome) {
  let spec = match outcome {
    ChartOutcome::Rendered(spec) => spec,
    ChartOutcome::Failed { title, .. } => {
      draw_placeholder(content, cell, title);
      return;
    }
  };

  if let Err(err) = ensure_finite(spec) {
    tracing::warn!(chart = %spec.key, error = %err, "chart not drawable; using placeholder");
    draw_placeholder(content, cell, &spec.title);
    return;
  }

  draw_cell_frame(content, cell, &spec.title);
  match spec.chart_type {
    ChartType::Line | ChartType::Bar => draw_series(content, cell, spec),
    ChartType::Kpi => draw_kpi(content, cell, spec),
    ChartType::Pie => draw_pie(content, cell, spec),
  }
  if spec.partial {
    draw_partial_mark(content, cell);
  }
}

pub fn assemble_report(input: &ReportInput) -> PipelineResult<Vec<u8>> {
  let pages = page_count(input.charts.len());

  let catalog_id = Ref::new(1);
  let page_tree_id = Ref::new(2);
  let font_regular_id = Ref::new(3);
  let font_bold_id = Ref::new(4);
  let page_ids = (0..pages)
    .map(|i| (Ref::new(5 + 2 * i as i32), Ref::new(6 + 2 * i as i32)))
    .collect::<Vec<_>>();

  let mut pdf = Pdf::new();
  pdf.catalog(catalog_id).pages(page_tree_id);
  pdf
    .pages(page_tree_id)
    .kids(page_ids.iter().map(|(page, _)| *page))
    .count(pages as i32);
  pdf.type1_font(font_regular_id).base_font(Name(b"Helvetica"));
  pdf.type1_font(font_bold_id).base_font(Name(b"Helvetica-Bold"));

  for (index, (page_id, content_id)) in page_ids.iter().enumerate() {
    let mut page = pdf.page(*page_id);
    page.media_box(Rect::new(0.0, 0.0, PAGE_WIDTH, PAGE_HEIGHT));
    page.parent(page_tree_id);
    page.contents(*content_id);
    let mut resources = page.resources();
    let mut fonts = resources.fonts();
    fonts.pair(FONT_REGULAR, font_regular_id);
    fonts.pair(FONT_BOLD, font_bold_id);
    fonts.finish();
    resources.finish();
    page.finish();

    let mut content = Content::new();
    draw_header(&mut content, input, index + 1, pages);

    let charts = input
      .charts
      .iter()
      .skip(index * CHARTS_PER_PAGE)
      .take(CHARTS_PER_PAGE);
    if input.charts.is_empty() {
      content.set_fill_rgb(0.4, 0.4, 0.4);
      text(
        &mut content,
        FONT_REGULAR,
        12.0,
        MARGIN,
        PAGE_HEIGHT - MARGIN - HEADER_HEIGHT - 20.0,
        "No connected data sources for this period.",
      );
    }
    for (slot, outcome) in charts.enumerate() {
      draw_chart(&mut content, cell_at(slot), outcome);
    }

    pdf.stream(*content_id, &content.finish());
  }

  Ok(pdf.finish())
}

//! Chart catalog and the pure transform from metric series to renderable charts.
//!
//! Every number leaving this module is rounded half-to-even at two decimals, so the same
//! series always produce the same chart payload (and therefore the same PDF bytes).
//! Missing days stay `None` all the way through; nothing is interpolated.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{MetricSeries, Provider};

const DEFAULT_CATALOG_JSON: &str = include_str!("../config/chart_catalog.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
  Line,
  Bar,
  Pie,
  Kpi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregation {
  /// Daily points per metric.
  Series,
  /// Period total over all listed metrics.
  Sum,
  Rate {
    numerator: String,
    denominator: String,
    #[serde(default = "default_scale")]
    scale: f64,
  },
  /// Percent change of the second half of the period against the first half. The middle day
  /// of an odd-length period belongs to neither half.
  PeriodOverPeriod,
  /// Per-metric totals, for pies.
  Share,
}

fn default_scale() -> f64 {
  1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartTemplate {
  pub key: String,
  pub title: String,
  pub description: String,
  #[serde(rename = "type")]
  pub chart_type: ChartType,
  pub category: String,
  pub color: String,
  pub platform: Provider,
  pub metrics: Vec<String>,
  pub aggregation: Aggregation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartCatalog {
  pub version: String,
  pub charts: Vec<ChartTemplate>,
}

/// Public description of a catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartInfo {
  pub key: String,
  pub title: String,
  pub description: String,
  #[serde(rename = "type")]
  pub chart_type: ChartType,
  pub category: String,
  pub color: String,
  pub platform: Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryGroup {
  pub category: String,
  pub charts: Vec<ChartInfo>,
}

impl ChartCatalog {
  pub fn default_catalog() -> PipelineResult<Self> {
    Self::from_json(DEFAULT_CATALOG_JSON)
  }

  pub fn from_json(raw: &str) -> PipelineResult<Self> {
    let catalog: ChartCatalog = serde_json::from_str(raw)
      .map_err(|e| PipelineError::Config(format!("invalid chart catalog: {e}")))?;
    catalog.validate()?;
    Ok(catalog)
  }

  /// Reads `path` when given, otherwise the built-in catalog.
  pub fn load(path: Option<&str>) -> PipelineResult<Self> {
    match path {
      Some(path) => {
        let raw = std::fs::read_to_string(path)
          .map_err(|e| PipelineError::Config(format!("failed to read chart catalog {path}: {e}")))?;
        Self::from_json(&raw)
      }
      None => Self::default_catalog(),
    }
  }

  fn validate(&self) -> PipelineResult<()> {
    if self.version.trim().is_empty() {
      return Err(PipelineError::Config("chart catalog version is empty".to_string()));
    }
    let mut seen = HashSet::new();
    for chart in &self.charts {
      if !seen.insert(chart.key.as_str()) {
        return Err(PipelineError::Config(format!("duplicate chart key {}", chart.key)));
      }
      if chart.metrics.is_empty() {
        return Err(PipelineError::Config(format!("chart {} lists no metrics", chart.key)));
      }
      if let Aggregation::Rate {
        numerator,
        denominator,
        ..
      } = &chart.aggregation
      {
        if !chart.metrics.contains(numerator) || !chart.metrics.contains(denominator) {
          return Err(PipelineError::Config(format!(
            "chart {} rate uses metrics it does not list",
            chart.key
          )));
        }
      }
    }
    Ok(())
  }

  pub fn get(&self, key: &str) -> PipelineResult<&ChartTemplate> {
    self
      .charts
      .iter()
      .find(|c| c.key == key)
      .ok_or_else(|| PipelineError::UnknownChartKey(key.to_string()))
  }

  /// Catalog order is report order.
  pub fn keys_for(&self, platform: Provider) -> Vec<String> {
    self
      .charts
      .iter()
      .filter(|c| c.platform == platform)
      .map(|c| c.key.clone())
      .collect()
  }

  /// Union of metrics the platform's charts need, in first-use order.
  pub fn metric_keys_for(&self, platform: Provider) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for chart in self.charts.iter().filter(|c| c.platform == platform) {
      for metric in &chart.metrics {
        if !keys.contains(metric) {
          keys.push(metric.clone());
        }
      }
    }
    keys
  }

  /// Categories in first-appearance order.
  pub fn grouped_by_category(&self) -> Vec<CategoryGroup> {
    let mut groups: Vec<CategoryGroup> = Vec::new();
    for chart in &self.charts {
      let info = ChartInfo {
        key: chart.key.clone(),
        title: chart.title.clone(),
        description: chart.description.clone(),
        chart_type: chart.chart_type,
        category: chart.category.clone(),
        color: chart.color.clone(),
        platform: chart.platform,
      };
      match groups.iter_mut().find(|g| g.category == chart.category) {
        Some(group) => group.charts.push(info),
        None => groups.push(CategoryGroup {
          category: chart.category.clone(),
          charts: vec![info],
        }),
      }
    }
    groups
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
  pub label: String,
  pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slice {
  pub label: String,
  pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderedChart {
  Series {
    labels: Vec<NaiveDate>,
    datasets: Vec<Dataset>,
  },
  Kpi {
    value: Option<f64>,
    /// Set for period-over-period and rate charts.
    unit: Option<String>,
  },
  Slices {
    slices: Vec<Slice>,
  },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSpec {
  pub key: String,
  pub title: String,
  pub chart_type: ChartType,
  pub category: String,
  pub color: String,
  pub partial: bool,
  pub rendered: RenderedChart,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChartOutcome {
  Rendered(ChartSpec),
  /// Drawn as a "data unavailable" placeholder.
  Failed {
    key: String,
    title: String,
    category: String,
    reason: String,
  },
}

impl ChartOutcome {
  pub fn key(&self) -> &str {
    match self {
      ChartOutcome::Rendered(spec) => &spec.key,
      ChartOutcome::Failed { key, .. } => key,
    }
  }

  pub fn is_rendered(&self) -> bool {
    matches!(self, ChartOutcome::Rendered(_))
  }

  pub fn mark_partial(&mut self) {
    if let ChartOutcome::Rendered(spec) = self {
      spec.partial = true;
    }
  }
}

pub fn round_half_even_2(value: f64) -> f64 {
  let rounded = (value * 100.0).round_ties_even() / 100.0;
  // Avoid emitting -0.0.
  if rounded == 0.0 {
    0.0
  } else {
    rounded
  }
}

fn total(values: &[Option<f64>]) -> Option<f64> {
  let mut seen = false;
  let mut sum = 0.0;
  for v in values.iter().flatten() {
    seen = true;
    sum += v;
  }
  seen.then_some(sum)
}

fn find_series<'a>(
  template: &ChartTemplate,
  series: &'a [MetricSeries],
  metric: &str,
) -> PipelineResult<&'a MetricSeries> {
  series
    .iter()
    .find(|s| s.provider == template.platform && s.metric_key == metric)
    .ok_or_else(|| {
      PipelineError::Render(format!(
        "chart {} needs {} metric {metric}, which was not fetched",
        template.key, template.platform
      ))
    })
}

fn values_of(series: &MetricSeries) -> Vec<Option<f64>> {
  series.points.iter().map(|p| p.value).collect()
}

pub fn render_chart(template: &ChartTemplate, series: &[MetricSeries]) -> PipelineResult<ChartSpec> {
  let inputs = template
    .metrics
    .iter()
    .map(|metric| find_series(template, series, metric))
    .collect::<PipelineResult<Vec<_>>>()?;

  let rendered = match &template.aggregation {
    Aggregation::Series => {
      let labels = inputs
        .first()
        .map(|s| s.points.iter().map(|p| p.date).collect::<Vec<_>>())
        .unwrap_or_default();
      let datasets = inputs
        .iter()
        .map(|s| {
          if s.points.len() != labels.len() {
            return Err(PipelineError::Render(format!(
              "chart {}: series {} has {} points, expected {}",
              template.key,
              s.metric_key,
              s.points.len(),
              labels.len()
            )));
          }
          Ok(Dataset {
            label: s.metric_key.clone(),
            values: s.points.iter().map(|p| p.value.map(round_half_even_2)).collect(),
          })
        })
        .collect::<PipelineResult<Vec<_>>>()?;
      RenderedChart::Series { labels, datasets }
    }
    Aggregation::Sum => {
      let totals = inputs.iter().filter_map(|s| total(&values_of(s))).collect::<Vec<_>>();
      let value = (!totals.is_empty()).then(|| round_half_even_2(totals.iter().sum()));
      RenderedChart::Kpi { value, unit: None }
    }
    Aggregation::Rate {
      numerator,
      denominator,
      scale,
    } => {
      let num = total(&values_of(find_series(template, series, numerator)?));
      let den = total(&values_of(find_series(template, series, denominator)?));
      let value = match (num, den) {
        (Some(n), Some(d)) if d != 0.0 => Some(round_half_even_2(n / d * scale)),
        _ => None,
      };
      let unit = (*scale == 100.0).then(|| "%".to_string());
      RenderedChart::Kpi { value, unit }
    }
    Aggregation::PeriodOverPeriod => {
      let values = inputs.first().map(|s| values_of(s)).unwrap_or_default();
      // Odd-length periods leave the middle day out so both halves cover the same days.
      let half = values.len() / 2;
      let first = total(&values[..half]);
      let second = total(&values[values.len() - half..]);
      let value = match (first, second) {
        (Some(a), Some(b)) if a != 0.0 => Some(round_half_even_2((b - a) / a * 100.0)),
        _ => None,
      };
      RenderedChart::Kpi {
        value,
        unit: Some("%".to_string()),
      }
    }
    Aggregation::Share => {
      let slices = inputs
        .iter()
        .filter_map(|s| {
          total(&values_of(s)).map(|v| Slice {
            label: s.metric_key.clone(),
            value: round_half_even_2(v),
          })
        })
        .collect();
      RenderedChart::Slices { slices }
    }
  };

  Ok(ChartSpec {
    key: template.key.clone(),
    title: template.title.clone(),
    chart_type: template.chart_type,
    category: template.category.clone(),
    color: template.color.clone(),
    partial: false,
    rendered,
  })
}

/// Renders `keys` in order. An unknown key fails the whole call; a chart whose data is
/// missing becomes `ChartOutcome::Failed` and the rest still render.
pub fn generate_charts(
  catalog: &ChartCatalog,
  keys: &[String],
  series: &[MetricSeries],
) -> PipelineResult<Vec<ChartOutcome>> {
  let templates = keys
    .iter()
    .map(|key| catalog.get(key))
    .collect::<PipelineResult<Vec<_>>>()?;

  Ok(
    templates
      .into_iter()
      .map(|template| match render_chart(template, series) {
        Ok(spec) => ChartOutcome::Rendered(spec),
        Err(err) => {
          tracing::warn!(chart = %template.key, error = %err, "chart render failed; using placeholder");
          ChartOutcome::Failed {
            key: template.key.clone(),
            title: template.title.clone(),
            category: template.category.clone(),
            reason: err.to_string(),
          }
        }
      })
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::MetricPoint;

  fn series(provider: Provider, key: &str, values: &[Option<f64>]) -> MetricSeries {
    let start = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    MetricSeries {
      provider,
      account_id: "acct".to_string(),
      metric_key: key.to_string(),
      points: values
        .iter()
        .enumerate()
        .map(|(i, v)| MetricPoint {
          date: start + chrono::Duration::days(i as i64),
          value: *v,
        })
        .collect(),
    }
  }

  fn aggregator_series() -> Vec<MetricSeries> {
    vec![
      series(Provider::Aggregator, "spend", &[Some(10.004), None, Some(2.0), Some(3.0)]),
      series(Provider::Aggregator, "impressions", &[Some(100.0), Some(100.0), None, Some(200.0)]),
      series(Provider::Aggregator, "clicks", &[Some(3.0), Some(1.0), None, Some(4.0)]),
      series(Provider::Aggregator, "conversions", &[Some(2.0), Some(2.0), Some(3.0), Some(3.0)]),
    ]
  }

  #[test]
  fn rounding_is_half_to_even() {
    assert_eq!(round_half_even_2(0.125), 0.12);
    assert_eq!(round_half_even_2(0.375), 0.38);
    assert_eq!(round_half_even_2(2.5), 2.5);
    assert_eq!(round_half_even_2(-0.001), 0.0);
    assert!(round_half_even_2(-0.001).is_sign_positive());
  }

  #[test]
  fn default_catalog_has_six_aggregator_charts() {
    let catalog = ChartCatalog::default_catalog().unwrap();
    assert_eq!(catalog.keys_for(Provider::Aggregator).len(), 6);
    assert_eq!(
      catalog.metric_keys_for(Provider::Aggregator),
      vec!["spend", "impressions", "clicks", "conversions"]
    );
    let groups = catalog.grouped_by_category();
    assert_eq!(groups[0].category, "Spend");
    assert_eq!(groups[0].charts.len(), 2);
  }

  #[test]
  fn unknown_key_is_rejected() {
    let catalog = ChartCatalog::default_catalog().unwrap();
    let err = generate_charts(&catalog, &["nope".to_string()], &[]).unwrap_err();
    assert!(matches!(err, PipelineError::UnknownChartKey(key) if key == "nope"));
  }

  #[test]
  fn series_keep_gaps() {
    let catalog = ChartCatalog::default_catalog().unwrap();
    let spec = render_chart(catalog.get("agg_spend_daily").unwrap(), &aggregator_series()).unwrap();
    match spec.rendered {
      RenderedChart::Series { labels, datasets } => {
        assert_eq!(labels.len(), 4);
        assert_eq!(datasets[0].values, vec![Some(10.0), None, Some(2.0), Some(3.0)]);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn aggregations_compute_expected_values() {
    let catalog = ChartCatalog::default_catalog().unwrap();
    let data = aggregator_series();
    let kpi = |key: &str| match render_chart(catalog.get(key).unwrap(), &data).unwrap().rendered {
      RenderedChart::Kpi { value, .. } => value,
      other => panic!("unexpected {other:?}"),
    };
    assert_eq!(kpi("agg_total_spend"), Some(15.0));
    // 8 clicks / 400 impressions.
    assert_eq!(kpi("agg_ctr"), Some(2.0));
    // 4 -> 6 conversions.
    assert_eq!(kpi("agg_conversions_trend"), Some(50.0));

    match render_chart(catalog.get("agg_engagement_mix").unwrap(), &data).unwrap().rendered {
      RenderedChart::Slices { slices } => {
        assert_eq!(slices[0], Slice { label: "clicks".to_string(), value: 8.0 });
        assert_eq!(slices[1].value, 10.0);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn flat_month_has_no_period_over_period_change() {
    let catalog = ChartCatalog::default_catalog().unwrap();
    let flat = vec![series(Provider::Aggregator, "conversions", &[Some(5.0); 31])];
    match render_chart(catalog.get("agg_conversions_trend").unwrap(), &flat).unwrap().rendered {
      RenderedChart::Kpi { value, .. } => assert_eq!(value, Some(0.0)),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn missing_platform_data_becomes_failed_outcome() {
    let catalog = ChartCatalog::default_catalog().unwrap();
    let keys = vec!["agg_total_spend".to_string(), "video_views_daily".to_string()];
    let outcomes = generate_charts(&catalog, &keys, &aggregator_series()).unwrap();
    assert!(outcomes[0].is_rendered());
    assert!(matches!(&outcomes[1], ChartOutcome::Failed { key, .. } if key == "video_views_daily"));
  }

  #[test]
  fn catalog_validation_rejects_duplicates() {
    let raw = r##"{"version":"1","charts":[
      {"key":"a","title":"A","description":"","type":"kpi","category":"X","color":"#000","platform":"video","metrics":["views"],"aggregation":{"kind":"sum"}},
      {"key":"a","title":"A","description":"","type":"kpi","category":"X","color":"#000","platform":"video","metrics":["views"],"aggregation":{"kind":"sum"}}
    ]}"##;
    assert!(matches!(ChartCatalog::from_json(raw), Err(PipelineError::Config(_))));
  }
}

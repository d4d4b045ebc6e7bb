use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use vercel_runtime::Error;

use report_flux::app::AppContext;
use report_flux::config::PipelineConfig;
use report_flux::email::{Mailer, RecordingMailer};
use report_flux::models::ReportPeriod;
use report_flux::telemetry::init_tracing;

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
  args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  let args: Vec<String> = std::env::args().collect();

  let company_id = parse_flag_value(&args, "--company-id")
    .or_else(|| parse_flag_value(&args, "--company"))
    .unwrap_or_default();
  if company_id.trim().is_empty() {
    eprintln!("Missing required --company-id");
    eprintln!("Example: cargo run --bin local_report_once -- --company-id co_123 --period 2024-05 --dry-run");
    return Ok(());
  }

  let period = match parse_flag_value(&args, "--period") {
    Some(raw) => match ReportPeriod::parse(&raw) {
      Some(period) => period,
      None => {
        eprintln!("Invalid --period {raw} (expected YYYY-MM)");
        return Ok(());
      }
    },
    None => ReportPeriod::previous_month(Utc::now()),
  };
  let force = has_flag(&args, "--force");
  let dry_run = has_flag(&args, "--dry-run");
  let out_path = parse_flag_value(&args, "--out");

  let recorder = Arc::new(RecordingMailer::new());
  let mailer: Option<Arc<dyn Mailer>> = if dry_run {
    Some(recorder.clone() as Arc<dyn Mailer>)
  } else {
    None
  };
  let ctx = AppContext::from_config(PipelineConfig::from_env(), mailer)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;

  let (_cancel_tx, cancel_rx) = watch::channel(false);
  let report = ctx
    .pipeline
    .run_for_company(company_id.trim(), period, force, &cancel_rx)
    .await;
  println!("{}", serde_json::to_string_pretty(&report)?);

  if dry_run {
    for email in recorder.sent() {
      println!(
        "dry run: would email {} to {} ({} bytes)",
        email.attachment_name,
        email.to.join(", "),
        email.pdf.len()
      );
    }
  }

  if let Some(path) = out_path {
    let artifact = ctx
      .reports
      .fetch_artifact(company_id.trim(), &period.key())
      .await
      .map_err(|e| -> Error { Box::new(e) })?;
    match artifact {
      Some(artifact) => {
        std::fs::write(&path, &artifact.pdf_bytes)?;
        println!("wrote {path} (sha256 {})", artifact.pdf_sha256);
      }
      None => eprintln!("No artifact stored for {company_id} {period}"),
    }
  }

  Ok(())
}

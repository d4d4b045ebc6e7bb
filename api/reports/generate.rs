use bytes::Bytes;
use chrono::Utc;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use tokio::sync::watch;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use report_flux::app::AppContext;
use report_flux::models::ReportPeriod;
use report_flux::monthly_job::TenantOutcome;
use report_flux::telemetry::init_tracing;

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

fn has_tidb_url() -> bool {
  std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .map(|v| !v.is_empty())
    .unwrap_or(false)
}

#[derive(Deserialize)]
struct GenerateRequest {
  company_id: String,
  /// `YYYY-MM`; defaults to the previous calendar month.
  period: Option<String>,
  #[serde(default)]
  force: bool,
}

fn resolve_period(requested: Option<&str>) -> Option<ReportPeriod> {
  match requested.map(str::trim).filter(|p| !p.is_empty()) {
    Some(raw) => ReportPeriod::parse(raw),
    None => Some(ReportPeriod::previous_month(Utc::now())),
  }
}

async fn handle_generate(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  let parsed: GenerateRequest = serde_json::from_slice(&body).map_err(|e| -> Error {
    Box::new(std::io::Error::other(format!("invalid json body: {e}")))
  })?;

  let Some(period) = resolve_period(parsed.period.as_deref()) else {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "period must be YYYY-MM"}),
    );
  };
  if parsed.company_id.trim().is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "company_id is required"}),
    );
  }

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let ctx = AppContext::from_env().await.map_err(|e| -> Error { Box::new(e) })?;
  let (_cancel_tx, cancel_rx) = watch::channel(false);
  let report = ctx
    .pipeline
    .run_for_company(parsed.company_id.trim(), period, parsed.force, &cancel_rx)
    .await;

  let status = match report.outcome {
    TenantOutcome::Succeeded | TenantOutcome::Skipped => StatusCode::OK,
    TenantOutcome::Failed | TenantOutcome::Cancelled => StatusCode::UNPROCESSABLE_ENTITY,
  };
  json_response(
    status,
    serde_json::json!({"ok": status == StatusCode::OK, "report": report}),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_generate(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}

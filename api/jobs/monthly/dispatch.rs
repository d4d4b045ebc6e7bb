use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use tokio::sync::watch;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use report_flux::app::AppContext;
use report_flux::models::ReportPeriod;
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

/// Tenants not yet started when the deadline passes are cancelled; running ones finish.
fn job_deadline() -> Duration {
  let secs = std::env::var("MONTHLY_JOB_DEADLINE_SECS")
    .ok()
    .and_then(|v| v.trim().parse::<u64>().ok())
    .unwrap_or(780)
    .clamp(10, 3_600);
  Duration::from_secs(secs)
}

#[derive(Deserialize)]
struct DispatchRequest {
  now_ms: i64,
  #[serde(default)]
  force: bool,
}

async fn handle_dispatch(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
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

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let parsed: DispatchRequest = serde_json::from_slice(&body).map_err(|e| -> Error {
    Box::new(std::io::Error::other(format!("invalid json body: {e}")))
  })?;

  if parsed.now_ms <= 0 {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "now_ms is required"}),
    );
  }

  let now = Utc
    .timestamp_millis_opt(parsed.now_ms)
    .single()
    .unwrap_or_else(Utc::now);
  let period = ReportPeriod::previous_month(now);

  let ctx = AppContext::from_env().await.map_err(|e| -> Error { Box::new(e) })?;

  let (cancel_tx, cancel_rx) = watch::channel(false);
  let deadline = job_deadline();
  let timer = tokio::spawn(async move {
    tokio::time::sleep(deadline).await;
    tracing::warn!(deadline_secs = deadline.as_secs(), "monthly job deadline reached; cancelling queued tenants");
    let _ = cancel_tx.send(true);
  });

  let result = ctx.pipeline.run_monthly(period, parsed.force, cancel_rx).await;
  timer.abort();
  let summary = result.map_err(|e| -> Error { Box::new(e) })?;

  json_response(
    StatusCode::OK,
    serde_json::json!({"ok": true, "summary": summary}),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_dispatch(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let response = handle_dispatch(&Method::POST, &headers, Bytes::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn returns_not_configured_when_tidb_env_missing() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");
    std::env::remove_var("TIDB_DATABASE_URL");
    std::env::remove_var("DATABASE_URL");

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    headers.insert("content-type", "application/json".parse().unwrap());

    let body = Bytes::from(r#"{"now_ms":1717200000000}"#);
    let response = handle_dispatch(&Method::POST, &headers, body).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
  }

  #[test]
  fn deadline_is_clamped() {
    std::env::set_var("MONTHLY_JOB_DEADLINE_SECS", "1");
    assert_eq!(job_deadline(), Duration::from_secs(10));
    std::env::remove_var("MONTHLY_JOB_DEADLINE_SECS");
  }
}

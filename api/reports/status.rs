use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use report_flux::app::AppContext;
use report_flux::models::{ReportArtifact, ReportRun};
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

fn query_value<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
  let query = query?;
  for part in query.split('&') {
    let (k, v) = part.split_once('=').unwrap_or((part, ""));
    if k == key {
      return Some(v);
    }
  }
  None
}

/// PDF bytes are never returned here; only the checksum.
fn status_json(run: Option<&ReportRun>, artifact: Option<&ReportArtifact>) -> serde_json::Value {
  serde_json::json!({
    "ok": true,
    "run": run.map(|r| serde_json::json!({
      "period": r.period_key,
      "state": r.state,
      "attempt": r.attempt,
      "last_error": r.last_error,
      "updated_at": r.updated_at.to_rfc3339(),
    })),
    "artifact": artifact.map(|a| serde_json::json!({
      "period": a.period.key(),
      "generated_at": a.generated_at.to_rfc3339(),
      "pdf_sha256": a.pdf_sha256,
      "size_bytes": a.pdf_bytes.len(),
      "delivery_status": a.delivery_status,
    })),
  })
}

async fn handle_status(
  method: &Method,
  headers: &HeaderMap,
  query: Option<&str>,
) -> Result<Response<ResponseBody>, Error> {
  if method != Method::GET {
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

  let company_id = query_value(query, "company_id").unwrap_or("").trim();
  if company_id.is_empty() {
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
  let run = ctx
    .reports
    .latest_run(company_id)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
  let artifact = match &run {
    Some(run) => ctx
      .reports
      .fetch_artifact(company_id, &run.period_key)
      .await
      .map_err(|e| -> Error { Box::new(e) })?,
    None => None,
  };

  json_response(StatusCode::OK, status_json(run.as_ref(), artifact.as_ref()))
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let query = req.uri().query().map(str::to_string);
  handle_status(&method, &headers, query.as_deref()).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use report_flux::models::{DeliveryStatus, ReportPeriod, RunState};

  #[test]
  fn status_includes_checksum_but_not_pdf_bytes() {
    let period = ReportPeriod::new(2024, 5).unwrap();
    let run = ReportRun {
      company_id: "c1".to_string(),
      period_key: period.key(),
      state: RunState::Done,
      attempt: 1,
      last_error: None,
      updated_at: Utc::now(),
    };
    let artifact = ReportArtifact {
      company_id: "c1".to_string(),
      period,
      period_start: period.start(),
      period_end: period.end(),
      generated_at: Utc::now(),
      pdf_bytes: b"%PDF-1.7 secret".to_vec(),
      pdf_sha256: "ab".repeat(32),
      delivery_status: DeliveryStatus::Sent,
    };

    let body = status_json(Some(&run), Some(&artifact));
    assert_eq!(body["run"]["state"], "done");
    assert_eq!(body["artifact"]["delivery_status"], "sent");
    assert_eq!(body["artifact"]["size_bytes"], 15);
    assert!(!body.to_string().contains("secret"));
  }

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let response = handle_status(&Method::GET, &HeaderMap::new(), Some("company_id=c1"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }
}

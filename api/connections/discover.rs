use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use report_flux::app::{error_body, status_for, AppContext};
use report_flux::models::Provider;
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

async fn handle_discover(
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
  let provider = query_value(query, "provider").and_then(Provider::parse);
  let Some(provider) = provider.filter(|_| !company_id.is_empty()) else {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "company_id and a valid provider are required"}),
    );
  };
  let is_admin = query_value(query, "is_admin") == Some("true");

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let ctx = AppContext::from_env().await.map_err(|e| -> Error { Box::new(e) })?;
  match ctx.integration.discover_accounts(company_id, provider).await {
    Ok(accounts) => json_response(
      StatusCode::OK,
      serde_json::json!({"ok": true, "provider": provider, "accounts": accounts}),
    ),
    Err(err) => {
      tracing::warn!(company_id = %company_id, provider = %provider, error = %err, "account discovery failed");
      json_response(status_for(&err), error_body(&err, is_admin))
    }
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let query = req.uri().query().map(str::to_string);
  handle_discover(&method, &headers, query.as_deref()).await
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
    let response = handle_discover(&Method::GET, &headers, Some("company_id=c1&provider=video"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn rejects_unknown_provider() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    let response = handle_discover(&Method::GET, &headers, Some("company_id=c1&provider=fax"))
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }
}

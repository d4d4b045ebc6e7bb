use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use report_flux::app::{error_body, status_for, AppContext};
use report_flux::models::{ConnectionSummary, Provider};
use report_flux::providers::oauth::{exchange_code_for_tokens, oauth_client, OAuthAppConfig};
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
struct ExchangeRequest {
  company_id: String,
  provider: String,
  code: String,
  external_account_id: Option<String>,
  #[serde(default)]
  is_admin: bool,
}

async fn handle_exchange(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
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

  let parsed: ExchangeRequest = serde_json::from_slice(&body).map_err(|e| -> Error {
    Box::new(std::io::Error::other(format!("invalid json body: {e}")))
  })?;

  let provider = Provider::parse(&parsed.provider);
  let Some(provider) = provider.filter(|_| !parsed.company_id.is_empty() && !parsed.code.is_empty()) else {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "company_id, provider and code are required"}),
    );
  };

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let app = match OAuthAppConfig::from_env(provider) {
    Ok(app) => app,
    Err(err) => {
      return json_response(
        StatusCode::NOT_IMPLEMENTED,
        serde_json::json!({"ok": false, "error": "not_configured", "message": err.to_string()}),
      );
    }
  };
  let client = oauth_client(&app).map_err(|e| -> Error { Box::new(e) })?;
  let ctx = AppContext::from_env().await.map_err(|e| -> Error { Box::new(e) })?;

  let connected = async {
    let tokens = exchange_code_for_tokens(&client, provider, &parsed.code).await?;
    ctx
      .integration
      .connect_with_token(
        &parsed.company_id,
        provider,
        &tokens,
        parsed.external_account_id.as_deref(),
      )
      .await
  }
  .await;

  match connected {
    Ok(connection) => {
      tracing::info!(
        company_id = %parsed.company_id,
        provider = %provider,
        connection_id = connection.id,
        "connection created"
      );
      json_response(
        StatusCode::OK,
        serde_json::json!({"ok": true, "connection": ConnectionSummary::from(&connection)}),
      )
    }
    Err(err) => {
      tracing::warn!(company_id = %parsed.company_id, provider = %provider, error = %err, "oauth exchange failed");
      json_response(status_for(&err), error_body(&err, parsed.is_admin))
    }
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_exchange(&method, &headers, bytes).await
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
    let response = handle_exchange(&Method::POST, &headers, Bytes::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn rejects_missing_code() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    let body = Bytes::from(r#"{"company_id":"c1","provider":"video","code":""}"#);
    let response = handle_exchange(&Method::POST, &headers, body).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }
}

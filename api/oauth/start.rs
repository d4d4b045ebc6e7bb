use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use report_flux::models::Provider;
use report_flux::providers::oauth::{build_authorize_url, oauth_client, OAuthAppConfig};
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

async fn handle_start(
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
  let state = query_value(query, "state").filter(|s| !s.is_empty()).map(str::to_string);
  let (authorize_url, state) = build_authorize_url(&client, &app, state);

  tracing::info!(company_id = %company_id, provider = %provider, "oauth authorization started");
  json_response(
    StatusCode::OK,
    serde_json::json!({"ok": true, "provider": provider, "authorize_url": authorize_url, "state": state}),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let query = req.uri().query().map(str::to_string);
  handle_start(&method, &headers, query.as_deref()).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}

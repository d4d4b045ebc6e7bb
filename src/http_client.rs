use std::sync::OnceLock;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;

use crate::error::{PipelineError, PipelineResult};

pub type HttpsClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// Client shape the video Data API SDK expects; it sends its own body type.
pub type SdkClient = google_youtube3::common::Client<HttpsConnector<HttpConnector>>;

static SHARED_CLIENT: OnceLock<HttpsClient> = OnceLock::new();
static SHARED_SDK_CLIENT: OnceLock<SdkClient> = OnceLock::new();

fn https_connector() -> Result<HttpsConnector<HttpConnector>, std::io::Error> {
  Ok(
    hyper_rustls::HttpsConnectorBuilder::new()
      .with_native_roots()?
      // Plain http stays allowed so local mock servers work.
      .https_or_http()
      .enable_http1()
      .build(),
  )
}

fn shared<C: Clone>(cell: &OnceLock<C>, build: impl FnOnce(HttpsConnector<HttpConnector>) -> C) -> PipelineResult<C> {
  if let Some(client) = cell.get() {
    return Ok(client.clone());
  }

  let connector =
    https_connector().map_err(|e| PipelineError::Config(format!("failed to build https client: {e}")))?;
  let client = build(connector);
  let _ = cell.set(client.clone());
  Ok(client)
}

/// Process-wide client; the connection pool is shared by every connector.
pub fn shared_https_client() -> PipelineResult<HttpsClient> {
  shared(&SHARED_CLIENT, |connector| {
    Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector)
  })
}

pub fn shared_sdk_client() -> PipelineResult<SdkClient> {
  shared(&SHARED_SDK_CLIENT, |connector| {
    Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector)
  })
}

pub mod aggregator;
pub mod oauth;
pub mod social_graph;
pub mod video;

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use http_body_util::{BodyExt, Empty};
use hyper::header::{ACCEPT, AUTHORIZATION, RETRY_AFTER};
use hyper::{Method, Request, StatusCode};
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};
use crate::http_client::{shared_https_client, HttpsClient};
use crate::models::{DateRange, ExternalAccount, MetricFetch, MetricPoint, MetricSeries, Provider};

/// One implementation per platform. Each owns its wire format, pagination and rate budget.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
  fn provider(&self) -> Provider;

  async fn discover_accounts(&self, access_token: &str) -> PipelineResult<Vec<ExternalAccount>>;

  /// One series per requested key, one point per day of `range`. Days without data are gaps.
  async fn fetch_metrics(
    &self,
    access_token: &str,
    account_id: &str,
    range: DateRange,
    metric_keys: &[String],
  ) -> PipelineResult<MetricFetch>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
  pub base: Duration,
  pub cap: Duration,
  pub max_attempts: u32,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(1),
      cap: Duration::from_secs(30),
      max_attempts: 5,
    }
  }
}

impl BackoffPolicy {
  /// Delay after the `attempt`-th failure (1-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    self.base.saturating_mul(1u32 << exp).min(self.cap)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderLimits {
  pub requests_per_minute: u32,
  pub burst: u32,
}

pub type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

impl ProviderLimits {
  pub fn unlimited() -> Self {
    Self {
      requests_per_minute: 600_000,
      burst: 10_000,
    }
  }

  pub fn limiter(&self) -> DirectLimiter {
    let per_minute = NonZeroU32::new(self.requests_per_minute).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_minute(per_minute).allow_burst(burst))
  }
}

pub(crate) enum RequestFailure {
  Retryable {
    message: String,
    retry_after: Option<Duration>,
  },
  Fatal(PipelineError),
}

/// Exponential backoff, stretched to a server's `Retry-After` but never past the cap.
fn retry_delay(backoff: &BackoffPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
  backoff
    .delay_for(attempt)
    .max(retry_after.unwrap_or_default())
    .min(backoff.cap)
}

fn truncate_string(value: &str, max_chars: usize) -> String {
  value.chars().take(max_chars).collect()
}

/// Rate-limited, retrying JSON GET shared by the connector variants.
pub struct ProviderHttp {
  provider: Provider,
  client: HttpsClient,
  limiter: DirectLimiter,
  backoff: BackoffPolicy,
  timeout: Duration,
}

impl ProviderHttp {
  pub fn new(
    provider: Provider,
    limits: ProviderLimits,
    backoff: BackoffPolicy,
    timeout: Duration,
  ) -> PipelineResult<Self> {
    Ok(Self {
      provider,
      client: shared_https_client()?,
      limiter: limits.limiter(),
      backoff,
      timeout,
    })
  }

  pub fn provider(&self) -> Provider {
    self.provider
  }

  pub async fn get_json(&self, url: &str, access_token: &str) -> PipelineResult<Value> {
    self.with_retry(|| self.send_once(url, access_token)).await
  }

  /// Runs one provider call under the rate limiter, the per-request timeout and the backoff
  /// policy. Retryable failures are retried until `max_attempts`, then surface as
  /// `ProviderUnavailable`.
  pub(crate) async fn with_retry<T, F, Fut>(&self, mut call: F) -> PipelineResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestFailure>>,
  {
    let mut attempt = 0u32;
    loop {
      attempt += 1;
      self.limiter.until_ready().await;

      let outcome = tokio::time::timeout(self.timeout, call()).await;
      let (message, retry_after) = match outcome {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(RequestFailure::Fatal(err))) => return Err(err),
        Ok(Err(RequestFailure::Retryable {
          message,
          retry_after,
        })) => (message, retry_after),
        Err(_) => (format!("timed out after {}s", self.timeout.as_secs()), None),
      };

      if attempt >= self.backoff.max_attempts {
        return Err(PipelineError::ProviderUnavailable {
          provider: self.provider,
          attempts: attempt,
          message,
        });
      }

      let delay = retry_delay(&self.backoff, attempt, retry_after);
      tracing::debug!(
        provider = %self.provider,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %message,
        "retrying provider request"
      );
      tokio::time::sleep(delay).await;
    }
  }

  async fn send_once(&self, url: &str, access_token: &str) -> Result<Value, RequestFailure> {
    let req = Request::builder()
      .method(Method::GET)
      .uri(url)
      .header(AUTHORIZATION, format!("Bearer {}", access_token))
      .header(ACCEPT, "application/json")
      .body(Empty::<Bytes>::new())
      .map_err(|e| {
        RequestFailure::Fatal(PipelineError::ProviderUnavailable {
          provider: self.provider,
          attempts: 1,
          message: format!("invalid request: {e}"),
        })
      })?;

    let resp = self.client.request(req).await.map_err(|e| RequestFailure::Retryable {
      message: e.to_string(),
      retry_after: None,
    })?;

    let status = resp.status();
    let retry_after = resp
      .headers()
      .get(RETRY_AFTER)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.trim().parse::<u64>().ok())
      .map(Duration::from_secs);
    let body_bytes = resp
      .into_body()
      .collect()
      .await
      .map_err(|e| RequestFailure::Retryable {
        message: e.to_string(),
        retry_after: None,
      })?
      .to_bytes();

    if status.is_success() {
      return serde_json::from_slice::<Value>(&body_bytes).map_err(|e| {
        RequestFailure::Fatal(PipelineError::ProviderUnavailable {
          provider: self.provider,
          attempts: 1,
          message: format!("invalid json response: {e}"),
        })
      });
    }

    let snippet = truncate_string(&String::from_utf8_lossy(&body_bytes), 300);
    let message = format!("HTTP {}: {}", status.as_u16(), snippet);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
      return Err(RequestFailure::Fatal(PipelineError::Auth {
        provider: self.provider,
        message,
      }));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
      return Err(RequestFailure::Retryable {
        message,
        retry_after,
      });
    }
    Err(RequestFailure::Fatal(PipelineError::ProviderUnavailable {
      provider: self.provider,
      attempts: 1,
      message,
    }))
  }
}

/// Percent-encodes a query value.
pub(crate) fn encode_query_value(value: &str) -> String {
  oauth2::url::form_urlencoded::byte_serialize(value.trim().as_bytes()).collect()
}

/// Percent-encodes a single path segment. `byte_serialize` writes spaces as `+`, which a path
/// would read literally.
pub(crate) fn encode_path_segment(value: &str) -> String {
  encode_query_value(value).replace('+', "%20")
}

/// Comma-joined list of individually encoded values.
pub(crate) fn encode_query_list(values: &[String]) -> String {
  values
    .iter()
    .map(|v| encode_query_value(v))
    .collect::<Vec<_>>()
    .join(",")
}

/// Reads a metric cell. Objects (breakdowns) are summed; anything non-numeric is a gap.
pub(crate) fn json_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok(),
    Value::Object(map) => {
      let values = map.values().filter_map(json_number).collect::<Vec<_>>();
      if values.is_empty() {
        None
      } else {
        Some(values.iter().sum())
      }
    }
    _ => None,
  }
}

pub(crate) fn parse_day(value: &str) -> Option<NaiveDate> {
  let day = value.get(..10)?;
  NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Collects provider rows into dense per-day series.
pub(crate) struct SeriesBuilder {
  provider: Provider,
  account_id: String,
  values: HashMap<(String, NaiveDate), f64>,
}

impl SeriesBuilder {
  pub fn new(provider: Provider, account_id: &str) -> Self {
    Self {
      provider,
      account_id: account_id.to_string(),
      values: HashMap::new(),
    }
  }

  /// Rows for the same (key, day) are summed; a `None` value leaves the day as a gap.
  pub fn add(&mut self, metric_key: &str, date: NaiveDate, value: Option<f64>) {
    if let Some(value) = value {
      *self
        .values
        .entry((metric_key.to_string(), date))
        .or_insert(0.0) += value;
    }
  }

  pub fn finish(self, range: DateRange, metric_keys: &[String], partial: bool) -> MetricFetch {
    let days = range.days();
    let series = metric_keys
      .iter()
      .map(|key| MetricSeries {
        provider: self.provider,
        account_id: self.account_id.clone(),
        metric_key: key.clone(),
        points: days
          .iter()
          .map(|day| MetricPoint {
            date: *day,
            value: self.values.get(&(key.clone(), *day)).copied(),
          })
          .collect(),
      })
      .collect();
    MetricFetch { series, partial }
  }
}

/// Applies the partial-page rule: the first page failing is an error, later pages only
/// mark the result partial.
pub(crate) fn page_failure(
  provider: Provider,
  account_id: &str,
  page: u32,
  err: PipelineError,
) -> PipelineResult<()> {
  if page <= 1 || err.is_auth() {
    return Err(err);
  }
  tracing::warn!(
    provider = %provider,
    account_id = %account_id,
    page,
    error = %err,
    "page fetch failed; returning partial data"
  );
  Ok(())
}

//! Video analytics.
//!
//! Channels are discovered through the Data API SDK, under the same limiter and backoff as
//! every other request. Daily metrics come from the analytics `v2/reports` endpoint, paged
//! with `startIndex`/`maxResults`.

use async_trait::async_trait;
use serde_json::Value;

use super::{
  encode_query_list, encode_query_value, json_number, page_failure, parse_day, ProviderConnector,
  ProviderHttp, RequestFailure, SeriesBuilder,
};
use crate::error::{PipelineError, PipelineResult};
use crate::http_client::shared_sdk_client;
use crate::models::{DateRange, ExternalAccount, MetricFetch, Provider};

const DEFAULT_MAX_RESULTS: u32 = 200;
const MAX_PAGES: u32 = 200;

pub struct VideoConnector {
  http: ProviderHttp,
  analytics_base_url: String,
  data_api_base_url: String,
  max_results: u32,
}

pub fn build_reports_url(
  base_url: &str,
  channel_id: &str,
  range: DateRange,
  metric_keys: &[String],
  start_index: u32,
  max_results: u32,
) -> String {
  let base = base_url.trim_end_matches('/');
  format!(
    "{base}/v2/reports?ids=channel=={}&startDate={}&endDate={}&metrics={}&dimensions=day&sort=day&startIndex={}&maxResults={}",
    encode_query_value(channel_id),
    range.start,
    range.end,
    encode_query_list(metric_keys),
    start_index,
    max_results
  )
}

/// Returns the number of rows read.
fn collect_report_rows(json: &Value, metric_keys: &[String], builder: &mut SeriesBuilder) -> usize {
  let headers = json
    .get("columnHeaders")
    .and_then(|v| v.as_array())
    .map(|arr| {
      arr
        .iter()
        .map(|h| h.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string())
        .collect::<Vec<_>>()
    })
    .unwrap_or_default();

  let Some(idx_day) = headers.iter().position(|h| h == "day") else {
    return 0;
  };
  let metric_idx = metric_keys
    .iter()
    .map(|key| (key, headers.iter().position(|h| h == key)))
    .collect::<Vec<_>>();

  let Some(rows) = json.get("rows").and_then(|v| v.as_array()) else {
    return 0;
  };

  for row in rows {
    let Some(arr) = row.as_array() else {
      continue;
    };
    let Some(day) = arr.get(idx_day).and_then(|v| v.as_str()).and_then(parse_day) else {
      continue;
    };
    for (key, idx) in &metric_idx {
      let value = idx.and_then(|i| arr.get(i)).and_then(json_number);
      builder.add(key, day, value);
    }
  }
  rows.len()
}

/// HTTP status carried by an SDK error, read from the JSON error body or the raw response.
fn sdk_status(message: &str) -> Option<u16> {
  let compact = message.replace(' ', "");
  ["\"code\":", "status:"].iter().find_map(|needle| {
    let rest = &compact[compact.find(needle)? + needle.len()..];
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).collect::<String>();
    digits.parse().ok()
  })
}

fn classify_sdk_error(err: google_youtube3::Error) -> RequestFailure {
  let transport = matches!(
    err,
    google_youtube3::Error::HttpError(_) | google_youtube3::Error::Io(_)
  );
  let message = err.to_string();
  match sdk_status(&message) {
    Some(401 | 403) => RequestFailure::Fatal(PipelineError::Auth {
      provider: Provider::Video,
      message,
    }),
    Some(status) if status == 429 || status >= 500 => RequestFailure::Retryable {
      message,
      retry_after: None,
    },
    None if transport => RequestFailure::Retryable {
      message,
      retry_after: None,
    },
    _ => RequestFailure::Fatal(PipelineError::ProviderUnavailable {
      provider: Provider::Video,
      attempts: 1,
      message,
    }),
  }
}

impl VideoConnector {
  pub fn new(analytics_base_url: &str, data_api_base_url: &str, http: ProviderHttp) -> Self {
    Self {
      http,
      analytics_base_url: analytics_base_url.to_string(),
      data_api_base_url: data_api_base_url.to_string(),
      max_results: DEFAULT_MAX_RESULTS,
    }
  }

  pub fn with_max_results(mut self, max_results: u32) -> Self {
    self.max_results = max_results.max(1);
    self
  }
}

#[async_trait]
impl ProviderConnector for VideoConnector {
  fn provider(&self) -> Provider {
    Provider::Video
  }

  async fn discover_accounts(&self, access_token: &str) -> PipelineResult<Vec<ExternalAccount>> {
    let mut hub = google_youtube3::YouTube::new(shared_sdk_client()?, access_token.to_string());
    hub.base_url(self.data_api_base_url.clone());
    hub.root_url(self.data_api_base_url.clone());

    let hub = &hub;
    let response = self
      .http
      .with_retry(|| async move {
        hub
          .channels()
          .list(&vec!["id".into(), "snippet".into()])
          .mine(true)
          .doit()
          .await
          .map(|(_, response)| response)
          .map_err(classify_sdk_error)
      })
      .await?;

    Ok(
      response
        .items
        .unwrap_or_default()
        .into_iter()
        .filter_map(|channel| {
          let id = channel.id?;
          let name = channel
            .snippet
            .and_then(|s| s.title)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| id.clone());
          Some(ExternalAccount { id, name })
        })
        .collect(),
    )
  }

  async fn fetch_metrics(
    &self,
    access_token: &str,
    account_id: &str,
    range: DateRange,
    metric_keys: &[String],
  ) -> PipelineResult<MetricFetch> {
    let mut builder = SeriesBuilder::new(Provider::Video, account_id);
    let mut partial = false;
    let mut start_index = 1;

    for page in 1..=MAX_PAGES {
      let url = build_reports_url(
        &self.analytics_base_url,
        account_id,
        range,
        metric_keys,
        start_index,
        self.max_results,
      );
      let json = match self.http.get_json(&url, access_token).await {
        Ok(json) => json,
        Err(err) => {
          page_failure(Provider::Video, account_id, page, err)?;
          partial = true;
          break;
        }
      };
      let read = collect_report_rows(&json, metric_keys, &mut builder);
      if (read as u32) < self.max_results {
        break;
      }
      start_index += self.max_results;
    }

    Ok(builder.finish(range, metric_keys, partial))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::providers::{BackoffPolicy, ProviderLimits};
  use crate::test_support::{query_param, spawn_mock};
  use chrono::NaiveDate;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn fast_http() -> ProviderHttp {
    ProviderHttp::new(
      Provider::Video,
      ProviderLimits::unlimited(),
      BackoffPolicy {
        base: Duration::from_millis(0),
        cap: Duration::from_millis(0),
        max_attempts: 2,
      },
      Duration::from_secs(5),
    )
    .unwrap()
  }

  fn range() -> DateRange {
    DateRange::new(
      NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
      NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
    )
    .unwrap()
  }

  #[test]
  fn reports_url_targets_channel_by_day() {
    let url = build_reports_url(
      "https://analytics.example/",
      "UC1",
      range(),
      &["views".to_string(), "estimatedMinutesWatched".to_string()],
      3,
      2,
    );
    assert_eq!(
      url,
      "https://analytics.example/v2/reports?ids=channel==UC1&startDate=2024-05-01&endDate=2024-05-03&metrics=views,estimatedMinutesWatched&dimensions=day&sort=day&startIndex=3&maxResults=2"
    );
  }

  #[test]
  fn status_is_read_from_sdk_errors() {
    assert_eq!(
      sdk_status(r#"Bad Request: {"error":{"code":401,"message":"Invalid Credentials"}}"#),
      Some(401)
    );
    assert_eq!(
      sdk_status("Http status indicates failure: Response { status: 503, version: HTTP/1.1 }"),
      Some(503)
    );
    assert_eq!(sdk_status("connection reset by peer"), None);
  }

  #[test]
  fn reports_url_encodes_channel_id() {
    let url = build_reports_url("https://analytics.example", "UC a&b", range(), &["views".to_string()], 1, 10);
    assert!(url.contains("ids=channel==UC+a%26b&startDate="));
  }

  #[tokio::test]
  async fn pages_until_a_short_page() {
    let server = spawn_mock(|pq: &str| {
      let body = match query_param(pq, "startIndex") {
        Some("1") => r#"{"columnHeaders":[{"name":"day"},{"name":"views"}],
          "rows":[["2024-05-01",100],["2024-05-02",200]]}"#,
        _ => r#"{"columnHeaders":[{"name":"day"},{"name":"views"}],"rows":[["2024-05-03",300]]}"#,
      };
      (200, body.to_string())
    })
    .await;
    let connector =
      VideoConnector::new(&server.base_url, &server.base_url, fast_http()).with_max_results(2);

    let fetch = connector
      .fetch_metrics("tok", "UC1", range(), &["views".to_string(), "likes".to_string()])
      .await
      .unwrap();
    assert!(!fetch.partial);
    assert_eq!(
      fetch.series[0].points.iter().map(|p| p.value).collect::<Vec<_>>(),
      vec![Some(100.0), Some(200.0), Some(300.0)]
    );
    // Not in the response headers at all.
    assert!(fetch.series[1].points.iter().all(|p| p.value.is_none()));
    assert_eq!(server.hit_count(), 2);
  }

  #[tokio::test]
  async fn second_page_failure_is_partial() {
    let server = spawn_mock(|pq: &str| match query_param(pq, "startIndex") {
      Some("1") => (
        200,
        r#"{"columnHeaders":[{"name":"day"},{"name":"views"}],"rows":[["2024-05-01",1],["2024-05-02",2]]}"#
          .to_string(),
      ),
      _ => (500, "backend error".to_string()),
    })
    .await;
    let connector =
      VideoConnector::new(&server.base_url, &server.base_url, fast_http()).with_max_results(2);

    let fetch = connector
      .fetch_metrics("tok", "UC1", range(), &["views".to_string()])
      .await
      .unwrap();
    assert!(fetch.partial);
    assert_eq!(fetch.series[0].points[2].value, None);
  }

  #[tokio::test]
  async fn discovers_channels_via_sdk() {
    let server = spawn_mock(|_pq: &str| {
      (
        200,
        r#"{"kind":"youtube#channelListResponse","items":[{"id":"UC123","snippet":{"title":"Acme Videos"}}]}"#
          .to_string(),
      )
    })
    .await;
    let connector = VideoConnector::new(&server.base_url, &server.base_url, fast_http());

    let accounts = connector.discover_accounts("token123").await.unwrap();
    assert_eq!(
      accounts,
      vec![ExternalAccount {
        id: "UC123".to_string(),
        name: "Acme Videos".to_string()
      }]
    );
    assert!(server.requested()[0].contains("mine=true"));
  }

  #[tokio::test]
  async fn discovery_retries_server_errors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = spawn_mock({
      let calls = calls.clone();
      move |_pq: &str| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
          return (503, "backend error".to_string());
        }
        (
          200,
          r#"{"kind":"youtube#channelListResponse","items":[{"id":"UC9","snippet":{"title":""}}]}"#.to_string(),
        )
      }
    })
    .await;
    let connector = VideoConnector::new(&server.base_url, &server.base_url, fast_http());

    let accounts = connector.discover_accounts("token123").await.unwrap();
    assert_eq!(accounts[0].id, "UC9");
    assert_eq!(accounts[0].name, "UC9");
    assert_eq!(server.hit_count(), 2);
  }

  #[tokio::test]
  async fn discovery_auth_error_is_not_retried() {
    let server = spawn_mock(|_pq: &str| {
      (
        401,
        r#"{"error":{"code":401,"message":"Invalid Credentials"}}"#.to_string(),
      )
    })
    .await;
    let connector = VideoConnector::new(&server.base_url, &server.base_url, fast_http());

    let err = connector.discover_accounts("token123").await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(server.hit_count(), 1);
  }
}

//! Social graph insights API.
//!
//! Cursor pagination: each response may carry `paging.next`, the URL of the following page.
//! Daily values are stamped with the *end* of their window, so a value ending at
//! `2024-05-02T07:00:00+0000` belongs to 2024-05-01.

use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;

use super::{
  encode_path_segment, encode_query_list, json_number, page_failure, parse_day, ProviderConnector,
  ProviderHttp, SeriesBuilder,
};
use crate::error::PipelineResult;
use crate::models::{DateRange, ExternalAccount, MetricFetch, Provider};

const MAX_PAGES: u32 = 200;

pub struct SocialGraphConnector {
  http: ProviderHttp,
  base_url: String,
}

fn with_trailing_slash(base_url: &str) -> String {
  if base_url.ends_with('/') {
    base_url.to_string()
  } else {
    format!("{base_url}/")
  }
}

pub fn build_accounts_url(base_url: &str) -> String {
  format!("{}me/accounts?fields=id,name&limit=100", with_trailing_slash(base_url))
}

pub fn build_insights_url(base_url: &str, account_id: &str, range: DateRange, metric_keys: &[String]) -> String {
  // `until` is exclusive upstream.
  let until = range.end + Duration::days(1);
  format!(
    "{}{}/insights?metric={}&period=day&since={}&until={}",
    with_trailing_slash(base_url),
    encode_path_segment(account_id),
    encode_query_list(metric_keys),
    range.start,
    until
  )
}

impl SocialGraphConnector {
  pub fn new(base_url: &str, http: ProviderHttp) -> Self {
    Self {
      http,
      base_url: base_url.to_string(),
    }
  }

  fn resolve_next(&self, json: &Value) -> Option<String> {
    let next = json
      .get("paging")
      .and_then(|p| p.get("next"))
      .and_then(|v| v.as_str())
      .map(str::trim)
      .filter(|v| !v.is_empty())?;
    if next.starts_with("http://") || next.starts_with("https://") {
      Some(next.to_string())
    } else {
      Some(format!(
        "{}{}",
        with_trailing_slash(&self.base_url),
        next.trim_start_matches('/')
      ))
    }
  }
}

fn parse_accounts(json: &Value) -> Vec<ExternalAccount> {
  json
    .get("data")
    .and_then(|v| v.as_array())
    .map(|rows| {
      rows
        .iter()
        .filter_map(|row| {
          let id = row.get("id").and_then(|v| v.as_str())?.to_string();
          let name = row
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(id.as_str())
            .to_string();
          Some(ExternalAccount { id, name })
        })
        .collect()
    })
    .unwrap_or_default()
}

fn collect_insights(json: &Value, metric_keys: &[String], builder: &mut SeriesBuilder) {
  let Some(metrics) = json.get("data").and_then(|v| v.as_array()) else {
    return;
  };
  for metric in metrics {
    let Some(name) = metric.get("name").and_then(|v| v.as_str()) else {
      continue;
    };
    if !metric_keys.iter().any(|k| k == name) {
      continue;
    }
    let Some(values) = metric.get("values").and_then(|v| v.as_array()) else {
      continue;
    };
    for value in values {
      let Some(end_day) = value.get("end_time").and_then(|v| v.as_str()).and_then(parse_day) else {
        continue;
      };
      let day = end_day - Duration::days(1);
      builder.add(name, day, value.get("value").and_then(json_number));
    }
  }
}

#[async_trait]
impl ProviderConnector for SocialGraphConnector {
  fn provider(&self) -> Provider {
    Provider::SocialGraph
  }

  async fn discover_accounts(&self, access_token: &str) -> PipelineResult<Vec<ExternalAccount>> {
    let mut accounts = Vec::new();
    let mut url = Some(build_accounts_url(&self.base_url));
    let mut pages = 0;
    while let Some(current) = url.take() {
      pages += 1;
      if pages > MAX_PAGES {
        break;
      }
      let json = self.http.get_json(&current, access_token).await?;
      accounts.extend(parse_accounts(&json));
      url = self.resolve_next(&json);
    }
    Ok(accounts)
  }

  async fn fetch_metrics(
    &self,
    access_token: &str,
    account_id: &str,
    range: DateRange,
    metric_keys: &[String],
  ) -> PipelineResult<MetricFetch> {
    let mut builder = SeriesBuilder::new(Provider::SocialGraph, account_id);
    let mut partial = false;
    let mut url = Some(build_insights_url(&self.base_url, account_id, range, metric_keys));
    let mut page = 0;

    while let Some(current) = url.take() {
      page += 1;
      if page > MAX_PAGES {
        break;
      }
      let json = match self.http.get_json(&current, access_token).await {
        Ok(json) => json,
        Err(err) => {
          page_failure(Provider::SocialGraph, account_id, page, err)?;
          partial = true;
          break;
        }
      };
      collect_insights(&json, metric_keys, &mut builder);
      url = self.resolve_next(&json);
    }

    Ok(builder.finish(range, metric_keys, partial))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::providers::{BackoffPolicy, ProviderLimits};
  use crate::test_support::spawn_mock;
  use chrono::NaiveDate;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration as StdDuration;

  fn fast_http() -> ProviderHttp {
    ProviderHttp::new(
      Provider::SocialGraph,
      ProviderLimits::unlimited(),
      BackoffPolicy {
        base: StdDuration::from_millis(0),
        cap: StdDuration::from_millis(0),
        max_attempts: 2,
      },
      StdDuration::from_secs(5),
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
  fn insights_url_uses_exclusive_until() {
    let url = build_insights_url(
      "https://graph.example/v19.0",
      "page-1",
      range(),
      &["page_impressions".to_string()],
    );
    assert_eq!(
      url,
      "https://graph.example/v19.0/page-1/insights?metric=page_impressions&period=day&since=2024-05-01&until=2024-05-04"
    );
  }

  #[test]
  fn insights_url_encodes_account_segment() {
    let url = build_insights_url("https://graph.example/", "page 1/x", range(), &["a&b".to_string()]);
    assert_eq!(
      url,
      "https://graph.example/page%201%2Fx/insights?metric=a%26b&period=day&since=2024-05-01&until=2024-05-04"
    );
  }

  #[tokio::test]
  async fn server_error_is_retried_before_failing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = spawn_mock({
      let calls = calls.clone();
      move |_pq: &str| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
          return (500, "temporarily down".to_string());
        }
        (
          200,
          r#"{"data":[{"name":"page_impressions","values":[{"value":7,"end_time":"2024-05-02T07:00:00+0000"}]}]}"#
            .to_string(),
        )
      }
    })
    .await;
    let connector = SocialGraphConnector::new(&server.base_url, fast_http());

    let keys = vec!["page_impressions".to_string()];
    let fetch = connector.fetch_metrics("tok", "page-1", range(), &keys).await.unwrap();
    assert!(!fetch.partial);
    assert_eq!(fetch.series[0].points[0].value, Some(7.0));
    assert_eq!(server.hit_count(), 2);
  }

  #[tokio::test]
  async fn follows_cursor_and_shifts_end_time() {
    let server = spawn_mock(|pq: &str| {
      if pq.contains("after=c2") {
        return (
          200,
          r#"{"data":[{"name":"page_impressions","period":"day","values":[
            {"value":30,"end_time":"2024-05-04T07:00:00+0000"}
          ]}]}"#
            .to_string(),
        );
      }
      (
        200,
        r#"{"data":[
          {"name":"page_impressions","period":"day","values":[
            {"value":10,"end_time":"2024-05-02T07:00:00+0000"},
            {"value":null,"end_time":"2024-05-03T07:00:00+0000"}
          ]},
          {"name":"page_fans_city","period":"day","values":[
            {"value":{"Berlin":4,"Paris":6},"end_time":"2024-05-02T07:00:00+0000"}
          ]}
        ],"paging":{"next":"page-1/insights?metric=page_impressions&after=c2"}}"#
          .to_string(),
      )
    })
    .await;
    let connector = SocialGraphConnector::new(&server.base_url, fast_http());

    let keys = vec!["page_impressions".to_string(), "page_fans_city".to_string()];
    let fetch = connector.fetch_metrics("tok", "page-1", range(), &keys).await.unwrap();
    assert!(!fetch.partial);
    assert_eq!(
      fetch.series[0].points.iter().map(|p| p.value).collect::<Vec<_>>(),
      vec![Some(10.0), None, Some(30.0)]
    );
    assert_eq!(fetch.series[1].points[0].value, Some(10.0));
    assert_eq!(server.hit_count(), 2);
  }

  #[tokio::test]
  async fn cursor_failure_returns_partial() {
    let server = spawn_mock(|pq: &str| {
      if pq.contains("after=") {
        return (503, "unavailable".to_string());
      }
      (
        200,
        r#"{"data":[{"name":"page_impressions","values":[{"value":5,"end_time":"2024-05-02T07:00:00+0000"}]}],
           "paging":{"next":"page-1/insights?after=c2"}}"#
          .to_string(),
      )
    })
    .await;
    let connector = SocialGraphConnector::new(&server.base_url, fast_http());

    let keys = vec!["page_impressions".to_string()];
    let fetch = connector.fetch_metrics("tok", "page-1", range(), &keys).await.unwrap();
    assert!(fetch.partial);
    assert_eq!(fetch.series[0].points[0].value, Some(5.0));
  }

  #[tokio::test]
  async fn discovers_pages_across_cursor() {
    let server = spawn_mock(|pq: &str| {
      if pq.contains("after=x") {
        return (200, r#"{"data":[{"id":"p2","name":"Second"}]}"#.to_string());
      }
      (
        200,
        r#"{"data":[{"id":"p1","name":"First"}],"paging":{"next":"/me/accounts?after=x"}}"#.to_string(),
      )
    })
    .await;
    let connector = SocialGraphConnector::new(&server.base_url, fast_http());
    let accounts = connector.discover_accounts("tok").await.unwrap();
    assert_eq!(
      accounts.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
      vec!["p1", "p2"]
    );
  }
}

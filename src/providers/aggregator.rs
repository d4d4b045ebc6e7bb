//! Multi-platform ad-data aggregator.
//!
//! JSON REST with bearer auth and numbered pages: every response carries
//! `"next_page": <n>` or `null`. Data rows are flat objects keyed by field name.

use async_trait::async_trait;
use serde_json::Value;

use super::{
  encode_query_list, encode_query_value, json_number, page_failure, parse_day, ProviderConnector,
  ProviderHttp, SeriesBuilder,
};
use crate::error::PipelineResult;
use crate::models::{DateRange, ExternalAccount, MetricFetch, Provider};

const DEFAULT_PAGE_SIZE: u32 = 500;
/// Guards against a server that never stops announcing a next page.
const MAX_PAGES: u32 = 200;

pub struct AggregatorConnector {
  http: ProviderHttp,
  base_url: String,
  page_size: u32,
}

fn with_trailing_slash(base_url: &str) -> String {
  if base_url.ends_with('/') {
    base_url.to_string()
  } else {
    format!("{base_url}/")
  }
}

pub fn build_accounts_url(base_url: &str, page: u32) -> String {
  format!("{}v1/accounts?page={page}", with_trailing_slash(base_url))
}

pub fn build_data_url(
  base_url: &str,
  account_id: &str,
  range: DateRange,
  metric_keys: &[String],
  page: u32,
  page_size: u32,
) -> String {
  format!(
    "{}v1/data?account_id={}&date_from={}&date_to={}&fields=date,{}&page={}&page_size={}",
    with_trailing_slash(base_url),
    encode_query_value(account_id),
    range.start,
    range.end,
    encode_query_list(metric_keys),
    page,
    page_size
  )
}

fn next_page(json: &Value) -> Option<u32> {
  json
    .get("next_page")
    .and_then(|v| v.as_u64())
    .map(|v| v as u32)
}

fn parse_accounts(json: &Value) -> Vec<ExternalAccount> {
  json
    .get("data")
    .and_then(|v| v.as_array())
    .map(|rows| {
      rows
        .iter()
        .filter_map(|row| {
          let id = row.get("id").and_then(|v| v.as_str())?.trim().to_string();
          if id.is_empty() {
            return None;
          }
          let name = row
            .get("name")
            .and_then(|v| v.as_str())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| id.clone());
          Some(ExternalAccount { id, name })
        })
        .collect()
    })
    .unwrap_or_default()
}

fn collect_rows(json: &Value, metric_keys: &[String], builder: &mut SeriesBuilder) {
  let Some(rows) = json.get("data").and_then(|v| v.as_array()) else {
    return;
  };
  for row in rows {
    let Some(date) = row.get("date").and_then(|v| v.as_str()).and_then(parse_day) else {
      continue;
    };
    for key in metric_keys {
      builder.add(key, date, row.get(key).and_then(json_number));
    }
  }
}

impl AggregatorConnector {
  pub fn new(base_url: &str, http: ProviderHttp) -> Self {
    Self {
      http,
      base_url: base_url.to_string(),
      page_size: DEFAULT_PAGE_SIZE,
    }
  }

  pub fn with_page_size(mut self, page_size: u32) -> Self {
    self.page_size = page_size.max(1);
    self
  }
}

#[async_trait]
impl ProviderConnector for AggregatorConnector {
  fn provider(&self) -> Provider {
    Provider::Aggregator
  }

  async fn discover_accounts(&self, access_token: &str) -> PipelineResult<Vec<ExternalAccount>> {
    let mut accounts = Vec::new();
    let mut page = 1;
    while page <= MAX_PAGES {
      let json = self
        .http
        .get_json(&build_accounts_url(&self.base_url, page), access_token)
        .await?;
      accounts.extend(parse_accounts(&json));
      match next_page(&json) {
        Some(next) if next > page => page = next,
        _ => break,
      }
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
    let mut builder = SeriesBuilder::new(Provider::Aggregator, account_id);
    let mut partial = false;
    let mut page = 1;

    while page <= MAX_PAGES {
      let url = build_data_url(&self.base_url, account_id, range, metric_keys, page, self.page_size);
      let json = match self.http.get_json(&url, access_token).await {
        Ok(json) => json,
        Err(err) => {
          page_failure(Provider::Aggregator, account_id, page, err)?;
          partial = true;
          break;
        }
      };
      collect_rows(&json, metric_keys, &mut builder);
      match next_page(&json) {
        Some(next) if next > page => page = next,
        _ => break,
      }
    }

    Ok(builder.finish(range, metric_keys, partial))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::PipelineError;
  use crate::providers::{BackoffPolicy, ProviderLimits};
  use crate::test_support::{query_param, spawn_mock};
  use chrono::NaiveDate;
  use std::time::Duration;

  fn fast_http() -> ProviderHttp {
    ProviderHttp::new(
      Provider::Aggregator,
      ProviderLimits::unlimited(),
      BackoffPolicy {
        base: Duration::from_millis(0),
        cap: Duration::from_millis(0),
        max_attempts: 3,
      },
      Duration::from_secs(5),
    )
    .unwrap()
  }

  fn may_2024() -> DateRange {
    DateRange::new(
      NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
      NaiveDate::from_ymd_opt(2024, 5, 5).unwrap(),
    )
    .unwrap()
  }

  fn keys() -> Vec<String> {
    vec!["clicks".to_string(), "spend".to_string()]
  }

  /// Five pages, one day each; `failing_page` always answers 500.
  fn five_page_handler(failing_page: Option<&'static str>) -> impl Fn(&str) -> (u16, String) {
    move |pq: &str| {
      let page = query_param(pq, "page").unwrap_or("1");
      if Some(page) == failing_page {
        return (500, r#"{"error":"upstream exploded"}"#.to_string());
      }
      let n: u32 = page.parse().unwrap();
      let next = if n < 5 {
        (n + 1).to_string()
      } else {
        "null".to_string()
      };
      (
        200,
        format!(
          r#"{{"data":[{{"date":"2024-05-0{n}","clicks":{clicks},"spend":"{spend}"}}],"next_page":{next}}}"#,
          clicks = n * 10,
          spend = n as f64 * 1.5,
        ),
      )
    }
  }

  #[test]
  fn data_url_includes_range_fields_and_page() {
    let url = build_data_url("https://agg.example", "acct-9", may_2024(), &keys(), 2, 100);
    assert_eq!(
      url,
      "https://agg.example/v1/data?account_id=acct-9&date_from=2024-05-01&date_to=2024-05-05&fields=date,clicks,spend&page=2&page_size=100"
    );
  }

  #[test]
  fn data_url_encodes_account_and_fields() {
    let url = build_data_url(
      "https://agg.example/",
      "acct 9&x=#1",
      may_2024(),
      &["cost/day".to_string()],
      1,
      10,
    );
    assert!(url.contains("account_id=acct+9%26x%3D%231&date_from="));
    assert!(url.contains("&fields=date,cost%2Fday&page=1"));
  }

  #[tokio::test]
  async fn follows_all_pages() {
    let server = spawn_mock(five_page_handler(None)).await;
    let connector = AggregatorConnector::new(&server.base_url, fast_http());

    let fetch = connector
      .fetch_metrics("tok", "acct-1", may_2024(), &keys())
      .await
      .unwrap();
    assert!(!fetch.partial);
    let clicks = &fetch.series[0];
    assert_eq!(clicks.metric_key, "clicks");
    assert_eq!(
      clicks.points.iter().map(|p| p.value).collect::<Vec<_>>(),
      vec![Some(10.0), Some(20.0), Some(30.0), Some(40.0), Some(50.0)]
    );
    assert_eq!(fetch.series[1].points[1].value, Some(3.0));
    assert_eq!(server.hit_count(), 5);
  }

  #[tokio::test]
  async fn failure_on_page_three_keeps_pages_one_and_two() {
    let server = spawn_mock(five_page_handler(Some("3"))).await;
    let connector = AggregatorConnector::new(&server.base_url, fast_http());

    let fetch = connector
      .fetch_metrics("tok", "acct-1", may_2024(), &keys())
      .await
      .unwrap();
    assert!(fetch.partial);
    let clicks = &fetch.series[0];
    assert_eq!(
      clicks.points.iter().map(|p| p.value).collect::<Vec<_>>(),
      vec![Some(10.0), Some(20.0), None, None, None]
    );
    // Two good pages plus three attempts at page 3.
    assert_eq!(server.hit_count(), 5);
  }

  #[tokio::test]
  async fn failure_on_first_page_surfaces_provider_unavailable() {
    let server = spawn_mock(five_page_handler(Some("1"))).await;
    let connector = AggregatorConnector::new(&server.base_url, fast_http());

    let err = connector
      .fetch_metrics("tok", "acct-1", may_2024(), &keys())
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      PipelineError::ProviderUnavailable { attempts: 3, .. }
    ));
  }

  #[tokio::test]
  async fn retries_rate_limited_requests() {
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let server = spawn_mock({
      let calls = calls.clone();
      move |_pq: &str| {
        let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n == 0 {
          (429, r#"{"error":"slow down"}"#.to_string())
        } else {
          (200, r#"{"data":[{"id":"a1","name":"Brand A"},{"id":"a2"}],"next_page":null}"#.to_string())
        }
      }
    })
    .await;
    let connector = AggregatorConnector::new(&server.base_url, fast_http());

    let accounts = connector.discover_accounts("tok").await.unwrap();
    assert_eq!(
      accounts,
      vec![
        ExternalAccount {
          id: "a1".to_string(),
          name: "Brand A".to_string()
        },
        ExternalAccount {
          id: "a2".to_string(),
          name: "a2".to_string()
        },
      ]
    );
    assert_eq!(server.hit_count(), 2);
  }

  #[tokio::test]
  async fn unauthorized_is_an_auth_error() {
    let server = spawn_mock(|_pq: &str| (401, r#"{"error":"invalid_token"}"#.to_string())).await;
    let connector = AggregatorConnector::new(&server.base_url, fast_http());
    let err = connector.discover_accounts("tok").await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(server.hit_count(), 1);
  }
}

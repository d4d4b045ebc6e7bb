use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
  Aggregator,
  SocialGraph,
  Video,
}

impl Provider {
  pub const ALL: [Provider; 3] = [Provider::Aggregator, Provider::SocialGraph, Provider::Video];

  pub fn as_str(&self) -> &'static str {
    match self {
      Provider::Aggregator => "aggregator",
      Provider::SocialGraph => "social_graph",
      Provider::Video => "video",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value.trim() {
      "aggregator" | "AGGREGATOR" => Some(Provider::Aggregator),
      "social_graph" | "SOCIAL_GRAPH" => Some(Provider::SocialGraph),
      "video" | "VIDEO" => Some(Provider::Video),
      _ => None,
    }
  }

  pub fn display_name(&self) -> &'static str {
    match self {
      Provider::Aggregator => "Ad Aggregator",
      Provider::SocialGraph => "Social Graph",
      Provider::Video => "Video Platform",
    }
  }

  /// Prefix for per-provider environment variables, e.g. `SOCIAL_GRAPH_CLIENT_ID`.
  pub fn env_prefix(&self) -> &'static str {
    match self {
      Provider::Aggregator => "AGGREGATOR",
      Provider::SocialGraph => "SOCIAL_GRAPH",
      Provider::Video => "VIDEO",
    }
  }
}

impl std::fmt::Display for Provider {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
  Pending,
  Active,
  Expired,
  Revoked,
  Error,
}

impl ConnectionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ConnectionStatus::Pending => "pending",
      ConnectionStatus::Active => "active",
      ConnectionStatus::Expired => "expired",
      ConnectionStatus::Revoked => "revoked",
      ConnectionStatus::Error => "error",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "pending" => Some(ConnectionStatus::Pending),
      "active" => Some(ConnectionStatus::Active),
      "expired" => Some(ConnectionStatus::Expired),
      "revoked" => Some(ConnectionStatus::Revoked),
      "error" => Some(ConnectionStatus::Error),
      _ => None,
    }
  }
}

/// A tenant's authorization against one external account. Token fields hold ciphertext only.
#[derive(Debug, Clone)]
pub struct Connection {
  pub id: i64,
  pub company_id: String,
  pub provider: Provider,
  pub status: ConnectionStatus,
  pub external_account_id: String,
  pub external_account_name: String,
  pub encrypted_access_token: String,
  pub encrypted_refresh_token: Option<String>,
  pub token_expires_at: Option<DateTime<Utc>>,
  pub scope: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewConnection {
  pub company_id: String,
  pub provider: Provider,
  pub external_account_id: String,
  pub external_account_name: String,
  pub encrypted_access_token: String,
  pub encrypted_refresh_token: Option<String>,
  pub token_expires_at: Option<DateTime<Utc>>,
  pub scope: Option<String>,
}

/// What the dashboard sees of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
  pub provider: Provider,
  pub status: ConnectionStatus,
  pub external_account_id: String,
  pub external_account_name: String,
}

impl From<&Connection> for ConnectionSummary {
  fn from(value: &Connection) -> Self {
    Self {
      provider: value.provider,
      status: value.status,
      external_account_id: value.external_account_id.clone(),
      external_account_name: value.external_account_name.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccount {
  pub id: String,
  pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthTokens {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub token_type: String,
  pub scope: Option<String>,
  pub expires_in_seconds: Option<u64>,
}

impl OAuthTokens {
  pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self
      .expires_in_seconds
      .map(|secs| now + Duration::seconds(secs as i64))
  }
}

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DateRange {
  pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
    if start > end {
      return None;
    }
    Some(Self { start, end })
  }

  pub fn days(&self) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut dt = self.start;
    while dt <= self.end {
      out.push(dt);
      dt += Duration::days(1);
    }
    out
  }

  pub fn contains(&self, dt: NaiveDate) -> bool {
    dt >= self.start && dt <= self.end
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportPeriod {
  pub year: i32,
  pub month: u32,
}

impl ReportPeriod {
  pub fn new(year: i32, month: u32) -> Option<Self> {
    NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
  }

  /// Parses `YYYY-MM`.
  pub fn parse(value: &str) -> Option<Self> {
    let (year, month) = value.trim().split_once('-')?;
    Self::new(year.parse().ok()?, month.parse().ok()?)
  }

  /// The last complete calendar month before `now`.
  pub fn previous_month(now: DateTime<Utc>) -> Self {
    let today = now.date_naive();
    if today.month() == 1 {
      Self {
        year: today.year() - 1,
        month: 12,
      }
    } else {
      Self {
        year: today.year(),
        month: today.month() - 1,
      }
    }
  }

  pub fn key(&self) -> String {
    format!("{:04}-{:02}", self.year, self.month)
  }

  pub fn start(&self) -> NaiveDate {
    NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
  }

  pub fn end(&self) -> NaiveDate {
    let (year, month) = if self.month == 12 {
      (self.year + 1, 1)
    } else {
      (self.year, self.month + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
      .map(|next| next - Duration::days(1))
      .unwrap_or(NaiveDate::MAX)
  }

  pub fn range(&self) -> DateRange {
    DateRange {
      start: self.start(),
      end: self.end(),
    }
  }
}

impl std::fmt::Display for ReportPeriod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.key())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
  pub date: NaiveDate,
  /// `None` marks a gap: the provider returned nothing for this day.
  pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeries {
  pub provider: Provider,
  pub account_id: String,
  pub metric_key: String,
  pub points: Vec<MetricPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricFetch {
  pub series: Vec<MetricSeries>,
  /// Set when at least one page failed after earlier pages succeeded.
  pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
  Pending,
  Sent,
  Failed,
}

impl DeliveryStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      DeliveryStatus::Pending => "pending",
      DeliveryStatus::Sent => "sent",
      DeliveryStatus::Failed => "failed",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "pending" => Some(DeliveryStatus::Pending),
      "sent" => Some(DeliveryStatus::Sent),
      "failed" => Some(DeliveryStatus::Failed),
      _ => None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct ReportArtifact {
  pub company_id: String,
  pub period: ReportPeriod,
  pub period_start: NaiveDate,
  pub period_end: NaiveDate,
  pub generated_at: DateTime<Utc>,
  pub pdf_bytes: Vec<u8>,
  pub pdf_sha256: String,
  pub delivery_status: DeliveryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
  Queued,
  Fetching,
  Rendering,
  Delivering,
  Done,
  Failed,
}

impl RunState {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunState::Queued => "queued",
      RunState::Fetching => "fetching",
      RunState::Rendering => "rendering",
      RunState::Delivering => "delivering",
      RunState::Done => "done",
      RunState::Failed => "failed",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "queued" => Some(RunState::Queued),
      "fetching" => Some(RunState::Fetching),
      "rendering" => Some(RunState::Rendering),
      "delivering" => Some(RunState::Delivering),
      "done" => Some(RunState::Done),
      "failed" => Some(RunState::Failed),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, RunState::Done | RunState::Failed)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRun {
  pub company_id: String,
  pub period_key: String,
  pub state: RunState,
  pub attempt: u32,
  pub last_error: Option<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompanyProfile {
  pub company_id: String,
  pub name: String,
  pub report_recipients: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn previous_month_wraps_year() {
    let now = Utc.with_ymd_and_hms(2025, 1, 3, 6, 0, 0).unwrap();
    assert_eq!(ReportPeriod::previous_month(now), ReportPeriod::new(2024, 12).unwrap());
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    assert_eq!(ReportPeriod::previous_month(now).key(), "2024-05");
  }

  #[test]
  fn period_range_covers_whole_month() {
    let period = ReportPeriod::parse("2024-02").unwrap();
    let range = period.range();
    assert_eq!(range.start, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
    assert_eq!(range.end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    assert_eq!(range.days().len(), 29);
    assert!(ReportPeriod::parse("2024-13").is_none());
  }

  #[test]
  fn provider_order_is_stable() {
    let mut providers = vec![Provider::Video, Provider::Aggregator, Provider::SocialGraph];
    providers.sort();
    assert_eq!(providers, Provider::ALL.to_vec());
  }
}

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::models::Provider;
use crate::providers::{BackoffPolicy, ProviderLimits};

#[derive(Debug, Clone)]
pub struct SmtpConfig {
  pub host: String,
  pub port: u16,
  pub username: String,
  pub password: String,
  pub from: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub database_url: Option<String>,
  pub encryption_key_b64: Option<String>,
  pub monthly_job_concurrency: usize,
  /// A non-terminal report run silent for longer than this is considered abandoned.
  pub run_lock_ttl: Duration,
  pub provider_timeout: Duration,
  pub token_refresh_timeout: Duration,
  pub email_timeout: Duration,
  pub email_attempts: u32,
  pub email_retry_delay: Duration,
  pub backoff: BackoffPolicy,
  pub limits: HashMap<Provider, ProviderLimits>,
  pub metric_cache_ttl: Duration,
  pub chart_catalog_path: Option<String>,
  pub api_base_urls: HashMap<Provider, String>,
  /// Channel discovery goes through the Data API, which lives on a different host.
  pub video_data_api_base_url: String,
  pub smtp: Option<SmtpConfig>,
}

fn default_api_base_url(provider: Provider) -> &'static str {
  match provider {
    Provider::Aggregator => "https://connectors.adaggregator.io/",
    Provider::SocialGraph => "https://graph.facebook.com/v19.0/",
    Provider::Video => "https://youtubeanalytics.googleapis.com/",
  }
}

fn default_requests_per_minute(provider: Provider) -> u32 {
  match provider {
    Provider::Aggregator => 60,
    Provider::SocialGraph => 120,
    Provider::Video => 300,
  }
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_clamped(value: Option<String>, default: u64, min: u64, max: u64) -> u64 {
  value
    .and_then(|v| v.trim().parse::<u64>().ok())
    .unwrap_or(default)
    .clamp(min, max)
}

impl PipelineConfig {
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Builds the config from any key lookup; `from_env` passes the process environment.
  pub fn from_lookup<F>(lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let get = |key: &str| non_empty(lookup(key));

    let backoff = BackoffPolicy {
      base: Duration::from_millis(parse_clamped(get("BACKOFF_BASE_MS"), 1_000, 0, 60_000)),
      cap: Duration::from_millis(parse_clamped(get("BACKOFF_CAP_MS"), 30_000, 0, 300_000)),
      max_attempts: parse_clamped(get("BACKOFF_MAX_ATTEMPTS"), 5, 1, 10) as u32,
    };

    let mut limits = HashMap::new();
    let mut api_base_urls = HashMap::new();
    for provider in Provider::ALL {
      let prefix = provider.env_prefix();
      let requests_per_minute = parse_clamped(
        get(&format!("PROVIDER_REQUESTS_PER_MINUTE_{prefix}")),
        default_requests_per_minute(provider) as u64,
        1,
        100_000,
      ) as u32;
      let burst = parse_clamped(get(&format!("PROVIDER_BURST_{prefix}")), 10, 1, 1_000) as u32;
      limits.insert(
        provider,
        ProviderLimits {
          requests_per_minute,
          burst,
        },
      );

      let base_url = get(&format!("{prefix}_API_BASE_URL"))
        .unwrap_or_else(|| default_api_base_url(provider).to_string());
      api_base_urls.insert(provider, base_url);
    }

    let smtp = match (get("SMTP_HOST"), get("SMTP_FROM")) {
      (Some(host), Some(from)) => Some(SmtpConfig {
        host,
        port: parse_clamped(get("SMTP_PORT"), 587, 1, 65_535) as u16,
        username: get("SMTP_USERNAME").unwrap_or_default(),
        password: get("SMTP_PASSWORD").unwrap_or_default(),
        from,
      }),
      _ => None,
    };

    Self {
      database_url: get("TIDB_DATABASE_URL").or_else(|| get("DATABASE_URL")),
      encryption_key_b64: get("CREDENTIALS_ENCRYPTION_KEY"),
      monthly_job_concurrency: parse_clamped(get("MONTHLY_JOB_CONCURRENCY"), 4, 1, 64) as usize,
      run_lock_ttl: Duration::from_secs(parse_clamped(
        get("REPORT_RUN_LOCK_TTL_SECS"),
        900,
        60,
        3_600,
      )),
      provider_timeout: Duration::from_secs(parse_clamped(get("PROVIDER_TIMEOUT_SECS"), 30, 1, 300)),
      token_refresh_timeout: Duration::from_secs(parse_clamped(
        get("TOKEN_REFRESH_TIMEOUT_SECS"),
        10,
        1,
        120,
      )),
      email_timeout: Duration::from_secs(parse_clamped(get("EMAIL_TIMEOUT_SECS"), 60, 1, 600)),
      email_attempts: parse_clamped(get("EMAIL_MAX_ATTEMPTS"), 3, 1, 10) as u32,
      email_retry_delay: Duration::from_millis(parse_clamped(
        get("EMAIL_RETRY_DELAY_MS"),
        2_000,
        0,
        60_000,
      )),
      backoff,
      limits,
      metric_cache_ttl: Duration::from_secs(parse_clamped(
        get("METRIC_CACHE_TTL_SECS"),
        6 * 3600,
        0,
        7 * 24 * 3600,
      )),
      chart_catalog_path: get("CHART_CATALOG_PATH"),
      api_base_urls,
      video_data_api_base_url: get("VIDEO_DATA_API_BASE_URL")
        .unwrap_or_else(|| "https://youtube.googleapis.com/".to_string()),
      smtp,
    }
  }

  pub fn require_database_url(&self) -> PipelineResult<&str> {
    self
      .database_url
      .as_deref()
      .ok_or_else(|| PipelineError::Config("Missing TIDB_DATABASE_URL (or DATABASE_URL)".to_string()))
  }

  pub fn require_encryption_key(&self) -> PipelineResult<&str> {
    self
      .encryption_key_b64
      .as_deref()
      .ok_or_else(|| PipelineError::Config("Missing CREDENTIALS_ENCRYPTION_KEY".to_string()))
  }

  pub fn api_base_url(&self, provider: Provider) -> &str {
    self
      .api_base_urls
      .get(&provider)
      .map(String::as_str)
      .unwrap_or_else(|| default_api_base_url(provider))
  }

  pub fn limits_for(&self, provider: Provider) -> ProviderLimits {
    self.limits.get(&provider).copied().unwrap_or(ProviderLimits {
      requests_per_minute: default_requests_per_minute(provider),
      burst: 10,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
    move |key: &str| {
      pairs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
    }
  }

  #[test]
  fn defaults_match_documented_timeouts() {
    let cfg = PipelineConfig::from_lookup(lookup(&[]));
    assert_eq!(cfg.provider_timeout, Duration::from_secs(30));
    assert_eq!(cfg.token_refresh_timeout, Duration::from_secs(10));
    assert_eq!(cfg.email_timeout, Duration::from_secs(60));
    assert_eq!(cfg.backoff.base, Duration::from_secs(1));
    assert_eq!(cfg.backoff.cap, Duration::from_secs(30));
    assert_eq!(cfg.backoff.max_attempts, 5);
    assert_eq!(cfg.monthly_job_concurrency, 4);
    assert_eq!(cfg.run_lock_ttl, Duration::from_secs(900));
    assert!(cfg.smtp.is_none());
    assert!(cfg.require_database_url().is_err());
  }

  #[test]
  fn values_are_clamped_and_database_url_falls_back() {
    let cfg = PipelineConfig::from_lookup(lookup(&[
      ("MONTHLY_JOB_CONCURRENCY", "500"),
      ("BACKOFF_MAX_ATTEMPTS", "0"),
      ("DATABASE_URL", "mysql://localhost/db"),
      ("PROVIDER_REQUESTS_PER_MINUTE_VIDEO", "42"),
      ("SOCIAL_GRAPH_API_BASE_URL", "http://127.0.0.1:9000/"),
    ]));
    assert_eq!(cfg.monthly_job_concurrency, 64);
    assert_eq!(cfg.backoff.max_attempts, 1);
    assert_eq!(cfg.require_database_url().unwrap(), "mysql://localhost/db");
    assert_eq!(cfg.limits_for(Provider::Video).requests_per_minute, 42);
    assert_eq!(cfg.api_base_url(Provider::SocialGraph), "http://127.0.0.1:9000/");
  }
}

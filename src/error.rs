use thiserror::Error;

use crate::models::Provider;

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("AUTH: {provider} rejected the access token: {message}")]
  Auth { provider: Provider, message: String },
  #[error("TOKEN_EXPIRED: {provider} token expired and refresh failed: {message}")]
  TokenExpired { provider: Provider, message: String },
  #[error("PROVIDER_UNAVAILABLE: {provider} failed after {attempts} attempt(s): {message}")]
  ProviderUnavailable {
    provider: Provider,
    attempts: u32,
    message: String,
  },
  #[error("DATA_INCOMPLETE: {0}")]
  DataIncomplete(String),
  #[error("RENDER: {0}")]
  Render(String),
  #[error("DELIVERY: {0}")]
  Delivery(String),
  #[error("NOT_FOUND: {0}")]
  NotFound(String),
  #[error("NO_ACTIVE_CONNECTION: no active {provider} connection for company {company_id}")]
  NoActiveConnection { company_id: String, provider: Provider },
  #[error("UNKNOWN_CHART_KEY: {0}")]
  UnknownChartKey(String),
  #[error("CONFIG: {0}")]
  Config(String),
  #[error("STORAGE: {0}")]
  Storage(String),
  #[error("CANCELLED")]
  Cancelled,
}

impl PipelineError {
  /// True for failures that only a user re-authorization can fix.
  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Auth { .. } | Self::TokenExpired { .. })
  }

  pub fn code(&self) -> &'static str {
    match self {
      Self::Auth { .. } => "auth_error",
      Self::TokenExpired { .. } => "token_expired",
      Self::ProviderUnavailable { .. } => "provider_unavailable",
      Self::DataIncomplete(_) => "data_incomplete",
      Self::Render(_) => "render_error",
      Self::Delivery(_) => "delivery_error",
      Self::NotFound(_) => "not_found",
      Self::NoActiveConnection { .. } => "no_active_connection",
      Self::UnknownChartKey(_) => "unknown_chart_key",
      Self::Config(_) => "config_error",
      Self::Storage(_) => "storage_error",
      Self::Cancelled => "cancelled",
    }
  }

  /// Message safe to show to non-admin users. Never includes upstream response text.
  pub fn public_message(&self) -> String {
    match self {
      Self::Auth { provider, .. } | Self::TokenExpired { provider, .. } => {
        format!("{} connection requires reconnect", provider.display_name())
      }
      Self::ProviderUnavailable { provider, .. } => {
        format!("{} is temporarily unavailable", provider.display_name())
      }
      Self::DataIncomplete(_) => "some data could not be loaded".to_string(),
      Self::Render(_) => "report could not be rendered".to_string(),
      Self::Delivery(_) => "report email could not be delivered".to_string(),
      Self::NotFound(_) => "not found".to_string(),
      Self::NoActiveConnection { provider, .. } => {
        format!("no active {} connection", provider.display_name())
      }
      Self::UnknownChartKey(key) => format!("unknown chart: {key}"),
      Self::Config(_) | Self::Storage(_) => "internal error".to_string(),
      Self::Cancelled => "cancelled".to_string(),
    }
  }
}

impl From<sqlx::Error> for PipelineError {
  fn from(value: sqlx::Error) -> Self {
    Self::Storage(value.to_string())
  }
}

impl From<serde_json::Error> for PipelineError {
  fn from(value: serde_json::Error) -> Self {
    Self::Storage(value.to_string())
  }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn auth_variants_are_flagged_for_reconnect() {
    let err = PipelineError::TokenExpired {
      provider: Provider::Aggregator,
      message: "invalid_grant".to_string(),
    };
    assert!(err.is_auth());
    assert_eq!(err.code(), "token_expired");
    assert!(!PipelineError::Render("x".to_string()).is_auth());
  }

  #[test]
  fn public_message_hides_upstream_text() {
    let err = PipelineError::ProviderUnavailable {
      provider: Provider::SocialGraph,
      attempts: 5,
      message: "{\"error\":\"internal stack trace\"}".to_string(),
    };
    let public = err.public_message();
    assert!(!public.contains("stack trace"));
    assert!(public.contains("Social Graph"));
  }
}

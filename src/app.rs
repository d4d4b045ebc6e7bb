//! Production wiring shared by the serverless handlers and the local CLI.

use std::sync::Arc;

use hyper::StatusCode;

use crate::charts::ChartCatalog;
use crate::config::PipelineConfig;
use crate::credentials::CredentialStore;
use crate::crypto::TokenCipher;
use crate::db::{get_pool, MySqlConnectionStore, MySqlDirectory, MySqlEntitlements, MySqlReportStore};
use crate::email::{DeliveryPolicy, DisabledMailer, Mailer, SmtpMailer};
use crate::error::{PipelineError, PipelineResult};
use crate::integration::{connectors_from_config, IntegrationService};
use crate::metric_cache::MetricCache;
use crate::monthly_job::{PipelineDeps, ReportPipeline};
use crate::providers::oauth::OAuthRefresher;
use crate::store::ReportStore;

pub struct AppContext {
  pub config: PipelineConfig,
  pub integration: Arc<IntegrationService>,
  pub reports: Arc<dyn ReportStore>,
  pub pipeline: Arc<ReportPipeline>,
}

impl AppContext {
  pub async fn from_env() -> PipelineResult<Self> {
    Self::from_config(PipelineConfig::from_env(), None).await
  }

  /// `mailer` overrides the SMTP mailer built from config.
  pub async fn from_config(config: PipelineConfig, mailer: Option<Arc<dyn Mailer>>) -> PipelineResult<Self> {
    let pool = get_pool(config.require_database_url()?).await?.clone();
    let cipher = TokenCipher::from_base64_key(config.require_encryption_key()?)?;

    let connections = Arc::new(MySqlConnectionStore::new(pool.clone()));
    let reports: Arc<dyn ReportStore> = Arc::new(MySqlReportStore::new(pool.clone()));

    let credentials = Arc::new(CredentialStore::new(
      connections.clone(),
      cipher,
      Arc::new(OAuthRefresher::from_env()),
      config.token_refresh_timeout,
    ));
    let integration = Arc::new(IntegrationService::new(
      connections.clone(),
      credentials,
      connectors_from_config(&config)?,
      MetricCache::new(config.metric_cache_ttl),
    ));

    let mailer: Arc<dyn Mailer> = match (mailer, config.smtp.as_ref()) {
      (Some(mailer), _) => mailer,
      (None, Some(smtp)) => Arc::new(SmtpMailer::from_config(smtp)?),
      (None, None) => {
        tracing::warn!("SMTP_HOST/SMTP_FROM not set; report emails will fail until configured");
        Arc::new(DisabledMailer)
      }
    };

    let pipeline = Arc::new(ReportPipeline::new(PipelineDeps {
      integration: integration.clone(),
      connections,
      reports: reports.clone(),
      entitlements: Arc::new(MySqlEntitlements::new(pool.clone())),
      directory: Arc::new(MySqlDirectory::new(pool)),
      mailer,
      catalog: Arc::new(ChartCatalog::load(config.chart_catalog_path.as_deref())?),
      delivery: DeliveryPolicy {
        attempts: config.email_attempts,
        retry_delay: config.email_retry_delay,
        timeout: config.email_timeout,
      },
      concurrency: config.monthly_job_concurrency,
      run_lock_ttl: config.run_lock_ttl,
    }));

    Ok(Self {
      config,
      integration,
      reports,
      pipeline,
    })
  }
}

pub fn status_for(err: &PipelineError) -> StatusCode {
  match err {
    PipelineError::Auth { .. } | PipelineError::TokenExpired { .. } => StatusCode::CONFLICT,
    PipelineError::NotFound(_) | PipelineError::NoActiveConnection { .. } => StatusCode::NOT_FOUND,
    PipelineError::UnknownChartKey(_) => StatusCode::BAD_REQUEST,
    PipelineError::ProviderUnavailable { .. } => StatusCode::BAD_GATEWAY,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

/// JSON error body. Admins also get the internal error text.
pub fn error_body(err: &PipelineError, is_admin: bool) -> serde_json::Value {
  let mut body = serde_json::json!({
    "ok": false,
    "error": err.code(),
    "message": err.public_message(),
  });
  if is_admin {
    body["detail"] = serde_json::Value::String(err.to_string());
  }
  body
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::Provider;

  #[test]
  fn non_admin_error_body_hides_upstream_text() {
    let err = PipelineError::ProviderUnavailable {
      provider: Provider::Video,
      attempts: 5,
      message: "HTTP 503: <html>backend-17 overloaded</html>".to_string(),
    };
    let body = error_body(&err, false);
    assert_eq!(body["error"], "provider_unavailable");
    assert!(body.get("detail").is_none());
    assert!(!body.to_string().contains("backend-17"));

    let admin = error_body(&err, true);
    assert!(admin["detail"].as_str().unwrap().contains("backend-17"));
    assert_eq!(status_for(&err), StatusCode::BAD_GATEWAY);
  }

  #[test]
  fn reconnect_errors_map_to_conflict() {
    let err = PipelineError::TokenExpired {
      provider: Provider::SocialGraph,
      message: "invalid_grant".to_string(),
    };
    assert_eq!(status_for(&err), StatusCode::CONFLICT);
    assert!(error_body(&err, false)["message"]
      .as_str()
      .unwrap()
      .contains("reconnect"));
  }
}

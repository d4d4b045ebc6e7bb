use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::credentials::{CredentialStore, DecryptedToken};
use crate::error::{PipelineError, PipelineResult};
use crate::metric_cache::MetricCache;
use crate::models::{
  Connection, ConnectionStatus, ConnectionSummary, DateRange, ExternalAccount, MetricFetch, OAuthTokens,
  Provider,
};
use crate::providers::aggregator::AggregatorConnector;
use crate::providers::social_graph::SocialGraphConnector;
use crate::providers::video::VideoConnector;
use crate::providers::{ProviderConnector, ProviderHttp};
use crate::store::ConnectionStore;

/// A connector paired with a token that is valid right now.
pub struct ReadyConnector {
  pub connector: Arc<dyn ProviderConnector>,
  pub token: DecryptedToken,
}

pub struct IntegrationService {
  connections: Arc<dyn ConnectionStore>,
  credentials: Arc<CredentialStore>,
  connectors: HashMap<Provider, Arc<dyn ProviderConnector>>,
  cache: MetricCache,
}

/// Builds the production connector for each provider from config.
pub fn connectors_from_config(config: &PipelineConfig) -> PipelineResult<Vec<Arc<dyn ProviderConnector>>> {
  let http = |provider: Provider| {
    ProviderHttp::new(
      provider,
      config.limits_for(provider),
      config.backoff,
      config.provider_timeout,
    )
  };
  let aggregator: Arc<dyn ProviderConnector> = Arc::new(AggregatorConnector::new(
    config.api_base_url(Provider::Aggregator),
    http(Provider::Aggregator)?,
  ));
  let social_graph: Arc<dyn ProviderConnector> = Arc::new(SocialGraphConnector::new(
    config.api_base_url(Provider::SocialGraph),
    http(Provider::SocialGraph)?,
  ));
  let video: Arc<dyn ProviderConnector> = Arc::new(VideoConnector::new(
    config.api_base_url(Provider::Video),
    &config.video_data_api_base_url,
    http(Provider::Video)?,
  ));
  Ok(vec![aggregator, social_graph, video])
}

impl IntegrationService {
  pub fn new(
    connections: Arc<dyn ConnectionStore>,
    credentials: Arc<CredentialStore>,
    connectors: Vec<Arc<dyn ProviderConnector>>,
    cache: MetricCache,
  ) -> Self {
    Self {
      connections,
      credentials,
      connectors: connectors.into_iter().map(|c| (c.provider(), c)).collect(),
      cache,
    }
  }

  pub fn credentials(&self) -> &CredentialStore {
    &self.credentials
  }

  fn connector(&self, provider: Provider) -> PipelineResult<Arc<dyn ProviderConnector>> {
    self
      .connectors
      .get(&provider)
      .cloned()
      .ok_or_else(|| PipelineError::Config(format!("no connector registered for {provider}")))
  }

  pub async fn connector_for(&self, company_id: &str, provider: Provider) -> PipelineResult<ReadyConnector> {
    let connector = self.connector(provider)?;
    let token = self
      .credentials
      .get(company_id, provider)
      .await
      .map_err(|err| match err {
        PipelineError::NotFound(_) => PipelineError::NoActiveConnection {
          company_id: company_id.to_string(),
          provider,
        },
        other => other,
      })?;
    Ok(ReadyConnector { connector, token })
  }

  /// Everything but revoked connections, ordered by provider then account id.
  pub async fn list_connections(&self, company_id: &str) -> PipelineResult<Vec<ConnectionSummary>> {
    let mut rows = self
      .connections
      .list_connections(company_id)
      .await?
      .into_iter()
      .filter(|c| c.status != ConnectionStatus::Revoked)
      .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
      a.provider
        .cmp(&b.provider)
        .then_with(|| a.external_account_id.cmp(&b.external_account_id))
    });
    Ok(rows.iter().map(ConnectionSummary::from).collect())
  }

  pub async fn discover_accounts(
    &self,
    company_id: &str,
    provider: Provider,
  ) -> PipelineResult<Vec<ExternalAccount>> {
    let ready = self.connector_for(company_id, provider).await?;
    let result = ready.connector.discover_accounts(&ready.token.access_token).await;
    self
      .expire_on_auth(company_id, provider, ready.token.connection_id, result)
      .await
  }

  pub async fn connect(
    &self,
    company_id: &str,
    provider: Provider,
    account: &ExternalAccount,
    tokens: &OAuthTokens,
  ) -> PipelineResult<Connection> {
    let previous = self.connections.active_connection(company_id, provider).await?;
    let connection = self.credentials.upsert(company_id, provider, account, tokens).await?;
    if let Some(previous) = previous {
      self.cache.invalidate_connection(previous.id);
    }
    Ok(connection)
  }

  /// Connects right after an OAuth exchange: the account is looked up with the new token.
  /// Without `external_account_id` the first discovered account is used.
  pub async fn connect_with_token(
    &self,
    company_id: &str,
    provider: Provider,
    tokens: &OAuthTokens,
    external_account_id: Option<&str>,
  ) -> PipelineResult<Connection> {
    let accounts = self
      .connector(provider)?
      .discover_accounts(&tokens.access_token)
      .await?;
    let account = match external_account_id {
      Some(wanted) => accounts.into_iter().find(|a| a.id == wanted),
      None => accounts.into_iter().next(),
    }
    .ok_or_else(|| {
      PipelineError::NotFound(format!("no matching {provider} account for this authorization"))
    })?;
    self.connect(company_id, provider, &account, tokens).await
  }

  pub async fn disconnect(&self, company_id: &str, provider: Provider) -> PipelineResult<()> {
    if let Some(active) = self.connections.active_connection(company_id, provider).await? {
      self.cache.invalidate_connection(active.id);
    }
    self.credentials.revoke(company_id, provider).await
  }

  pub async fn fetch_metrics(
    &self,
    company_id: &str,
    provider: Provider,
    range: DateRange,
    metric_keys: &[String],
  ) -> PipelineResult<MetricFetch> {
    let ready = self.connector_for(company_id, provider).await?;
    let connection_id = ready.token.connection_id;

    if let Some(series) = self.cache.get(connection_id, range, metric_keys) {
      tracing::debug!(company_id = %company_id, provider = %provider, "metric cache hit");
      return Ok(MetricFetch {
        series,
        partial: false,
      });
    }

    let result = ready
      .connector
      .fetch_metrics(
        &ready.token.access_token,
        &ready.token.external_account_id,
        range,
        metric_keys,
      )
      .await;
    let fetch = self
      .expire_on_auth(company_id, provider, connection_id, result)
      .await?;

    if fetch.partial {
      tracing::warn!(company_id = %company_id, provider = %provider, "partial metric fetch; not cached");
    } else {
      self.cache.put(connection_id, range, metric_keys, fetch.series.clone());
    }
    Ok(fetch)
  }

  async fn expire_on_auth<T>(
    &self,
    company_id: &str,
    provider: Provider,
    connection_id: i64,
    result: PipelineResult<T>,
  ) -> PipelineResult<T> {
    match result {
      Err(err) if err.is_auth() => {
        tracing::warn!(
          company_id = %company_id,
          provider = %provider,
          connection_id,
          error = %err,
          "provider rejected token; reconnect required"
        );
        self
          .credentials
          .mark_expired(company_id, provider, connection_id)
          .await?;
        Err(err)
      }
      other => other,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::credentials::tests::{test_cipher, tokens, FakeRefresher};
  use crate::providers::{BackoffPolicy, ProviderLimits};
  use crate::store::MemoryConnectionStore;
  use crate::test_support::{spawn_mock, MockServer};
  use chrono::NaiveDate;
  use std::time::Duration;

  fn fast_http(provider: Provider) -> ProviderHttp {
    ProviderHttp::new(
      provider,
      ProviderLimits::unlimited(),
      BackoffPolicy {
        base: Duration::from_millis(0),
        cap: Duration::from_millis(0),
        max_attempts: 1,
      },
      Duration::from_secs(5),
    )
    .unwrap()
  }

  fn service(server: &MockServer) -> (IntegrationService, Arc<MemoryConnectionStore>) {
    let store = Arc::new(MemoryConnectionStore::new());
    let credentials = Arc::new(CredentialStore::new(
      store.clone(),
      test_cipher(),
      Arc::new(FakeRefresher::ok()),
      Duration::from_secs(5),
    ));
    let connectors: Vec<Arc<dyn ProviderConnector>> = vec![Arc::new(AggregatorConnector::new(
      &server.base_url,
      fast_http(Provider::Aggregator),
    ))];
    (
      IntegrationService::new(
        store.clone(),
        credentials,
        connectors,
        MetricCache::new(Duration::from_secs(3600)),
      ),
      store,
    )
  }

  fn account(id: &str) -> ExternalAccount {
    ExternalAccount {
      id: id.to_string(),
      name: format!("Account {id}"),
    }
  }

  fn may() -> DateRange {
    DateRange::new(
      NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
      NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn second_fetch_is_served_from_cache() {
    let server = spawn_mock(|_pq: &str| {
      (
        200,
        r#"{"data":[{"date":"2024-05-01","clicks":4},{"date":"2024-05-02","clicks":6}],"next_page":null}"#
          .to_string(),
      )
    })
    .await;
    let (service, _) = service(&server);
    service
      .connect("co-1", Provider::Aggregator, &account("a1"), &tokens("tok", Some(3600)))
      .await
      .unwrap();

    let keys = vec!["clicks".to_string()];
    let first = service.fetch_metrics("co-1", Provider::Aggregator, may(), &keys).await.unwrap();
    let second = service.fetch_metrics("co-1", Provider::Aggregator, may(), &keys).await.unwrap();
    assert_eq!(first.series, second.series);
    assert_eq!(server.hit_count(), 1);
    assert!(server.requested()[0].contains("account_id=a1"));
  }

  #[tokio::test]
  async fn auth_error_marks_connection_expired() {
    let server = spawn_mock(|_pq: &str| (401, r#"{"error":"revoked"}"#.to_string())).await;
    let (service, store) = service(&server);
    service
      .connect("co-1", Provider::Aggregator, &account("a1"), &tokens("tok", Some(3600)))
      .await
      .unwrap();

    let err = service
      .fetch_metrics("co-1", Provider::Aggregator, may(), &["clicks".to_string()])
      .await
      .unwrap_err();
    assert!(err.is_auth());
    assert_eq!(store.snapshot()[0].status, ConnectionStatus::Expired);

    let listed = service.list_connections("co-1").await.unwrap();
    assert_eq!(listed[0].status, ConnectionStatus::Expired);
  }

  #[tokio::test]
  async fn discovery_requires_active_connection() {
    let server = spawn_mock(|_pq: &str| (200, r#"{"data":[]}"#.to_string())).await;
    let (service, _) = service(&server);
    let err = service
      .discover_accounts("co-1", Provider::Aggregator)
      .await
      .unwrap_err();
    assert!(matches!(err, PipelineError::NoActiveConnection { .. }));
    assert_eq!(server.hit_count(), 0);
  }

  #[tokio::test]
  async fn reconnect_supersedes_and_lists_in_order() {
    let server = spawn_mock(|_pq: &str| {
      (
        200,
        r#"{"data":[{"id":"b2","name":"Brand B"},{"id":"a1","name":"Brand A"}],"next_page":null}"#.to_string(),
      )
    })
    .await;
    let (service, store) = service(&server);
    service
      .connect("co-1", Provider::Aggregator, &account("a1"), &tokens("t1", Some(3600)))
      .await
      .unwrap();
    let connection = service
      .connect_with_token("co-1", Provider::Aggregator, &tokens("t2", Some(3600)), Some("b2"))
      .await
      .unwrap();
    assert_eq!(connection.external_account_name, "Brand B");

    let rows = store.snapshot();
    assert_eq!(rows[0].status, ConnectionStatus::Revoked);
    assert_eq!(rows[1].status, ConnectionStatus::Active);

    let listed = service.list_connections("co-1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].external_account_id, "b2");

    service.disconnect("co-1", Provider::Aggregator).await.unwrap();
    assert!(service.list_connections("co-1").await.unwrap().is_empty());
  }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crypto::TokenCipher;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Connection, ConnectionStatus, ExternalAccount, NewConnection, OAuthTokens, Provider};
use crate::store::ConnectionStore;

/// Tokens expiring within this margin are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

#[async_trait]
pub trait TokenRefresher: Send + Sync {
  async fn refresh(&self, provider: Provider, refresh_token: &str) -> PipelineResult<OAuthTokens>;
}

/// A usable access token. Lives only as long as one pipeline step needs it.
#[derive(Clone)]
pub struct DecryptedToken {
  pub connection_id: i64,
  pub provider: Provider,
  pub external_account_id: String,
  pub access_token: String,
  pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for DecryptedToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DecryptedToken")
      .field("connection_id", &self.connection_id)
      .field("provider", &self.provider)
      .field("external_account_id", &self.external_account_id)
      .field("access_token", &"<redacted>")
      .field("expires_at", &self.expires_at)
      .finish()
  }
}

fn needs_refresh(connection: &Connection, now: DateTime<Utc>) -> bool {
  connection
    .token_expires_at
    .is_some_and(|at| at - chrono::Duration::seconds(EXPIRY_SKEW_SECS) <= now)
}

type RefreshKey = (String, Provider);

pub struct CredentialStore {
  connections: Arc<dyn ConnectionStore>,
  cipher: TokenCipher,
  refresher: Arc<dyn TokenRefresher>,
  refresh_timeout: Duration,
  refresh_locks: Mutex<HashMap<RefreshKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialStore {
  pub fn new(
    connections: Arc<dyn ConnectionStore>,
    cipher: TokenCipher,
    refresher: Arc<dyn TokenRefresher>,
    refresh_timeout: Duration,
  ) -> Self {
    Self {
      connections,
      cipher,
      refresher,
      refresh_timeout,
      refresh_locks: Mutex::new(HashMap::new()),
    }
  }

  /// Returns a decrypted, unexpired token for the company's active connection.
  ///
  /// An expired token is refreshed exactly once; concurrent callers for the same
  /// (company, provider) wait for that single refresh instead of starting their own.
  pub async fn get(&self, company_id: &str, provider: Provider) -> PipelineResult<DecryptedToken> {
    let connection = self.require_active(company_id, provider).await?;
    if !needs_refresh(&connection, Utc::now()) {
      return self.decrypt(&connection);
    }

    let lock = self.refresh_lock(company_id, provider)?;
    let result = self.refresh_if_needed(company_id, provider, &lock).await;
    self.release_refresh_lock(company_id, provider, lock);
    result
  }

  async fn refresh_if_needed(
    &self,
    company_id: &str,
    provider: Provider,
    lock: &tokio::sync::Mutex<()>,
  ) -> PipelineResult<DecryptedToken> {
    let _guard = lock.lock().await;

    // A peer may have refreshed while we waited.
    let connection = self.require_active(company_id, provider).await?;
    if !needs_refresh(&connection, Utc::now()) {
      return self.decrypt(&connection);
    }
    self.refresh_locked(connection).await
  }

  /// Stores tokens for a freshly authorized account, superseding the previous active connection.
  pub async fn upsert(
    &self,
    company_id: &str,
    provider: Provider,
    account: &ExternalAccount,
    tokens: &OAuthTokens,
  ) -> PipelineResult<Connection> {
    let new = NewConnection {
      company_id: company_id.to_string(),
      provider,
      external_account_id: account.id.clone(),
      external_account_name: account.name.clone(),
      encrypted_access_token: self.cipher.encrypt(&tokens.access_token)?,
      encrypted_refresh_token: tokens
        .refresh_token
        .as_deref()
        .map(|t| self.cipher.encrypt(t))
        .transpose()?,
      token_expires_at: tokens.expires_at(Utc::now()),
      scope: tokens.scope.clone(),
    };
    let connection = self.connections.supersede_and_insert(new).await?;
    tracing::info!(
      company_id = %company_id,
      provider = %provider,
      connection_id = connection.id,
      external_account_id = %connection.external_account_id,
      "stored provider connection"
    );
    Ok(connection)
  }

  /// Soft-deletes the active connection. A missing connection is not an error.
  pub async fn revoke(&self, company_id: &str, provider: Provider) -> PipelineResult<()> {
    if let Some(connection) = self.connections.active_connection(company_id, provider).await? {
      self
        .connections
        .set_status(connection.id, ConnectionStatus::Revoked)
        .await?;
      tracing::info!(company_id = %company_id, provider = %provider, "revoked provider connection");
    }
    Ok(())
  }

  /// Flags `connection_id` as needing re-authorization. A connection that has been superseded
  /// since the token was handed out is left alone, and so is its replacement.
  pub async fn mark_expired(
    &self,
    company_id: &str,
    provider: Provider,
    connection_id: i64,
  ) -> PipelineResult<()> {
    match self.connections.active_connection(company_id, provider).await? {
      Some(active) if active.id == connection_id => {
        self
          .connections
          .set_status(connection_id, ConnectionStatus::Expired)
          .await
      }
      _ => {
        tracing::debug!(
          company_id = %company_id,
          provider = %provider,
          connection_id,
          "connection no longer active; not marking expired"
        );
        Ok(())
      }
    }
  }

  async fn require_active(&self, company_id: &str, provider: Provider) -> PipelineResult<Connection> {
    self
      .connections
      .active_connection(company_id, provider)
      .await?
      .ok_or_else(|| PipelineError::NotFound(format!("no active {provider} connection for {company_id}")))
  }

  fn refresh_lock(
    &self,
    company_id: &str,
    provider: Provider,
  ) -> PipelineResult<Arc<tokio::sync::Mutex<()>>> {
    let mut locks = self
      .refresh_locks
      .lock()
      .map_err(|_| PipelineError::Storage("refresh lock table poisoned".to_string()))?;
    Ok(
      locks
        .entry((company_id.to_string(), provider))
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone(),
    )
  }

  /// Removes the table entry once no other caller holds or waits on it.
  fn release_refresh_lock(&self, company_id: &str, provider: Provider, lock: Arc<tokio::sync::Mutex<()>>) {
    let Ok(mut locks) = self.refresh_locks.lock() else {
      return;
    };
    let key = (company_id.to_string(), provider);
    // One reference is the table's, one is ours.
    let unused = locks
      .get(&key)
      .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
    drop(lock);
    if unused {
      locks.remove(&key);
    }
  }

  #[cfg(test)]
  fn refresh_lock_count(&self) -> usize {
    self.refresh_locks.lock().map(|l| l.len()).unwrap_or(0)
  }

  fn decrypt(&self, connection: &Connection) -> PipelineResult<DecryptedToken> {
    Ok(DecryptedToken {
      connection_id: connection.id,
      provider: connection.provider,
      external_account_id: connection.external_account_id.clone(),
      access_token: self.cipher.decrypt(&connection.encrypted_access_token)?,
      expires_at: connection.token_expires_at,
    })
  }

  async fn refresh_locked(&self, connection: Connection) -> PipelineResult<DecryptedToken> {
    let provider = connection.provider;
    let Some(encrypted_refresh) = connection.encrypted_refresh_token.as_deref() else {
      return self
        .expire(&connection, "connection has no refresh token".to_string())
        .await;
    };
    let refresh_token = self.cipher.decrypt(encrypted_refresh)?;

    let outcome =
      tokio::time::timeout(self.refresh_timeout, self.refresher.refresh(provider, &refresh_token)).await;
    let tokens = match outcome {
      Ok(Ok(tokens)) => tokens,
      Ok(Err(err)) => return self.expire(&connection, err.to_string()).await,
      Err(_) => {
        return self
          .expire(
            &connection,
            format!("refresh timed out after {}s", self.refresh_timeout.as_secs()),
          )
          .await
      }
    };

    let encrypted_access = self.cipher.encrypt(&tokens.access_token)?;
    let encrypted_refresh = tokens
      .refresh_token
      .as_deref()
      .map(|t| self.cipher.encrypt(t))
      .transpose()?;
    let expires_at = tokens.expires_at(Utc::now());
    self
      .connections
      .update_tokens(
        connection.id,
        &encrypted_access,
        encrypted_refresh.as_deref(),
        expires_at,
        tokens.scope.as_deref(),
      )
      .await?;

    tracing::info!(
      company_id = %connection.company_id,
      provider = %provider,
      connection_id = connection.id,
      "refreshed provider token"
    );

    Ok(DecryptedToken {
      connection_id: connection.id,
      provider,
      external_account_id: connection.external_account_id,
      access_token: tokens.access_token,
      expires_at,
    })
  }

  async fn expire(&self, connection: &Connection, reason: String) -> PipelineResult<DecryptedToken> {
    self
      .connections
      .set_status(connection.id, ConnectionStatus::Expired)
      .await?;
    tracing::warn!(
      company_id = %connection.company_id,
      provider = %connection.provider,
      connection_id = connection.id,
      reason = %reason,
      "token refresh failed; connection marked expired"
    );
    Err(PipelineError::TokenExpired {
      provider: connection.provider,
      message: reason,
    })
  }
}

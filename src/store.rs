//! Persistence seams for the pipeline.
//!
//! The relational layer is owned elsewhere; the pipeline only needs fetch/create/update on
//! connections and report records, plus two read-only lookups (billing entitlement and the
//! company directory). `db` provides the MySQL implementations, this module the in-memory
//! ones used by tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{
  CompanyProfile, Connection, ConnectionStatus, DeliveryStatus, NewConnection, Provider,
  ReportArtifact, ReportRun, RunState,
};

#[async_trait]
pub trait ConnectionStore: Send + Sync {
  /// All connections of a company, including revoked ones.
  async fn list_connections(&self, company_id: &str) -> PipelineResult<Vec<Connection>>;

  async fn active_connection(
    &self,
    company_id: &str,
    provider: Provider,
  ) -> PipelineResult<Option<Connection>>;

  /// Revokes the company's current active connection for the provider (if any) and inserts
  /// `new` as active. Both writes happen or neither does.
  async fn supersede_and_insert(&self, new: NewConnection) -> PipelineResult<Connection>;

  async fn update_tokens(
    &self,
    connection_id: i64,
    encrypted_access_token: &str,
    encrypted_refresh_token: Option<&str>,
    token_expires_at: Option<DateTime<Utc>>,
    scope: Option<&str>,
  ) -> PipelineResult<()>;

  async fn set_status(&self, connection_id: i64, status: ConnectionStatus) -> PipelineResult<()>;

  async fn companies_with_active_connections(&self) -> PipelineResult<Vec<String>>;
}

/// Outcome of trying to take ownership of one (company, period) run.
#[derive(Debug, Clone)]
pub enum RunClaim {
  /// The caller owns the run; the row is now `Queued` with the returned attempt number.
  Claimed(ReportRun),
  AlreadyDone,
  /// Another run holds the row and has written a transition within the lock TTL.
  InProgress,
}

/// Decides whether a new run may start over `existing`. Returns the attempt number to use.
///
/// A non-terminal row whose last transition is older than `stale_before` belongs to a run
/// that died without recording Failed, and is taken over.
pub fn claim_attempt(
  existing: Option<&ReportRun>,
  force: bool,
  stale_before: DateTime<Utc>,
) -> Result<u32, RunClaim> {
  let Some(run) = existing else {
    return Ok(1);
  };
  match run.state {
    RunState::Done if !force => Err(RunClaim::AlreadyDone),
    RunState::Done | RunState::Failed => Ok(run.attempt + 1),
    _ if run.updated_at < stale_before => Ok(run.attempt + 1),
    _ => Err(RunClaim::InProgress),
  }
}

pub(crate) fn stale_before(now: DateTime<Utc>, lock_ttl: Duration) -> DateTime<Utc> {
  now - chrono::Duration::from_std(lock_ttl).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[async_trait]
pub trait ReportStore: Send + Sync {
  async fn fetch_run(&self, company_id: &str, period_key: &str) -> PipelineResult<Option<ReportRun>>;

  /// Atomically claims the (company, period) run for one caller. Concurrent callers for the
  /// same pair get exactly one `Claimed`.
  async fn claim_run(
    &self,
    company_id: &str,
    period_key: &str,
    force: bool,
    lock_ttl: Duration,
  ) -> PipelineResult<RunClaim>;

  async fn latest_run(&self, company_id: &str) -> PipelineResult<Option<ReportRun>>;

  async fn upsert_run(&self, run: &ReportRun) -> PipelineResult<()>;

  /// Writes the artifact for (company, period), replacing any earlier one.
  async fn upsert_artifact(&self, artifact: &ReportArtifact) -> PipelineResult<()>;

  async fn fetch_artifact(
    &self,
    company_id: &str,
    period_key: &str,
  ) -> PipelineResult<Option<ReportArtifact>>;

  async fn set_delivery_status(
    &self,
    company_id: &str,
    period_key: &str,
    status: DeliveryStatus,
  ) -> PipelineResult<()>;
}

#[async_trait]
pub trait EntitlementCheck: Send + Sync {
  async fn report_generation_entitled(&self, company_id: &str) -> PipelineResult<bool>;
}

#[async_trait]
pub trait CompanyDirectory: Send + Sync {
  async fn company_profile(&self, company_id: &str) -> PipelineResult<Option<CompanyProfile>>;
}

fn poisoned<T>(_: T) -> PipelineError {
  PipelineError::Storage("in-memory store lock poisoned".to_string())
}

#[derive(Default)]
pub struct MemoryConnectionStore {
  rows: Mutex<Vec<Connection>>,
}

impl MemoryConnectionStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn snapshot(&self) -> Vec<Connection> {
    self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
  }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
  async fn list_connections(&self, company_id: &str) -> PipelineResult<Vec<Connection>> {
    let rows = self.rows.lock().map_err(poisoned)?;
    Ok(rows.iter().filter(|c| c.company_id == company_id).cloned().collect())
  }

  async fn active_connection(
    &self,
    company_id: &str,
    provider: Provider,
  ) -> PipelineResult<Option<Connection>> {
    let rows = self.rows.lock().map_err(poisoned)?;
    Ok(
      rows
        .iter()
        .find(|c| {
          c.company_id == company_id
            && c.provider == provider
            && c.status == ConnectionStatus::Active
        })
        .cloned(),
    )
  }

  async fn supersede_and_insert(&self, new: NewConnection) -> PipelineResult<Connection> {
    let mut rows = self.rows.lock().map_err(poisoned)?;
    let now = Utc::now();
    for row in rows.iter_mut() {
      if row.company_id == new.company_id
        && row.provider == new.provider
        && row.status == ConnectionStatus::Active
      {
        row.status = ConnectionStatus::Revoked;
        row.updated_at = now;
      }
    }

    let id = rows.iter().map(|c| c.id).max().unwrap_or(0) + 1;
    let connection = Connection {
      id,
      company_id: new.company_id,
      provider: new.provider,
      status: ConnectionStatus::Active,
      external_account_id: new.external_account_id,
      external_account_name: new.external_account_name,
      encrypted_access_token: new.encrypted_access_token,
      encrypted_refresh_token: new.encrypted_refresh_token,
      token_expires_at: new.token_expires_at,
      scope: new.scope,
      created_at: now,
      updated_at: now,
    };
    rows.push(connection.clone());
    Ok(connection)
  }

  async fn update_tokens(
    &self,
    connection_id: i64,
    encrypted_access_token: &str,
    encrypted_refresh_token: Option<&str>,
    token_expires_at: Option<DateTime<Utc>>,
    scope: Option<&str>,
  ) -> PipelineResult<()> {
    let mut rows = self.rows.lock().map_err(poisoned)?;
    let row = rows
      .iter_mut()
      .find(|c| c.id == connection_id)
      .ok_or_else(|| PipelineError::NotFound(format!("connection {connection_id}")))?;
    row.encrypted_access_token = encrypted_access_token.to_string();
    if let Some(refresh) = encrypted_refresh_token {
      row.encrypted_refresh_token = Some(refresh.to_string());
    }
    row.token_expires_at = token_expires_at;
    if let Some(scope) = scope {
      row.scope = Some(scope.to_string());
    }
    row.updated_at = Utc::now();
    Ok(())
  }

  async fn set_status(&self, connection_id: i64, status: ConnectionStatus) -> PipelineResult<()> {
    let mut rows = self.rows.lock().map_err(poisoned)?;
    let row = rows
      .iter_mut()
      .find(|c| c.id == connection_id)
      .ok_or_else(|| PipelineError::NotFound(format!("connection {connection_id}")))?;
    row.status = status;
    row.updated_at = Utc::now();
    Ok(())
  }

  async fn companies_with_active_connections(&self) -> PipelineResult<Vec<String>> {
    let rows = self.rows.lock().map_err(poisoned)?;
    let mut companies = rows
      .iter()
      .filter(|c| c.status == ConnectionStatus::Active)
      .map(|c| c.company_id.clone())
      .collect::<Vec<_>>();
    companies.sort();
    companies.dedup();
    Ok(companies)
  }
}

#[derive(Default)]
pub struct MemoryReportStore {
  runs: Mutex<HashMap<(String, String), ReportRun>>,
  artifacts: Mutex<HashMap<(String, String), ReportArtifact>>,
  artifact_writes: Mutex<usize>,
}

impl MemoryReportStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn artifact_count(&self) -> usize {
    self.artifacts.lock().map(|a| a.len()).unwrap_or(0)
  }

  pub fn artifact_writes(&self) -> usize {
    self.artifact_writes.lock().map(|w| *w).unwrap_or(0)
  }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
  async fn fetch_run(&self, company_id: &str, period_key: &str) -> PipelineResult<Option<ReportRun>> {
    let runs = self.runs.lock().map_err(poisoned)?;
    Ok(runs.get(&(company_id.to_string(), period_key.to_string())).cloned())
  }

  async fn claim_run(
    &self,
    company_id: &str,
    period_key: &str,
    force: bool,
    lock_ttl: Duration,
  ) -> PipelineResult<RunClaim> {
    let mut runs = self.runs.lock().map_err(poisoned)?;
    let key = (company_id.to_string(), period_key.to_string());
    let now = Utc::now();
    match claim_attempt(runs.get(&key), force, stale_before(now, lock_ttl)) {
      Ok(attempt) => {
        let run = ReportRun {
          company_id: company_id.to_string(),
          period_key: period_key.to_string(),
          state: RunState::Queued,
          attempt,
          last_error: None,
          updated_at: now,
        };
        runs.insert(key, run.clone());
        Ok(RunClaim::Claimed(run))
      }
      Err(claim) => Ok(claim),
    }
  }

  async fn latest_run(&self, company_id: &str) -> PipelineResult<Option<ReportRun>> {
    let runs = self.runs.lock().map_err(poisoned)?;
    Ok(
      runs
        .values()
        .filter(|r| r.company_id == company_id)
        .max_by(|a, b| a.period_key.cmp(&b.period_key))
        .cloned(),
    )
  }

  async fn upsert_run(&self, run: &ReportRun) -> PipelineResult<()> {
    let mut runs = self.runs.lock().map_err(poisoned)?;
    runs.insert((run.company_id.clone(), run.period_key.clone()), run.clone());
    Ok(())
  }

  async fn upsert_artifact(&self, artifact: &ReportArtifact) -> PipelineResult<()> {
    let mut artifacts = self.artifacts.lock().map_err(poisoned)?;
    artifacts.insert(
      (artifact.company_id.clone(), artifact.period.key()),
      artifact.clone(),
    );
    *self.artifact_writes.lock().map_err(poisoned)? += 1;
    Ok(())
  }

  async fn fetch_artifact(
    &self,
    company_id: &str,
    period_key: &str,
  ) -> PipelineResult<Option<ReportArtifact>> {
    let artifacts = self.artifacts.lock().map_err(poisoned)?;
    Ok(artifacts.get(&(company_id.to_string(), period_key.to_string())).cloned())
  }

  async fn set_delivery_status(
    &self,
    company_id: &str,
    period_key: &str,
    status: DeliveryStatus,
  ) -> PipelineResult<()> {
    let mut artifacts = self.artifacts.lock().map_err(poisoned)?;
    let artifact = artifacts
      .get_mut(&(company_id.to_string(), period_key.to_string()))
      .ok_or_else(|| PipelineError::NotFound(format!("artifact {company_id}/{period_key}")))?;
    artifact.delivery_status = status;
    Ok(())
  }
}

/// Entitles everyone except the listed companies.
#[derive(Default)]
pub struct StaticEntitlements {
  denied: HashSet<String>,
}

impl StaticEntitlements {
  pub fn allow_all() -> Self {
    Self::default()
  }

  pub fn deny(companies: &[&str]) -> Self {
    Self {
      denied: companies.iter().map(|c| c.to_string()).collect(),
    }
  }
}

#[async_trait]
impl EntitlementCheck for StaticEntitlements {
  async fn report_generation_entitled(&self, company_id: &str) -> PipelineResult<bool> {
    Ok(!self.denied.contains(company_id))
  }
}

#[derive(Default)]
pub struct MemoryDirectory {
  profiles: HashMap<String, CompanyProfile>,
}

impl MemoryDirectory {
  pub fn new(profiles: Vec<CompanyProfile>) -> Self {
    Self {
      profiles: profiles
        .into_iter()
        .map(|p| (p.company_id.clone(), p))
        .collect(),
    }
  }
}

#[async_trait]
impl CompanyDirectory for MemoryDirectory {
  async fn company_profile(&self, company_id: &str) -> PipelineResult<Option<CompanyProfile>> {
    Ok(self.profiles.get(company_id).cloned())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn new_connection(company_id: &str, provider: Provider, account: &str) -> NewConnection {
    NewConnection {
      company_id: company_id.to_string(),
      provider,
      external_account_id: account.to_string(),
      external_account_name: format!("{account} name"),
      encrypted_access_token: "v1:a".to_string(),
      encrypted_refresh_token: Some("v1:r".to_string()),
      token_expires_at: None,
      scope: None,
    }
  }

  #[tokio::test]
  async fn supersede_keeps_one_active_per_provider() {
    let store = MemoryConnectionStore::new();
    let first = store
      .supersede_and_insert(new_connection("c1", Provider::Aggregator, "acct-1"))
      .await
      .unwrap();
    let second = store
      .supersede_and_insert(new_connection("c1", Provider::Aggregator, "acct-2"))
      .await
      .unwrap();
    store
      .supersede_and_insert(new_connection("c1", Provider::Video, "UC1"))
      .await
      .unwrap();

    let rows = store.list_connections("c1").await.unwrap();
    assert_eq!(rows.len(), 3);
    let old = rows.iter().find(|c| c.id == first.id).unwrap();
    assert_eq!(old.status, ConnectionStatus::Revoked);

    let active = store
      .active_connection("c1", Provider::Aggregator)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(active.id, second.id);
    assert_eq!(active.external_account_id, "acct-2");
  }

  fn run_in(state: RunState, age_secs: i64) -> ReportRun {
    ReportRun {
      company_id: "c1".to_string(),
      period_key: "2024-05".to_string(),
      state,
      attempt: 2,
      last_error: None,
      updated_at: Utc::now() - chrono::Duration::seconds(age_secs),
    }
  }

  #[tokio::test]
  async fn claim_run_admits_one_owner() {
    let store = MemoryReportStore::new();
    let ttl = Duration::from_secs(600);

    let first = store.claim_run("c1", "2024-05", false, ttl).await.unwrap();
    assert!(matches!(&first, RunClaim::Claimed(run) if run.attempt == 1 && run.state == RunState::Queued));
    assert!(matches!(
      store.claim_run("c1", "2024-05", false, ttl).await.unwrap(),
      RunClaim::InProgress
    ));
    // Forcing does not break into a live run.
    assert!(matches!(
      store.claim_run("c1", "2024-05", true, ttl).await.unwrap(),
      RunClaim::InProgress
    ));
    // Other periods are independent.
    assert!(matches!(
      store.claim_run("c1", "2024-06", false, ttl).await.unwrap(),
      RunClaim::Claimed(_)
    ));
  }

  #[tokio::test]
  async fn claim_run_respects_terminal_and_stale_rows() {
    let store = MemoryReportStore::new();
    let ttl = Duration::from_secs(600);

    store.upsert_run(&run_in(RunState::Done, 0)).await.unwrap();
    assert!(matches!(
      store.claim_run("c1", "2024-05", false, ttl).await.unwrap(),
      RunClaim::AlreadyDone
    ));
    assert!(matches!(
      store.claim_run("c1", "2024-05", true, ttl).await.unwrap(),
      RunClaim::Claimed(run) if run.attempt == 3
    ));

    store.upsert_run(&run_in(RunState::Failed, 0)).await.unwrap();
    assert!(matches!(
      store.claim_run("c1", "2024-05", false, ttl).await.unwrap(),
      RunClaim::Claimed(_)
    ));

    // A fetch that stopped writing transitions an hour ago is abandoned.
    store.upsert_run(&run_in(RunState::Fetching, 3_600)).await.unwrap();
    assert!(matches!(
      store.claim_run("c1", "2024-05", false, ttl).await.unwrap(),
      RunClaim::Claimed(run) if run.attempt == 3
    ));
  }

  #[tokio::test]
  async fn artifact_upsert_overwrites_same_period() {
    let store = MemoryReportStore::new();
    let period = crate::models::ReportPeriod::new(2024, 5).unwrap();
    let artifact = ReportArtifact {
      company_id: "c1".to_string(),
      period,
      period_start: period.start(),
      period_end: period.end(),
      generated_at: Utc::now(),
      pdf_bytes: vec![1, 2, 3],
      pdf_sha256: "abc".to_string(),
      delivery_status: DeliveryStatus::Pending,
    };
    store.upsert_artifact(&artifact).await.unwrap();
    store.upsert_artifact(&artifact).await.unwrap();
    assert_eq!(store.artifact_count(), 1);
    assert_eq!(store.artifact_writes(), 2);

    store
      .set_delivery_status("c1", "2024-05", DeliveryStatus::Sent)
      .await
      .unwrap();
    let stored = store.fetch_artifact("c1", "2024-05").await.unwrap().unwrap();
    assert_eq!(stored.delivery_status, DeliveryStatus::Sent);
  }
}

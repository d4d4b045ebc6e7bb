use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};
use tokio::sync::OnceCell;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{
  CompanyProfile, Connection, ConnectionStatus, DeliveryStatus, NewConnection, Provider, ReportArtifact,
  ReportPeriod, ReportRun, RunState,
};
use crate::store::{
  claim_attempt, stale_before, CompanyDirectory, ConnectionStore, EntitlementCheck, ReportStore, RunClaim,
};

static POOL: OnceCell<MySqlPool> = OnceCell::const_new();

async fn ensure_schema(pool: &MySqlPool) -> PipelineResult<()> {
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS provider_connections (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        company_id VARCHAR(128) NOT NULL,
        provider VARCHAR(32) NOT NULL,
        status VARCHAR(16) NOT NULL,
        external_account_id VARCHAR(191) NOT NULL,
        external_account_name VARCHAR(255) NOT NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT NULL,
        token_expires_at TIMESTAMP(3) NULL,
        scope TEXT NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        KEY idx_provider_connections_active (company_id, provider, status),
        KEY idx_provider_connections_status (status)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS report_runs (
        company_id VARCHAR(128) NOT NULL,
        period_key CHAR(7) NOT NULL,
        state VARCHAR(16) NOT NULL,
        attempt INT NOT NULL DEFAULT 0,
        last_error TEXT NULL,
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        PRIMARY KEY (company_id, period_key)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS report_artifacts (
        company_id VARCHAR(128) NOT NULL,
        period_key CHAR(7) NOT NULL,
        period_start DATE NOT NULL,
        period_end DATE NOT NULL,
        generated_at TIMESTAMP(3) NOT NULL,
        pdf_bytes LONGBLOB NOT NULL,
        pdf_sha256 CHAR(64) NOT NULL,
        delivery_status VARCHAR(16) NOT NULL,
        PRIMARY KEY (company_id, period_key)
      );
    "#,
  )
  .execute(pool)
  .await?;

  // Owned by billing and the account service; created here only so local databases work.
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS subscriptions (
        company_id VARCHAR(128) PRIMARY KEY,
        plan VARCHAR(32) NOT NULL,
        status VARCHAR(32) NOT NULL,
        report_generation TINYINT(1) NOT NULL DEFAULT 0,
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS companies (
        id VARCHAR(128) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        report_recipients TEXT NOT NULL
      );
    "#,
  )
  .execute(pool)
  .await?;

  Ok(())
}

pub async fn get_pool(database_url: &str) -> PipelineResult<&'static MySqlPool> {
  POOL
    .get_or_try_init(|| async {
      let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

      ensure_schema(&pool).await?;
      Ok::<_, PipelineError>(pool)
    })
    .await
}

/// `report_recipients` is stored comma-separated.
pub fn parse_recipients(raw: &str) -> Vec<String> {
  raw
    .split([',', ';'])
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_string)
    .collect()
}

fn subscription_entitles_reports(status: &str, report_generation: bool) -> bool {
  report_generation && matches!(status, "active" | "trialing")
}

type ConnectionRow = (
  i64,
  String,
  String,
  String,
  String,
  String,
  String,
  Option<String>,
  Option<DateTime<Utc>>,
  Option<String>,
  DateTime<Utc>,
  DateTime<Utc>,
);

const CONNECTION_COLUMNS: &str = "id, company_id, provider, status, external_account_id, external_account_name, \
   access_token, refresh_token, token_expires_at, scope, created_at, updated_at";

fn connection_from_row(row: ConnectionRow) -> PipelineResult<Connection> {
  let (
    id,
    company_id,
    provider,
    status,
    external_account_id,
    external_account_name,
    encrypted_access_token,
    encrypted_refresh_token,
    token_expires_at,
    scope,
    created_at,
    updated_at,
  ) = row;
  Ok(Connection {
    id,
    company_id,
    provider: Provider::parse(&provider)
      .ok_or_else(|| PipelineError::Storage(format!("unknown provider in row {id}: {provider}")))?,
    status: ConnectionStatus::parse(&status)
      .ok_or_else(|| PipelineError::Storage(format!("unknown status in row {id}: {status}")))?,
    external_account_id,
    external_account_name,
    encrypted_access_token,
    encrypted_refresh_token,
    token_expires_at,
    scope,
    created_at,
    updated_at,
  })
}

#[derive(Clone)]
pub struct MySqlConnectionStore {
  pool: MySqlPool,
}

impl MySqlConnectionStore {
  pub fn new(pool: MySqlPool) -> Self {
    Self { pool }
  }

  async fn fetch_by_id(&self, id: i64) -> PipelineResult<Connection> {
    let row = sqlx::query_as::<_, ConnectionRow>(&format!(
      "SELECT {CONNECTION_COLUMNS} FROM provider_connections WHERE id = ? LIMIT 1;"
    ))
    .bind(id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| PipelineError::NotFound(format!("connection {id}")))?;
    connection_from_row(row)
  }
}

#[async_trait]
impl ConnectionStore for MySqlConnectionStore {
  async fn list_connections(&self, company_id: &str) -> PipelineResult<Vec<Connection>> {
    let rows = sqlx::query_as::<_, ConnectionRow>(&format!(
      "SELECT {CONNECTION_COLUMNS} FROM provider_connections WHERE company_id = ? ORDER BY id;"
    ))
    .bind(company_id)
    .fetch_all(&self.pool)
    .await?;
    rows.into_iter().map(connection_from_row).collect()
  }

  async fn active_connection(
    &self,
    company_id: &str,
    provider: Provider,
  ) -> PipelineResult<Option<Connection>> {
    let row = sqlx::query_as::<_, ConnectionRow>(&format!(
      "SELECT {CONNECTION_COLUMNS} FROM provider_connections \
       WHERE company_id = ? AND provider = ? AND status = 'active' \
       ORDER BY id DESC LIMIT 1;"
    ))
    .bind(company_id)
    .bind(provider.as_str())
    .fetch_optional(&self.pool)
    .await?;
    row.map(connection_from_row).transpose()
  }

  async fn supersede_and_insert(&self, new: NewConnection) -> PipelineResult<Connection> {
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
        UPDATE provider_connections
        SET status = 'revoked'
        WHERE company_id = ? AND provider = ? AND status = 'active';
      "#,
    )
    .bind(&new.company_id)
    .bind(new.provider.as_str())
    .execute(&mut *tx)
    .await?;

    let inserted = sqlx::query(
      r#"
        INSERT INTO provider_connections
          (company_id, provider, status, external_account_id, external_account_name,
           access_token, refresh_token, token_expires_at, scope)
        VALUES
          (?, ?, 'active', ?, ?, ?, ?, ?, ?);
      "#,
    )
    .bind(&new.company_id)
    .bind(new.provider.as_str())
    .bind(&new.external_account_id)
    .bind(&new.external_account_name)
    .bind(&new.encrypted_access_token)
    .bind(&new.encrypted_refresh_token)
    .bind(new.token_expires_at)
    .bind(&new.scope)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    self.fetch_by_id(inserted.last_insert_id() as i64).await
  }

  async fn update_tokens(
    &self,
    connection_id: i64,
    encrypted_access_token: &str,
    encrypted_refresh_token: Option<&str>,
    token_expires_at: Option<DateTime<Utc>>,
    scope: Option<&str>,
  ) -> PipelineResult<()> {
    let result = sqlx::query(
      r#"
        UPDATE provider_connections
        SET access_token = ?,
            refresh_token = COALESCE(?, refresh_token),
            token_expires_at = ?,
            scope = COALESCE(?, scope)
        WHERE id = ?;
      "#,
    )
    .bind(encrypted_access_token)
    .bind(encrypted_refresh_token)
    .bind(token_expires_at)
    .bind(scope)
    .bind(connection_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(PipelineError::NotFound(format!("connection {connection_id}")));
    }
    Ok(())
  }

  async fn set_status(&self, connection_id: i64, status: ConnectionStatus) -> PipelineResult<()> {
    sqlx::query("UPDATE provider_connections SET status = ? WHERE id = ?;")
      .bind(status.as_str())
      .bind(connection_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn companies_with_active_connections(&self) -> PipelineResult<Vec<String>> {
    sqlx::query_scalar::<_, String>(
      r#"
        SELECT DISTINCT company_id
        FROM provider_connections
        WHERE status = 'active'
        ORDER BY company_id;
      "#,
    )
    .fetch_all(&self.pool)
    .await
    .map_err(PipelineError::from)
  }
}

type RunRow = (String, String, String, i32, Option<String>, DateTime<Utc>);

fn run_from_row(row: RunRow) -> PipelineResult<ReportRun> {
  let (company_id, period_key, state, attempt, last_error, updated_at) = row;
  Ok(ReportRun {
    state: RunState::parse(&state)
      .ok_or_else(|| PipelineError::Storage(format!("unknown run state for {company_id}/{period_key}: {state}")))?,
    company_id,
    period_key,
    attempt: attempt.max(0) as u32,
    last_error,
    updated_at,
  })
}

type ArtifactRow = (
  String,
  String,
  NaiveDate,
  NaiveDate,
  DateTime<Utc>,
  Vec<u8>,
  String,
  String,
);

#[derive(Clone)]
pub struct MySqlReportStore {
  pool: MySqlPool,
}

impl MySqlReportStore {
  pub fn new(pool: MySqlPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl ReportStore for MySqlReportStore {
  async fn fetch_run(&self, company_id: &str, period_key: &str) -> PipelineResult<Option<ReportRun>> {
    let row = sqlx::query_as::<_, RunRow>(
      r#"
        SELECT company_id, period_key, state, attempt, last_error, updated_at
        FROM report_runs
        WHERE company_id = ? AND period_key = ?
        LIMIT 1;
      "#,
    )
    .bind(company_id)
    .bind(period_key)
    .fetch_optional(&self.pool)
    .await?;
    row.map(run_from_row).transpose()
  }

  async fn claim_run(
    &self,
    company_id: &str,
    period_key: &str,
    force: bool,
    lock_ttl: Duration,
  ) -> PipelineResult<RunClaim> {
    let now = Utc::now();
    let mut tx = self.pool.begin().await?;

    // Placeholder so there is always a row to lock; a claimable `failed` at attempt 0.
    sqlx::query(
      r#"
        INSERT INTO report_runs (company_id, period_key, state, attempt, last_error, updated_at)
        VALUES (?, ?, 'failed', 0, NULL, ?)
        ON DUPLICATE KEY UPDATE attempt = attempt;
      "#,
    )
    .bind(company_id)
    .bind(period_key)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let row = sqlx::query_as::<_, RunRow>(
      r#"
        SELECT company_id, period_key, state, attempt, last_error, updated_at
        FROM report_runs
        WHERE company_id = ? AND period_key = ?
        FOR UPDATE;
      "#,
    )
    .bind(company_id)
    .bind(period_key)
    .fetch_one(&mut *tx)
    .await?;
    let existing = run_from_row(row)?;

    let attempt = match claim_attempt(Some(&existing), force, stale_before(now, lock_ttl)) {
      Ok(attempt) => attempt,
      Err(claim) => {
        tx.commit().await?;
        return Ok(claim);
      }
    };

    sqlx::query(
      r#"
        UPDATE report_runs
        SET state = 'queued', attempt = ?, last_error = NULL, updated_at = ?
        WHERE company_id = ? AND period_key = ?;
      "#,
    )
    .bind(attempt as i32)
    .bind(now)
    .bind(company_id)
    .bind(period_key)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(RunClaim::Claimed(ReportRun {
      company_id: company_id.to_string(),
      period_key: period_key.to_string(),
      state: RunState::Queued,
      attempt,
      last_error: None,
      updated_at: now,
    }))
  }

  async fn latest_run(&self, company_id: &str) -> PipelineResult<Option<ReportRun>> {
    let row = sqlx::query_as::<_, RunRow>(
      r#"
        SELECT company_id, period_key, state, attempt, last_error, updated_at
        FROM report_runs
        WHERE company_id = ?
        ORDER BY period_key DESC
        LIMIT 1;
      "#,
    )
    .bind(company_id)
    .fetch_optional(&self.pool)
    .await?;
    row.map(run_from_row).transpose()
  }

  async fn upsert_run(&self, run: &ReportRun) -> PipelineResult<()> {
    sqlx::query(
      r#"
        INSERT INTO report_runs (company_id, period_key, state, attempt, last_error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
          state = VALUES(state),
          attempt = VALUES(attempt),
          last_error = VALUES(last_error),
          updated_at = VALUES(updated_at);
      "#,
    )
    .bind(&run.company_id)
    .bind(&run.period_key)
    .bind(run.state.as_str())
    .bind(run.attempt as i32)
    .bind(&run.last_error)
    .bind(run.updated_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn upsert_artifact(&self, artifact: &ReportArtifact) -> PipelineResult<()> {
    sqlx::query(
      r#"
        INSERT INTO report_artifacts
          (company_id, period_key, period_start, period_end, generated_at, pdf_bytes, pdf_sha256, delivery_status)
        VALUES
          (?, ?, ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
          period_start = VALUES(period_start),
          period_end = VALUES(period_end),
          generated_at = VALUES(generated_at),
          pdf_bytes = VALUES(pdf_bytes),
          pdf_sha256 = VALUES(pdf_sha256),
          delivery_status = VALUES(delivery_status);
      "#,
    )
    .bind(&artifact.company_id)
    .bind(artifact.period.key())
    .bind(artifact.period_start)
    .bind(artifact.period_end)
    .bind(artifact.generated_at)
    .bind(&artifact.pdf_bytes)
    .bind(&artifact.pdf_sha256)
    .bind(artifact.delivery_status.as_str())
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn fetch_artifact(
    &self,
    company_id: &str,
    period_key: &str,
  ) -> PipelineResult<Option<ReportArtifact>> {
    let row = sqlx::query_as::<_, ArtifactRow>(
      r#"
        SELECT company_id, period_key, period_start, period_end, generated_at, pdf_bytes, pdf_sha256, delivery_status
        FROM report_artifacts
        WHERE company_id = ? AND period_key = ?
        LIMIT 1;
      "#,
    )
    .bind(company_id)
    .bind(period_key)
    .fetch_optional(&self.pool)
    .await?;

    let Some((company_id, period_key, period_start, period_end, generated_at, pdf_bytes, pdf_sha256, status)) = row
    else {
      return Ok(None);
    };
    Ok(Some(ReportArtifact {
      period: ReportPeriod::parse(&period_key)
        .ok_or_else(|| PipelineError::Storage(format!("bad period key {period_key}")))?,
      delivery_status: DeliveryStatus::parse(&status)
        .ok_or_else(|| PipelineError::Storage(format!("unknown delivery status {status}")))?,
      company_id,
      period_start,
      period_end,
      generated_at,
      pdf_bytes,
      pdf_sha256,
    }))
  }

  async fn set_delivery_status(
    &self,
    company_id: &str,
    period_key: &str,
    status: DeliveryStatus,
  ) -> PipelineResult<()> {
    let result = sqlx::query(
      r#"
        UPDATE report_artifacts
        SET delivery_status = ?
        WHERE company_id = ? AND period_key = ?;
      "#,
    )
    .bind(status.as_str())
    .bind(company_id)
    .bind(period_key)
    .execute(&self.pool)
    .await?;

    // MySQL reports 0 affected rows when the value is unchanged, so only a missing row is an error.
    if result.rows_affected() == 0 && self.fetch_artifact(company_id, period_key).await?.is_none() {
      return Err(PipelineError::NotFound(format!("artifact {company_id}/{period_key}")));
    }
    Ok(())
  }
}

/// Reads the billing-owned `subscriptions` table.
#[derive(Clone)]
pub struct MySqlEntitlements {
  pool: MySqlPool,
}

impl MySqlEntitlements {
  pub fn new(pool: MySqlPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl EntitlementCheck for MySqlEntitlements {
  async fn report_generation_entitled(&self, company_id: &str) -> PipelineResult<bool> {
    let row = sqlx::query_as::<_, (String, bool)>(
      r#"
        SELECT status, report_generation
        FROM subscriptions
        WHERE company_id = ?
        LIMIT 1;
      "#,
    )
    .bind(company_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.is_some_and(|(status, enabled)| subscription_entitles_reports(&status, enabled)))
  }
}

#[derive(Clone)]
pub struct MySqlDirectory {
  pool: MySqlPool,
}

impl MySqlDirectory {
  pub fn new(pool: MySqlPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl CompanyDirectory for MySqlDirectory {
  async fn company_profile(&self, company_id: &str) -> PipelineResult<Option<CompanyProfile>> {
    let row = sqlx::query_as::<_, (String, String, String)>(
      r#"
        SELECT id, name, report_recipients
        FROM companies
        WHERE id = ?
        LIMIT 1;
      "#,
    )
    .bind(company_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(|(company_id, name, recipients)| CompanyProfile {
      company_id,
      name,
      report_recipients: parse_recipients(&recipients),
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn recipients_split_on_commas_and_semicolons() {
    assert_eq!(
      parse_recipients(" a@x.test, b@x.test;;c@x.test ,"),
      vec!["a@x.test", "b@x.test", "c@x.test"]
    );
    assert!(parse_recipients("  ").is_empty());
  }

  #[test]
  fn only_live_subscriptions_with_reports_are_entitled() {
    assert!(subscription_entitles_reports("active", true));
    assert!(subscription_entitles_reports("trialing", true));
    assert!(!subscription_entitles_reports("active", false));
    assert!(!subscription_entitles_reports("canceled", true));
  }

  #[test]
  fn unknown_provider_row_is_a_storage_error() {
    let now = Utc::now();
    let row: ConnectionRow = (
      7,
      "c1".to_string(),
      "fax".to_string(),
      "active".to_string(),
      "a".to_string(),
      "A".to_string(),
      "v1:x".to_string(),
      None,
      None,
      None,
      now,
      now,
    );
    assert!(matches!(connection_from_row(row), Err(PipelineError::Storage(_))));
  }
}

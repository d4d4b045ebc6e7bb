//! Monthly report pipeline.
//!
//! Each tenant runs Queued -> Fetching -> Rendering -> Delivering -> Done/Failed, with every
//! transition written to the report store. Tenants run concurrently in a bounded pool and
//! never affect each other: one tenant failing is recorded on its own run and the batch
//! moves on.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::charts::{generate_charts, ChartCatalog};
use crate::email::{build_report_email, deliver_with_retry, DeliveryPolicy, Mailer};
use crate::error::{PipelineError, PipelineResult};
use crate::integration::IntegrationService;
use crate::models::{
  ConnectionStatus, DeliveryStatus, MetricSeries, Provider, ReportArtifact, ReportPeriod, ReportRun,
  RunState,
};
use crate::report_pdf::{assemble_report, ReportInput};
use crate::store::{CompanyDirectory, ConnectionStore, EntitlementCheck, ReportStore, RunClaim};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantOutcome {
  Succeeded,
  Skipped,
  Failed,
  Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyRunReport {
  pub company_id: String,
  pub period: String,
  pub outcome: TenantOutcome,
  pub state: Option<RunState>,
  /// Sanitized; safe for non-admin callers.
  pub message: Option<String>,
  pub pdf_sha256: Option<String>,
  pub delivery_status: Option<DeliveryStatus>,
  pub charts_rendered: usize,
  pub charts_failed: usize,
  pub partial: bool,
}

impl CompanyRunReport {
  fn bare(company_id: &str, period: ReportPeriod, outcome: TenantOutcome, message: Option<String>) -> Self {
    Self {
      company_id: company_id.to_string(),
      period: period.key(),
      outcome,
      state: None,
      message,
      pdf_sha256: None,
      delivery_status: None,
      charts_rendered: 0,
      charts_failed: 0,
      partial: false,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
  pub period: String,
  pub candidates: usize,
  pub skipped: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub cancelled: usize,
}

impl JobSummary {
  fn record(&mut self, outcome: TenantOutcome) {
    match outcome {
      TenantOutcome::Succeeded => self.succeeded += 1,
      TenantOutcome::Skipped => self.skipped += 1,
      TenantOutcome::Failed => self.failed += 1,
      TenantOutcome::Cancelled => self.cancelled += 1,
    }
  }
}

pub struct PipelineDeps {
  pub integration: Arc<IntegrationService>,
  pub connections: Arc<dyn ConnectionStore>,
  pub reports: Arc<dyn ReportStore>,
  pub entitlements: Arc<dyn EntitlementCheck>,
  pub directory: Arc<dyn CompanyDirectory>,
  pub mailer: Arc<dyn Mailer>,
  pub catalog: Arc<ChartCatalog>,
  pub delivery: DeliveryPolicy,
  pub concurrency: usize,
  pub run_lock_ttl: Duration,
}

pub struct ReportPipeline {
  deps: PipelineDeps,
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
  *cancel.borrow()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
  format!("{:x}", Sha256::digest(bytes))
}

/// Writes each state change of one tenant run.
struct RunTracker<'a> {
  reports: &'a dyn ReportStore,
  company_id: &'a str,
  period: ReportPeriod,
  attempt: u32,
}

impl RunTracker<'_> {
  async fn set(&self, state: RunState, last_error: Option<String>) -> PipelineResult<()> {
    tracing::info!(
      company_id = %self.company_id,
      period = %self.period,
      state = state.as_str(),
      attempt = self.attempt,
      "report run transition"
    );
    self
      .reports
      .upsert_run(&ReportRun {
        company_id: self.company_id.to_string(),
        period_key: self.period.key(),
        state,
        attempt: self.attempt,
        last_error,
        updated_at: Utc::now(),
      })
      .await
  }

  async fn checkpoint(&self, cancel: &watch::Receiver<bool>, next: RunState) -> PipelineResult<()> {
    if is_cancelled(cancel) {
      return Err(PipelineError::Cancelled);
    }
    self.set(next, None).await
  }
}

struct FetchedData {
  providers: Vec<Provider>,
  series: Vec<MetricSeries>,
  partial_providers: BTreeSet<Provider>,
}

impl ReportPipeline {
  pub fn new(deps: PipelineDeps) -> Self {
    Self { deps }
  }

  pub fn catalog(&self) -> &ChartCatalog {
    &self.deps.catalog
  }

  /// Runs every entitled tenant with at least one active connection.
  pub async fn run_monthly(
    self: &Arc<Self>,
    period: ReportPeriod,
    force: bool,
    cancel: watch::Receiver<bool>,
  ) -> PipelineResult<JobSummary> {
    let candidates = self.deps.connections.companies_with_active_connections().await?;
    let mut summary = JobSummary {
      period: period.key(),
      candidates: candidates.len(),
      ..JobSummary::default()
    };
    tracing::info!(
      period = %period,
      candidates = candidates.len(),
      concurrency = self.deps.concurrency,
      force,
      "monthly report job started"
    );

    let semaphore = Arc::new(Semaphore::new(self.deps.concurrency.max(1)));
    let mut set = JoinSet::new();
    for company_id in candidates {
      let pipeline = Arc::clone(self);
      let semaphore = semaphore.clone();
      let cancel = cancel.clone();
      set.spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
          return CompanyRunReport::bare(&company_id, period, TenantOutcome::Cancelled, None);
        };
        // Queued tenants never start once cancellation is requested.
        if is_cancelled(&cancel) {
          return CompanyRunReport::bare(
            &company_id,
            period,
            TenantOutcome::Cancelled,
            Some("cancelled".to_string()),
          );
        }
        pipeline.run_tenant(&company_id, period, force, &cancel).await
      });
    }

    while let Some(joined) = set.join_next().await {
      match joined {
        Ok(report) => summary.record(report.outcome),
        Err(err) => {
          tracing::error!(period = %period, error = %err, "tenant task panicked");
          summary.failed += 1;
        }
      }
    }

    tracing::info!(
      period = %period,
      succeeded = summary.succeeded,
      skipped = summary.skipped,
      failed = summary.failed,
      cancelled = summary.cancelled,
      "monthly report job finished"
    );
    Ok(summary)
  }

  /// On-demand run for one tenant. Same pipeline, same idempotence rules.
  pub async fn run_for_company(
    &self,
    company_id: &str,
    period: ReportPeriod,
    force: bool,
    cancel: &watch::Receiver<bool>,
  ) -> CompanyRunReport {
    self.run_tenant(company_id, period, force, cancel).await
  }

  async fn run_tenant(
    &self,
    company_id: &str,
    period: ReportPeriod,
    force: bool,
    cancel: &watch::Receiver<bool>,
  ) -> CompanyRunReport {
    match self.deps.entitlements.report_generation_entitled(company_id).await {
      Ok(true) => {}
      Ok(false) => {
        tracing::info!(company_id = %company_id, period = %period, "not entitled; skipping");
        return CompanyRunReport::bare(
          company_id,
          period,
          TenantOutcome::Skipped,
          Some("report generation not included in plan".to_string()),
        );
      }
      Err(err) => {
        tracing::error!(company_id = %company_id, error = %err, "entitlement check failed");
        return CompanyRunReport::bare(company_id, period, TenantOutcome::Failed, Some(err.public_message()));
      }
    }

    // Only the caller holding the claim fetches, renders and emails.
    let claimed = match self
      .deps
      .reports
      .claim_run(company_id, &period.key(), force, self.deps.run_lock_ttl)
      .await
    {
      Ok(RunClaim::Claimed(run)) => run,
      Ok(RunClaim::AlreadyDone) => {
        let mut report = CompanyRunReport::bare(
          company_id,
          period,
          TenantOutcome::Skipped,
          Some("report already delivered".to_string()),
        );
        report.state = Some(RunState::Done);
        return report;
      }
      Ok(RunClaim::InProgress) => {
        tracing::info!(company_id = %company_id, period = %period, "report run already in progress; skipping");
        return CompanyRunReport::bare(
          company_id,
          period,
          TenantOutcome::Skipped,
          Some("report run already in progress".to_string()),
        );
      }
      Err(err) => {
        tracing::error!(company_id = %company_id, error = %err, "failed to claim report run");
        return CompanyRunReport::bare(company_id, period, TenantOutcome::Failed, Some(err.public_message()));
      }
    };
    tracing::info!(
      company_id = %company_id,
      period = %period,
      state = RunState::Queued.as_str(),
      attempt = claimed.attempt,
      "report run transition"
    );

    let tracker = RunTracker {
      reports: self.deps.reports.as_ref(),
      company_id,
      period,
      attempt: claimed.attempt,
    };

    let mut report = CompanyRunReport::bare(company_id, period, TenantOutcome::Failed, None);
    match self.pipeline(&tracker, force, cancel, &mut report).await {
      Ok(()) => {
        report.outcome = TenantOutcome::Succeeded;
        report.state = Some(RunState::Done);
      }
      Err(err) => {
        let (outcome, message) = match &err {
          PipelineError::Cancelled => (TenantOutcome::Cancelled, "cancelled".to_string()),
          e if e.is_auth() => (TenantOutcome::Skipped, e.public_message()),
          e => (TenantOutcome::Failed, e.public_message()),
        };
        tracing::warn!(
          company_id = %company_id,
          period = %period,
          error = %err,
          outcome = ?outcome,
          "tenant report run did not complete"
        );
        if let Err(store_err) = tracker.set(RunState::Failed, Some(message.clone())).await {
          tracing::error!(company_id = %company_id, error = %store_err, "failed to record failed run");
        }
        report.outcome = outcome;
        report.state = Some(RunState::Failed);
        report.message = Some(message);
      }
    }
    report
  }

  async fn pipeline(
    &self,
    tracker: &RunTracker<'_>,
    force: bool,
    cancel: &watch::Receiver<bool>,
    report: &mut CompanyRunReport,
  ) -> PipelineResult<()> {
    let company_id = tracker.company_id;
    let period = tracker.period;

    tracker.checkpoint(cancel, RunState::Fetching).await?;
    let fetched = self.fetch_all(company_id, period).await?;

    tracker.checkpoint(cancel, RunState::Rendering).await?;
    let catalog = &self.deps.catalog;
    let keys = fetched
      .providers
      .iter()
      .flat_map(|p| catalog.keys_for(*p))
      .collect::<Vec<_>>();
    let mut outcomes = generate_charts(catalog, &keys, &fetched.series)?;
    for outcome in outcomes.iter_mut() {
      let platform = catalog.get(outcome.key())?.platform;
      if fetched.partial_providers.contains(&platform) {
        outcome.mark_partial();
      }
    }
    report.charts_rendered = outcomes.iter().filter(|o| o.is_rendered()).count();
    report.charts_failed = outcomes.len() - report.charts_rendered;
    report.partial = !fetched.partial_providers.is_empty();

    let profile = self
      .deps
      .directory
      .company_profile(company_id)
      .await?
      .ok_or_else(|| PipelineError::NotFound(format!("company profile {company_id}")))?;

    let pdf = assemble_report(&ReportInput {
      company_name: profile.name.clone(),
      period,
      catalog_version: catalog.version.clone(),
      charts: outcomes,
    })?;
    let sha = sha256_hex(&pdf);
    report.pdf_sha256 = Some(sha.clone());

    let previous = self.deps.reports.fetch_artifact(company_id, &period.key()).await?;
    let already_sent = previous
      .as_ref()
      .is_some_and(|a| a.delivery_status == DeliveryStatus::Sent && a.pdf_sha256 == sha);

    self
      .deps
      .reports
      .upsert_artifact(&ReportArtifact {
        company_id: company_id.to_string(),
        period,
        period_start: period.start(),
        period_end: period.end(),
        generated_at: Utc::now(),
        pdf_bytes: pdf.clone(),
        pdf_sha256: sha,
        delivery_status: if already_sent {
          DeliveryStatus::Sent
        } else {
          DeliveryStatus::Pending
        },
      })
      .await?;

    if already_sent {
      tracing::info!(
        company_id = %company_id,
        period = %period,
        "identical report already delivered; not re-sending"
      );
      report.delivery_status = Some(DeliveryStatus::Sent);
      return tracker.set(RunState::Done, None).await;
    }

    tracker.checkpoint(cancel, RunState::Delivering).await?;
    let email = build_report_email(&profile, period, pdf);
    let status = match deliver_with_retry(self.deps.mailer.as_ref(), &email, self.deps.delivery).await {
      Ok(()) => DeliveryStatus::Sent,
      Err(err) => {
        self
          .deps
          .reports
          .set_delivery_status(company_id, &period.key(), DeliveryStatus::Failed)
          .await?;
        report.delivery_status = Some(DeliveryStatus::Failed);
        return Err(err);
      }
    };
    self
      .deps
      .reports
      .set_delivery_status(company_id, &period.key(), status)
      .await?;
    report.delivery_status = Some(status);
    tracker.set(RunState::Done, None).await
  }

  /// Fetches every connected provider. Providers that fail for non-auth reasons leave their
  /// charts as placeholders; an auth failure ends the tenant's run.
  async fn fetch_all(&self, company_id: &str, period: ReportPeriod) -> PipelineResult<FetchedData> {
    let providers = self
      .deps
      .connections
      .list_connections(company_id)
      .await?
      .into_iter()
      .filter(|c| c.status == ConnectionStatus::Active)
      .map(|c| c.provider)
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect::<Vec<_>>();
    if providers.is_empty() {
      return Err(PipelineError::NotFound(format!("no active connections for {company_id}")));
    }

    let range = period.range();
    let mut series = Vec::new();
    let mut partial_providers = BTreeSet::new();
    let mut last_error = None;
    for provider in &providers {
      let keys = self.deps.catalog.metric_keys_for(*provider);
      match self
        .deps
        .integration
        .fetch_metrics(company_id, *provider, range, &keys)
        .await
      {
        Ok(fetch) => {
          if fetch.partial {
            partial_providers.insert(*provider);
          }
          series.extend(fetch.series);
        }
        Err(err) if err.is_auth() => return Err(err),
        Err(err) => {
          tracing::warn!(
            company_id = %company_id,
            provider = %provider,
            error = %err,
            "provider fetch failed; its charts will be placeholders"
          );
          last_error = Some(err);
        }
      }
    }

    if series.is_empty() {
      if let Some(err) = last_error {
        return Err(err);
      }
    }
    Ok(FetchedData {
      providers,
      series,
      partial_providers,
    })
  }

  /// Re-sends a stored artifact whose delivery failed. A delivered artifact is left alone.
  pub async fn resend(&self, company_id: &str, period: ReportPeriod) -> PipelineResult<DeliveryStatus> {
    let artifact = self
      .deps
      .reports
      .fetch_artifact(company_id, &period.key())
      .await?
      .ok_or_else(|| PipelineError::NotFound(format!("report {company_id}/{period}")))?;
    if artifact.delivery_status == DeliveryStatus::Sent {
      return Ok(DeliveryStatus::Sent);
    }
    let profile = self
      .deps
      .directory
      .company_profile(company_id)
      .await?
      .ok_or_else(|| PipelineError::NotFound(format!("company profile {company_id}")))?;

    let email = build_report_email(&profile, period, artifact.pdf_bytes);
    let status = match deliver_with_retry(self.deps.mailer.as_ref(), &email, self.deps.delivery).await {
      Ok(()) => DeliveryStatus::Sent,
      Err(err) => {
        tracing::warn!(company_id = %company_id, period = %period, error = %err, "manual resend failed");
        DeliveryStatus::Failed
      }
    };
    self
      .deps
      .reports
      .set_delivery_status(company_id, &period.key(), status)
      .await?;

    if status == DeliveryStatus::Sent {
      let attempt = self
        .deps
        .reports
        .fetch_run(company_id, &period.key())
        .await?
        .map(|r| r.attempt)
        .unwrap_or(1);
      RunTracker {
        reports: self.deps.reports.as_ref(),
        company_id,
        period,
        attempt,
      }
      .set(RunState::Done, None)
      .await?;
    }
    Ok(status)
  }
}

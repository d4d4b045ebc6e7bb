use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CompanyProfile, ReportPeriod};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEmail {
  pub company_id: String,
  pub to: Vec<String>,
  pub subject: String,
  pub body_text: String,
  pub attachment_name: String,
  pub pdf: Vec<u8>,
}

pub fn build_report_email(profile: &CompanyProfile, period: ReportPeriod, pdf: Vec<u8>) -> ReportEmail {
  ReportEmail {
    company_id: profile.company_id.clone(),
    to: profile.report_recipients.clone(),
    subject: format!("{}: marketing report for {period}", profile.name),
    body_text: format!(
      "Hello,\n\nattached is the marketing performance report for {} covering {period}.\n",
      profile.name
    ),
    attachment_name: format!("report-{period}.pdf"),
    pdf,
  }
}

#[async_trait]
pub trait Mailer: Send + Sync {
  async fn send_report(&self, email: &ReportEmail) -> PipelineResult<()>;
}

pub struct SmtpMailer {
  transport: AsyncSmtpTransport<Tokio1Executor>,
  from: Mailbox,
}

impl SmtpMailer {
  pub fn from_config(config: &SmtpConfig) -> PipelineResult<Self> {
    let from = config
      .from
      .parse::<Mailbox>()
      .map_err(|e| PipelineError::Config(format!("invalid SMTP_FROM: {e}")))?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
      .map_err(|e| PipelineError::Config(format!("invalid SMTP_HOST: {e}")))?
      .port(config.port);
    if !config.username.is_empty() {
      builder = builder.credentials(Credentials::new(config.username.clone(), config.password.clone()));
    }
    Ok(Self {
      transport: builder.build(),
      from,
    })
  }
}

fn build_message(from: &Mailbox, email: &ReportEmail) -> PipelineResult<Message> {
  let mut builder = Message::builder().from(from.clone()).subject(email.subject.clone());
  for recipient in &email.to {
    let mailbox = recipient
      .parse::<Mailbox>()
      .map_err(|e| PipelineError::Delivery(format!("invalid recipient {recipient}: {e}")))?;
    builder = builder.to(mailbox);
  }
  let pdf_type = ContentType::parse("application/pdf")
    .map_err(|e| PipelineError::Delivery(format!("invalid content type: {e}")))?;
  builder
    .multipart(
      MultiPart::mixed()
        .singlepart(SinglePart::plain(email.body_text.clone()))
        .singlepart(Attachment::new(email.attachment_name.clone()).body(email.pdf.clone(), pdf_type)),
    )
    .map_err(|e| PipelineError::Delivery(format!("failed to build message: {e}")))
}

#[async_trait]
impl Mailer for SmtpMailer {
  async fn send_report(&self, email: &ReportEmail) -> PipelineResult<()> {
    if email.to.is_empty() {
      return Err(PipelineError::Delivery("no report recipients configured".to_string()));
    }
    let message = build_message(&self.from, email)?;
    self
      .transport
      .send(message)
      .await
      .map_err(|e| PipelineError::Delivery(format!("smtp send failed: {e}")))?;
    Ok(())
  }
}

/// Stands in when SMTP is not configured. Every send fails, so artifacts stay resendable.
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
  async fn send_report(&self, _email: &ReportEmail) -> PipelineResult<()> {
    Err(PipelineError::Delivery("SMTP is not configured".to_string()))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
  pub attempts: u32,
  pub retry_delay: Duration,
  pub timeout: Duration,
}

impl Default for DeliveryPolicy {
  fn default() -> Self {
    Self {
      attempts: 3,
      retry_delay: Duration::from_secs(2),
      timeout: Duration::from_secs(60),
    }
  }
}

/// Fixed-delay retry. The last error is returned as `Delivery`.
pub async fn deliver_with_retry(
  mailer: &dyn Mailer,
  email: &ReportEmail,
  policy: DeliveryPolicy,
) -> PipelineResult<()> {
  let attempts = policy.attempts.max(1);
  let mut last_error = String::new();
  for attempt in 1..=attempts {
    match tokio::time::timeout(policy.timeout, mailer.send_report(email)).await {
      Ok(Ok(())) => {
        tracing::info!(company_id = %email.company_id, attempt, "report email sent");
        return Ok(());
      }
      Ok(Err(err)) => last_error = err.to_string(),
      Err(_) => last_error = format!("send timed out after {}s", policy.timeout.as_secs()),
    }
    tracing::warn!(
      company_id = %email.company_id,
      attempt,
      error = %last_error,
      "report email attempt failed"
    );
    if attempt < attempts {
      tokio::time::sleep(policy.retry_delay).await;
    }
  }
  Err(PipelineError::Delivery(format!(
    "gave up after {attempts} attempt(s): {last_error}"
  )))
}

/// Keeps sent emails in memory instead of talking SMTP; used for dry runs and tests.
#[derive(Default)]
pub struct RecordingMailer {
  sent: Mutex<Vec<ReportEmail>>,
  failures_left: Mutex<u32>,
}

impl RecordingMailer {
  pub fn new() -> Self {
    Self::default()
  }

  /// The first `failures` sends fail.
  pub fn failing_first(failures: u32) -> Self {
    Self {
      sent: Mutex::new(Vec::new()),
      failures_left: Mutex::new(failures),
    }
  }

  pub fn sent(&self) -> Vec<ReportEmail> {
    self.sent.lock().map(|s| s.clone()).unwrap_or_default()
  }
}

#[async_trait]
impl Mailer for RecordingMailer {
  async fn send_report(&self, email: &ReportEmail) -> PipelineResult<()> {
    {
      let mut failures = self
        .failures_left
        .lock()
        .map_err(|_| PipelineError::Delivery("mailer lock poisoned".to_string()))?;
      if *failures > 0 {
        *failures -= 1;
        return Err(PipelineError::Delivery("simulated smtp failure".to_string()));
      }
    }
    self
      .sent
      .lock()
      .map_err(|_| PipelineError::Delivery("mailer lock poisoned".to_string()))?
      .push(email.clone());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn email() -> ReportEmail {
    build_report_email(
      &CompanyProfile {
        company_id: "co-1".to_string(),
        name: "Acme".to_string(),
        report_recipients: vec!["ops@acme.test".to_string()],
      },
      ReportPeriod::new(2024, 5).unwrap(),
      b"%PDF-1.7".to_vec(),
    )
  }

  fn quick() -> DeliveryPolicy {
    DeliveryPolicy {
      attempts: 3,
      retry_delay: Duration::from_millis(0),
      timeout: Duration::from_secs(5),
    }
  }

  #[test]
  fn attachment_is_named_after_period() {
    let email = email();
    assert_eq!(email.attachment_name, "report-2024-05.pdf");
    assert!(email.subject.contains("2024-05"));
  }

  #[tokio::test]
  async fn retries_until_success() {
    let mailer = RecordingMailer::failing_first(2);
    deliver_with_retry(&mailer, &email(), quick()).await.unwrap();
    assert_eq!(mailer.sent().len(), 1);
  }

  #[tokio::test]
  async fn gives_up_after_fixed_attempts() {
    let mailer = RecordingMailer::failing_first(3);
    let err = deliver_with_retry(&mailer, &email(), quick()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Delivery(msg) if msg.contains("3 attempt")));
    assert!(mailer.sent().is_empty());
  }

  #[test]
  fn smtp_message_carries_pdf_attachment() {
    let from = "Reports <reports@example.com>".parse::<Mailbox>().unwrap();
    let formatted = String::from_utf8(build_message(&from, &email()).unwrap().formatted()).unwrap();
    assert!(formatted.contains("report-2024-05.pdf"));
    assert!(formatted.contains("application/pdf"));
  }
}

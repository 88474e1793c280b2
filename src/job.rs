//! One scheduled run: export every post's relations, build its message once,
//! deliver it to each recipient.
//!
//! The first failure ends the run. Recipients already delivered stay
//! delivered; later recipients and posts are not attempted until the next
//! trigger.

use crate::config::Config;
use crate::db::{self, RelationSource, SqlxSource};
use crate::export;
use crate::mime::{self, MessageHeaders};
use crate::model::DeliverySpec;
use crate::scheduler::ScheduledTask;
use crate::smtp::{MailTransport, SmtpTransport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

/// Work completed by a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    pub exports: usize,
    pub messages: usize,
    pub deliveries: usize,
}

pub struct JobRunner {
    config: Config,
    running: Mutex<()>,
}

impl JobRunner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            running: Mutex::new(()),
        }
    }

    /// Run every post once against a fresh pool. Returns `None` without doing
    /// anything when another run is still in progress.
    pub async fn run_once(&self) -> Result<Option<JobReport>> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("previous run still in progress; skipping this trigger");
            return Ok(None);
        };
        info!("starting run");

        let transport = SmtpTransport::from_config(&self.config.email)
            .context("failed to configure smtp transport")?;
        let pool = db::connect(&self.config.db)
            .await
            .context("failed to connect to the database")?;
        let source = SqlxSource::new(pool.clone());

        let result = run_posts(&self.config.delivery_specs(), &source, &transport).await;
        pool.close().await;
        result.map(Some)
    }
}

#[async_trait]
impl ScheduledTask for JobRunner {
    async fn run(&self) {
        match self.run_once().await {
            Ok(Some(report)) => info!(
                exports = report.exports,
                messages = report.messages,
                deliveries = report.deliveries,
                "run completed"
            ),
            Ok(None) => {}
            Err(err) => error!(?err, "run aborted"),
        }
    }
}

/// Process posts in order, stopping at the first error.
pub async fn run_posts(
    specs: &[DeliverySpec],
    source: &dyn RelationSource,
    transport: &dyn MailTransport,
) -> Result<JobReport> {
    let mut report = JobReport::default();
    for (idx, spec) in specs.iter().enumerate() {
        deliver(idx, spec, source, transport, &mut report).await?;
    }
    Ok(report)
}

#[instrument(skip(spec, source, transport, report), fields(subject = %spec.subject))]
async fn deliver(
    post: usize,
    spec: &DeliverySpec,
    source: &dyn RelationSource,
    transport: &dyn MailTransport,
    report: &mut JobReport,
) -> Result<()> {
    let mut attachments = Vec::with_capacity(spec.attachments.len());
    for req in &spec.attachments {
        let attachment = export::export_attachment(source, &req.relation, &req.file_name)
            .await
            .with_context(|| format!("failed to export table {}", req.relation))?;
        report.exports += 1;
        attachments.push(attachment);
    }

    // One message goes to every recipient, so with several of them no single
    // address is written into `To`.
    let to = match spec.recipients.as_slice() {
        [only] => vec![only.clone()],
        _ => Vec::new(),
    };
    let headers = MessageHeaders {
        from: spec.from.clone(),
        to,
        subject: spec.subject.clone(),
    };
    let message = mime::build(&headers, &spec.body_text, &attachments)
        .context("failed to build message")?;
    report.messages += 1;

    for recipient in &spec.recipients {
        info!(%recipient, "sending message");
        transport
            .send(&spec.from, recipient, &message.bytes)
            .await
            .with_context(|| format!("failed to send email to {recipient}"))?;
        report.deliveries += 1;
        info!(%recipient, "email sent");
    }
    Ok(())
}

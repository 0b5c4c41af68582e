use async_trait::async_trait;
use serde::Serialize;
use tracing::error;

use durable_core::config::AlertsConfig;

use crate::types::PersistedJob;

/// Operator notification for an occurrence that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureAlert {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub job_name: String,
    pub job_id: i64,
}

impl FailureAlert {
    pub fn for_job(config: &AlertsConfig, job: &PersistedJob) -> Self {
        let host = config.host_name();
        let body = format!(
            "A durable job has failed repeatedly on {host}\n\n\
             This needs to be investigated by IT staff or the deployment's technical contact.\n\n\
             Error report for: job_name=\"{name}\", job_ID={id}\n{errors}",
            name = job.job_name,
            id = job.id,
            errors = job
                .error_message
                .as_deref()
                .unwrap_or("Job is missing error messages."),
        );
        Self {
            recipient: config.recipient().to_string(),
            subject: format!("ERROR: Durable job failure on {host}"),
            body,
            job_name: job.job_name.clone(),
            job_id: job.id,
        }
    }
}

/// Delivers [`FailureAlert`]s. Delivery failures are logged by the caller
/// and never affect job bookkeeping.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &FailureAlert) -> anyhow::Result<()>;
}

/// Writes alerts to the log instead of sending them anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &FailureAlert) -> anyhow::Result<()> {
        error!(
            recipient = %alert.recipient,
            job_name = %alert.job_name,
            job_id = alert.job_id,
            subject = %alert.subject,
            "{}",
            alert.body
        );
        Ok(())
    }
}

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use durable_jobs::{AlertNotifier, FailureAlert};

/// Upper bound on one relay request. Alerts are sent while a runner pass
/// is in progress, so a hung relay must not hold the pass open.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(15);

/// Posts failure alerts as JSON to an HTTP mail relay.
pub struct HttpRelayNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpRelayNotifier {
    pub fn new(url: impl Into<String>) -> reqwest::Result<Self> {
        Self::with_timeout(url, RELAY_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

pub fn alert_payload(alert: &FailureAlert) -> serde_json::Value {
    serde_json::json!({
        "to":       alert.recipient,
        "subject":  alert.subject,
        "body":     alert.body,
        "job_name": alert.job_name,
        "job_id":   alert.job_id,
    })
}

#[async_trait]
impl AlertNotifier for HttpRelayNotifier {
    async fn notify(&self, alert: &FailureAlert) -> anyhow::Result<()> {
        debug!(url = %self.url, job_id = alert.job_id, "posting failure alert to relay");

        let resp = self
            .client
            .post(&self.url)
            .json(&alert_payload(alert))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "mail relay rejected alert");
            anyhow::bail!("mail relay returned {status}");
        }
        Ok(())
    }
}

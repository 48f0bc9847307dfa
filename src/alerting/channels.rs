//! Alerting sinks.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{Alert, AlertError, AlertingService};
use crate::errors::Severity;

/// Writes alerts to the structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerter;

impl LogAlerter {
    fn emit(stream: &'static str, alert: &Alert) {
        if alert.severity >= Severity::High {
            tracing::error!(
                stream,
                severity = %alert.severity,
                source = %alert.source,
                fields = ?alert.fields,
                "{}: {}",
                alert.title,
                alert.message
            );
        } else {
            tracing::warn!(
                stream,
                severity = %alert.severity,
                source = %alert.source,
                fields = ?alert.fields,
                "{}: {}",
                alert.title,
                alert.message
            );
        }
    }
}

#[async_trait]
impl AlertingService for LogAlerter {
    async fn send_security_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        Self::emit("security", alert);
        Ok(())
    }

    async fn send_system_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        Self::emit("system", alert);
        Ok(())
    }

    async fn send_quota_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        Self::emit("quota", alert);
        Ok(())
    }
}

/// Posts alerts as JSON to an HTTP webhook (Slack-compatible `text` field included).
#[derive(Debug, Clone)]
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: Url,
}

impl WebhookAlerter {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    async fn post(&self, stream: &str, alert: &Alert) -> Result<(), AlertError> {
        let payload = serde_json::json!({
            "text": format!("[{}] {}: {}", alert.severity, alert.title, alert.message),
            "stream": stream,
            "alert": alert,
        });

        let response = self.client.post(self.url.clone()).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Delivery(format!(
                "webhook answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AlertingService for WebhookAlerter {
    async fn send_security_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        self.post("security", alert).await
    }

    async fn send_system_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        self.post("system", alert).await
    }

    async fn send_quota_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        self.post("quota", alert).await
    }
}

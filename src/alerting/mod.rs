//! Alerting collaborator.
//!
//! # Data Flow
//! ```text
//! ErrorHandler (severity >= threshold) ─┐
//! QuotaEnforcer (quota denied)          ├─→ dispatch_alert (spawned)
//! Signed URL / security checks          ┘      → AlertingService impl
//!                                              → LogAlerter | WebhookAlerter
//! ```
//!
//! # Design Decisions
//! - Delivery is fire-and-forget: failures are logged and never escalated
//! - Callers never await alert delivery on the request path

pub mod channels;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::errors::Severity;

pub use channels::{LogAlerter, WebhookAlerter};

/// Which alert stream an alert belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Security,
    System,
    Quota,
}

/// A single alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub category: AlertCategory,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    /// Component that raised the alert.
    pub source: String,
    pub fields: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        category: AlertCategory,
        severity: Severity,
        source: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            title: title.into(),
            message: message.into(),
            severity,
            source: source.into(),
            fields: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),

    #[error("alert webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Sink for security, system and quota alerts.
#[async_trait]
pub trait AlertingService: Send + Sync + Debug {
    async fn send_security_alert(&self, alert: &Alert) -> Result<(), AlertError>;

    async fn send_system_alert(&self, alert: &Alert) -> Result<(), AlertError>;

    async fn send_quota_alert(&self, alert: &Alert) -> Result<(), AlertError>;
}

pub type SharedAlerting = Arc<dyn AlertingService>;

async fn deliver(service: &dyn AlertingService, alert: &Alert) -> Result<(), AlertError> {
    match alert.category {
        AlertCategory::Security => service.send_security_alert(alert).await,
        AlertCategory::System => service.send_system_alert(alert).await,
        AlertCategory::Quota => service.send_quota_alert(alert).await,
    }
}

/// Deliver an alert in the background.
///
/// Outside a Tokio runtime the alert is logged and dropped.
pub fn dispatch_alert(service: SharedAlerting, alert: Alert) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!(title = %alert.title, "No async runtime available, alert dropped");
            return;
        }
    };

    handle.spawn(async move {
        if let Err(e) = deliver(service.as_ref(), &alert).await {
            tracing::warn!(
                error = %e,
                category = ?alert.category,
                title = %alert.title,
                "Failed to deliver alert"
            );
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Alerting sink that records every alert it receives.
    #[derive(Debug, Default)]
    pub struct RecordingAlerter {
        pub alerts: Mutex<Vec<Alert>>,
        pub fail: bool,
    }

    impl RecordingAlerter {
        pub fn failing() -> Self {
            Self {
                alerts: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn count(&self) -> usize {
            self.alerts.lock().len()
        }

        fn record(&self, alert: &Alert) -> Result<(), AlertError> {
            self.alerts.lock().push(alert.clone());
            if self.fail {
                return Err(AlertError::Delivery("sink unavailable".into()));
            }
            Ok(())
        }

        /// Wait until `n` alerts arrived or a short deadline passes.
        pub async fn wait_for(&self, n: usize) -> bool {
            for _ in 0..100 {
                if self.count() >= n {
                    return true;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            false
        }
    }

    #[async_trait]
    impl AlertingService for RecordingAlerter {
        async fn send_security_alert(&self, alert: &Alert) -> Result<(), AlertError> {
            self.record(alert)
        }

        async fn send_system_alert(&self, alert: &Alert) -> Result<(), AlertError> {
            self.record(alert)
        }

        async fn send_quota_alert(&self, alert: &Alert) -> Result<(), AlertError> {
            self.record(alert)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingAlerter;
    use super::*;

    #[tokio::test]
    async fn test_dispatch_routes_by_category() {
        let sink = Arc::new(RecordingAlerter::default());
        let alert = Alert::new(
            AlertCategory::Quota,
            Severity::Medium,
            "quota",
            "Quota exceeded",
            "user u1 hit the monthly conversions cap",
        )
        .with_field("user_id", "u1");

        dispatch_alert(sink.clone(), alert);

        assert!(sink.wait_for(1).await);
        let alerts = sink.alerts.lock();
        assert_eq!(alerts[0].category, AlertCategory::Quota);
        assert_eq!(alerts[0].fields["user_id"], "u1");
    }

    #[tokio::test]
    async fn test_dispatch_swallows_delivery_failure() {
        let sink = Arc::new(RecordingAlerter::failing());
        let alert = Alert::new(AlertCategory::System, Severity::High, "test", "boom", "boom");

        dispatch_alert(sink.clone(), alert);

        assert!(sink.wait_for(1).await);
    }

    #[test]
    fn test_dispatch_without_runtime_is_a_noop() {
        let sink = Arc::new(RecordingAlerter::default());
        let alert = Alert::new(AlertCategory::System, Severity::High, "test", "boom", "boom");

        dispatch_alert(sink.clone(), alert);

        assert_eq!(sink.count(), 0);
    }
}

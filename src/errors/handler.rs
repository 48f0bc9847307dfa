//! Normalises failures into [`ApiError`] values.

use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use dashmap::DashMap;

use crate::alerting::{dispatch_alert, Alert, AlertCategory, SharedAlerting};
use crate::config::ErrorHandlingConfig;
use crate::errors::taxonomy::{ApiError, Classify, ErrorContext, ErrorType, ServiceError, Severity};
use crate::observability::metrics;

/// Maps raw errors onto the taxonomy and escalates severe ones.
#[derive(Debug)]
pub struct ErrorHandler {
    config: ErrorHandlingConfig,
    alerting: Option<SharedAlerting>,
    counts: DashMap<ErrorType, u64>,
}

/// Fields a caller may pin instead of taking the taxonomy defaults.
#[derive(Default)]
struct Overrides {
    retryable: Option<bool>,
    retry_after: Option<Duration>,
    severity: Option<Severity>,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlingConfig) -> Self {
        Self {
            config,
            alerting: None,
            counts: DashMap::new(),
        }
    }

    pub fn with_alerting(mut self, alerting: SharedAlerting) -> Self {
        self.alerting = Some(alerting);
        self
    }

    /// Normalise an arbitrary error under an explicit kind.
    pub fn handle_error(
        &self,
        error: &dyn Error,
        error_type: ErrorType,
        context: ErrorContext,
    ) -> ApiError {
        self.build(error, error_type, Overrides::default(), context)
    }

    /// Normalise a [`ServiceError`] using the tag it carries.
    pub fn handle(&self, error: &ServiceError, context: ErrorContext) -> ApiError {
        let overrides = Overrides {
            retryable: error.retryable,
            retry_after: error.retry_after,
            severity: error.severity,
        };
        self.build(error, error.kind, overrides, context)
    }

    /// Normalise any module error that knows its own kind.
    pub fn handle_classified<E: Classify>(&self, error: &E, context: ErrorContext) -> ApiError {
        let overrides = Overrides {
            retryable: error.retryable_override(),
            retry_after: error.retry_after(),
            severity: None,
        };
        self.build(error, error.error_type(), overrides, context)
    }

    pub fn http_status(&self, error_type: ErrorType) -> StatusCode {
        error_type.http_status()
    }

    /// Errors handled so far, per kind.
    pub fn error_counts(&self) -> HashMap<ErrorType, u64> {
        self.counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    fn build(
        &self,
        error: &dyn Error,
        error_type: ErrorType,
        overrides: Overrides,
        context: ErrorContext,
    ) -> ApiError {
        let severity = resolve_severity(error_type, overrides.severity);
        let code = error_type.code();
        let message = self
            .config
            .message_overrides
            .get(code)
            .cloned()
            .unwrap_or_else(|| error_type.default_message().to_string());
        let details = self.config.show_detailed_errors.then(|| error.to_string());
        let retryable = overrides
            .retryable
            .unwrap_or_else(|| error_type.is_retryable());
        let retry_after = overrides
            .retry_after
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0));

        *self.counts.entry(error_type).or_insert(0) += 1;
        metrics::record_api_error(error_type.as_str(), severity.as_str());

        if severity >= Severity::High {
            tracing::error!(
                error = %error,
                error_type = %error_type,
                severity = %severity,
                request_id = ?context.request_id,
                endpoint = ?context.endpoint,
                "Request failed"
            );
        } else {
            tracing::warn!(
                error = %error,
                error_type = %error_type,
                severity = %severity,
                request_id = ?context.request_id,
                endpoint = ?context.endpoint,
                "Request rejected"
            );
        }

        if severity >= self.config.alert_threshold {
            self.escalate(error, error_type, severity, &context);
        }

        ApiError {
            error_type,
            severity,
            code: code.to_string(),
            message,
            details,
            context,
            timestamp: Utc::now(),
            retryable,
            retry_after,
            suggestions: error_type
                .suggestions()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            metadata: HashMap::new(),
        }
    }

    fn escalate(
        &self,
        error: &dyn Error,
        error_type: ErrorType,
        severity: Severity,
        context: &ErrorContext,
    ) {
        let Some(alerting) = &self.alerting else {
            return;
        };

        let category = match error_type {
            ErrorType::Security => AlertCategory::Security,
            ErrorType::QuotaExceeded => AlertCategory::Quota,
            _ => AlertCategory::System,
        };
        let mut alert = Alert::new(
            category,
            severity,
            "error_handler",
            format!("{} error ({})", error_type, error_type.code()),
            error.to_string(),
        );
        for (key, value) in [
            ("request_id", &context.request_id),
            ("user_id", &context.user_id),
            ("endpoint", &context.endpoint),
            ("ip_address", &context.ip_address),
        ] {
            if let Some(value) = value {
                alert = alert.with_field(key, value.clone());
            }
        }

        dispatch_alert(alerting.clone(), alert);
    }
}

/// Security is always critical and system errors never drop below high.
fn resolve_severity(error_type: ErrorType, requested: Option<Severity>) -> Severity {
    match error_type {
        ErrorType::Security => Severity::Critical,
        ErrorType::System => requested.unwrap_or(Severity::High).max(Severity::High),
        _ => requested.unwrap_or_else(|| error_type.severity()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::testing::RecordingAlerter;
    use std::sync::Arc;

    fn context() -> ErrorContext {
        ErrorContext {
            request_id: Some("req-1".into()),
            endpoint: Some("/v1/conversions".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_severity_floors() {
        let handler = ErrorHandler::new(ErrorHandlingConfig::default());

        let security = ServiceError::new(ErrorType::Security, "tampered").with_severity(Severity::Low);
        assert_eq!(handler.handle(&security, context()).severity, Severity::Critical);

        let system = ServiceError::system("db down").with_severity(Severity::Medium);
        assert_eq!(handler.handle(&system, context()).severity, Severity::High);

        let system = ServiceError::system("db down").with_severity(Severity::Critical);
        assert_eq!(handler.handle(&system, context()).severity, Severity::Critical);

        let validation = ServiceError::validation("bad width").with_severity(Severity::Medium);
        assert_eq!(handler.handle(&validation, context()).severity, Severity::Medium);
    }

    #[test]
    fn test_details_hidden_by_default() {
        let handler = ErrorHandler::new(ErrorHandlingConfig::default());
        let err = ServiceError::system("connection string postgres://secret@db");

        let api = handler.handle(&err, context());
        assert_eq!(api.code, "INTERNAL_ERROR");
        assert_eq!(api.message, ErrorType::System.default_message());
        assert!(api.details.is_none());
        assert!(!api.message.contains("secret"));

        let verbose = ErrorHandler::new(ErrorHandlingConfig {
            show_detailed_errors: true,
            ..Default::default()
        });
        assert!(verbose.handle(&err, context()).details.unwrap().contains("postgres"));
    }

    #[test]
    fn test_message_override_and_retry_fields() {
        let mut config = ErrorHandlingConfig::default();
        config
            .message_overrides
            .insert("RATE_LIMIT_EXCEEDED".into(), "Easy there!".into());
        let handler = ErrorHandler::new(config);

        let err = ServiceError::new(ErrorType::RateLimit, "ip limit")
            .with_retry_after(Duration::from_millis(1_500));
        let api = handler.handle(&err, context());

        assert_eq!(api.message, "Easy there!");
        assert!(api.retryable);
        assert_eq!(api.retry_after, Some(2));
        assert_eq!(api.status(), StatusCode::TOO_MANY_REQUESTS);

        let pinned = ServiceError::network("reset by peer").with_retryable(false);
        assert!(!handler.handle(&pinned, context()).retryable);
    }

    #[test]
    fn test_error_counts() {
        let handler = ErrorHandler::new(ErrorHandlingConfig::default());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");

        handler.handle_error(&io, ErrorType::Storage, context());
        handler.handle_error(&io, ErrorType::Storage, context());
        handler.handle_error(&io, ErrorType::NotFound, ErrorContext::default());

        let counts = handler.error_counts();
        assert_eq!(counts[&ErrorType::Storage], 2);
        assert_eq!(counts[&ErrorType::NotFound], 1);
        assert_eq!(handler.http_status(ErrorType::Storage), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[tokio::test]
    async fn test_alerts_at_threshold_only() {
        let sink = Arc::new(RecordingAlerter::default());
        let handler = ErrorHandler::new(ErrorHandlingConfig::default()).with_alerting(sink.clone());

        handler.handle(&ServiceError::validation("bad input"), context());
        handler.handle(&ServiceError::new(ErrorType::Security, "forged signature"), context());

        assert!(sink.wait_for(1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, AlertCategory::Security);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].fields["request_id"], "req-1");
    }

    #[tokio::test]
    async fn test_alert_failure_is_absorbed() {
        let sink = Arc::new(RecordingAlerter::failing());
        let handler = ErrorHandler::new(ErrorHandlingConfig::default()).with_alerting(sink.clone());

        let api = handler.handle(&ServiceError::system("boom"), context());

        assert_eq!(api.error_type, ErrorType::System);
        assert!(sink.wait_for(1).await);
    }
}

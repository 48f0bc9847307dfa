//! Error kinds, severities and the user-facing error shape.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fourteen error kinds every component classifies its failures into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimit,
    QuotaExceeded,
    System,
    Network,
    Timeout,
    Security,
    Payment,
    Storage,
    External,
}

impl ErrorType {
    pub const ALL: [ErrorType; 14] = [
        ErrorType::Validation,
        ErrorType::Authentication,
        ErrorType::Authorization,
        ErrorType::NotFound,
        ErrorType::Conflict,
        ErrorType::RateLimit,
        ErrorType::QuotaExceeded,
        ErrorType::System,
        ErrorType::Network,
        ErrorType::Timeout,
        ErrorType::Security,
        ErrorType::Payment,
        ErrorType::Storage,
        ErrorType::External,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Validation => "validation",
            ErrorType::Authentication => "authentication",
            ErrorType::Authorization => "authorization",
            ErrorType::NotFound => "not_found",
            ErrorType::Conflict => "conflict",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::QuotaExceeded => "quota_exceeded",
            ErrorType::System => "system",
            ErrorType::Network => "network",
            ErrorType::Timeout => "timeout",
            ErrorType::Security => "security",
            ErrorType::Payment => "payment",
            ErrorType::Storage => "storage",
            ErrorType::External => "external",
        }
    }

    /// Fixed severity of the kind.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorType::Validation | ErrorType::NotFound => Severity::Low,
            ErrorType::Authentication
            | ErrorType::Authorization
            | ErrorType::Conflict
            | ErrorType::RateLimit
            | ErrorType::QuotaExceeded
            | ErrorType::Network
            | ErrorType::Timeout
            | ErrorType::External => Severity::Medium,
            ErrorType::System | ErrorType::Payment | ErrorType::Storage => Severity::High,
            ErrorType::Security => Severity::Critical,
        }
    }

    /// Default retryability of the kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorType::Network
                | ErrorType::Timeout
                | ErrorType::Storage
                | ErrorType::External
                | ErrorType::RateLimit
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorType::Validation => "VALIDATION_ERROR",
            ErrorType::Authentication => "AUTHENTICATION_REQUIRED",
            ErrorType::Authorization => "ACCESS_DENIED",
            ErrorType::NotFound => "RESOURCE_NOT_FOUND",
            ErrorType::Conflict => "RESOURCE_CONFLICT",
            ErrorType::RateLimit => "RATE_LIMIT_EXCEEDED",
            ErrorType::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorType::System => "INTERNAL_ERROR",
            ErrorType::Network => "NETWORK_ERROR",
            ErrorType::Timeout => "REQUEST_TIMEOUT",
            ErrorType::Security => "SECURITY_VIOLATION",
            ErrorType::Payment => "PAYMENT_FAILED",
            ErrorType::Storage => "STORAGE_ERROR",
            ErrorType::External => "UPSTREAM_SERVICE_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorType::Validation => StatusCode::BAD_REQUEST,
            ErrorType::Authentication => StatusCode::UNAUTHORIZED,
            ErrorType::Authorization | ErrorType::Security => StatusCode::FORBIDDEN,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::Conflict => StatusCode::CONFLICT,
            ErrorType::RateLimit | ErrorType::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::System => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::Network | ErrorType::External => StatusCode::BAD_GATEWAY,
            ErrorType::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorType::Payment => StatusCode::PAYMENT_REQUIRED,
            ErrorType::Storage => StatusCode::INSUFFICIENT_STORAGE,
        }
    }

    /// Generic, user-safe message.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorType::Validation => "The request contains invalid data.",
            ErrorType::Authentication => "Authentication is required to access this resource.",
            ErrorType::Authorization => "You do not have permission to perform this action.",
            ErrorType::NotFound => "The requested resource was not found.",
            ErrorType::Conflict => "The request conflicts with the current state of the resource.",
            ErrorType::RateLimit => "Too many requests. Please slow down.",
            ErrorType::QuotaExceeded => "Your plan's usage quota has been reached.",
            ErrorType::System => "An internal error occurred. Please try again later.",
            ErrorType::Network => "A network error occurred while contacting a dependent service.",
            ErrorType::Timeout => "The request took too long to complete.",
            ErrorType::Security => "The request was rejected for security reasons.",
            ErrorType::Payment => "The payment could not be processed.",
            ErrorType::Storage => "The file could not be stored or retrieved.",
            ErrorType::External => "A dependent service is currently unavailable.",
        }
    }

    pub fn suggestions(&self) -> &'static [&'static str] {
        match self {
            ErrorType::Validation => &["Check the request parameters and try again."],
            ErrorType::Authentication => &["Sign in again to refresh your session."],
            ErrorType::Authorization => &["Contact your account administrator if you need access."],
            ErrorType::NotFound => &["Verify the resource identifier."],
            ErrorType::Conflict => &["Reload the resource and retry your change."],
            ErrorType::RateLimit => &["Wait before sending more requests."],
            ErrorType::QuotaExceeded => &[
                "Wait for your quota to reset.",
                "Upgrade your plan for higher limits.",
            ],
            ErrorType::System => &["Try again later. If the problem persists, contact support."],
            ErrorType::Network | ErrorType::External => &["Try again in a few moments."],
            ErrorType::Timeout => &["Try again, or use a smaller image."],
            ErrorType::Security => &["Request a new link and try again."],
            ErrorType::Payment => &["Check your payment method and try again."],
            ErrorType::Storage => &["Try again later."],
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered error severity; `Critical` is the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every module error so the handler can normalise it.
pub trait Classify: std::error::Error {
    fn error_type(&self) -> ErrorType;

    /// Per-call-site override of the kind's default retryability.
    fn retryable_override(&self) -> Option<bool> {
        None
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// A failure tagged with its kind at the point where it happened.
#[derive(Debug, Error)]
#[error("{kind} error: {message}")]
pub struct ServiceError {
    pub kind: ErrorType,
    pub message: String,
    pub retryable: Option<bool>,
    pub retry_after: Option<Duration>,
    pub severity: Option<Severity>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ServiceError {
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: None,
            retry_after: None,
            severity: None,
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NotFound, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorType::System, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Timeout, message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorType::External, message)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl Classify for ServiceError {
    fn error_type(&self) -> ErrorType {
        self.kind
    }

    fn retryable_override(&self) -> Option<bool> {
        self.retryable
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Request context attached to an [`ApiError`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub ip_address: Option<String>,
}

/// Structured, user-safe error response.
///
/// Every key is always present; absent values serialize as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
    /// Seconds the client should wait before retrying.
    pub retry_after: Option<u64>,
    pub suggestions: Vec<String>,
    /// Extra machine-readable fields (e.g. the failing rate-limit scope).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.error_type.http_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_is_critical_and_sorted_highest() {
        assert_eq!(ErrorType::Security.severity(), Severity::Critical);
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_retryable_defaults() {
        let retryable: Vec<_> = ErrorType::ALL
            .iter()
            .filter(|t| t.is_retryable())
            .copied()
            .collect();
        assert_eq!(
            retryable,
            vec![
                ErrorType::RateLimit,
                ErrorType::Network,
                ErrorType::Timeout,
                ErrorType::Storage,
                ErrorType::External,
            ]
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorType::QuotaExceeded.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorType::Security.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorType::Timeout.http_status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_api_error_json_keys() {
        let err = ApiError {
            error_type: ErrorType::RateLimit,
            severity: Severity::Medium,
            code: "RATE_LIMIT_EXCEEDED".into(),
            message: "slow down".into(),
            details: None,
            context: ErrorContext {
                user_id: Some("u1".into()),
                ..Default::default()
            },
            timestamp: Utc::now(),
            retryable: true,
            retry_after: Some(30),
            suggestions: vec!["wait".into()],
            metadata: HashMap::new(),
        };

        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "rate_limit");
        assert_eq!(value["severity"], "medium");
        assert_eq!(value["retry_after"], 30);
        assert_eq!(value["context"]["user_id"], "u1");
        assert!(value["details"].is_null());
        assert!(value["context"]["trace_id"].is_null());
        assert!(value["metadata"].as_object().unwrap().is_empty());
    }
}

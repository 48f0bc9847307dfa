//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! governance layer. All types derive Serde traits for deserialization
//! from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::Severity;
use crate::extensions::ExecutionMode;
use crate::quota::{PlanQuota, QuotaType};
use crate::resilience::backoff::BackoffType;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GovernanceConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,

    /// Layered rate-limit tiers.
    pub rate_limit: RateLimitConfig,

    /// Per-plan usage quotas.
    pub quota: QuotaConfig,

    /// Capability URL signing.
    pub signed_urls: SignedUrlConfig,

    /// Retry curves for downstream services.
    pub retries: RetryConfig,

    /// Error normalisation and alert threshold.
    pub errors: ErrorHandlingConfig,

    pub alerting: AlertingConfig,

    /// Hook registry limits.
    pub extensions: ExtensionConfig,

    pub observability: ObservabilityConfig,

    /// Which paths the middleware protects or charges quota for.
    pub routes: RoutesConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// A fixed-window budget: `requests` per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct LimitRule {
    pub requests: u64,
    pub window_secs: u64,
}

impl LimitRule {
    pub const fn new(requests: u64, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }
}

/// IP- and user-keyed budgets for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScopedLimits {
    pub per_ip: Option<LimitRule>,
    pub per_user: Option<LimitRule>,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Interval between eviction sweeps in seconds.
    pub cleanup_interval_secs: u64,

    /// Soft cap on tracked counters before approximate trimming kicks in.
    pub max_entries: usize,

    /// Limits applied to every request.
    pub global: ScopedLimits,

    /// Limits keyed by exact endpoint path.
    pub endpoints: HashMap<String, ScopedLimits>,

    /// Limits keyed by plan name.
    pub plans: HashMap<String, ScopedLimits>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "/v1/conversions".to_string(),
            ScopedLimits {
                per_ip: Some(LimitRule::new(30, 60)),
                per_user: Some(LimitRule::new(20, 60)),
            },
        );

        let mut plans = HashMap::new();
        plans.insert(
            "free".to_string(),
            ScopedLimits {
                per_ip: None,
                per_user: Some(LimitRule::new(60, 60)),
            },
        );
        plans.insert(
            "pro".to_string(),
            ScopedLimits {
                per_ip: None,
                per_user: Some(LimitRule::new(600, 60)),
            },
        );

        Self {
            enabled: true,
            cleanup_interval_secs: 60,
            max_entries: 100_000,
            global: ScopedLimits {
                per_ip: Some(LimitRule::new(300, 60)),
                per_user: Some(LimitRule::new(1_000, 60)),
            },
            endpoints,
            plans,
        }
    }
}

/// Quota configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Plan used for unknown plan names and new users.
    pub default_plan: String,

    pub plans: HashMap<String, PlanQuota>,

    /// Interval of the background reset sweep in seconds.
    pub reset_interval_secs: u64,

    /// Send a quota alert whenever a check is denied.
    pub alert_on_exceeded: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let mut plans = HashMap::new();
        plans.insert(
            "free".to_string(),
            PlanQuota {
                monthly: HashMap::from([(QuotaType::Conversions, 10), (QuotaType::Shares, 20)]),
                daily: HashMap::from([(QuotaType::Conversions, 5)]),
                hourly: HashMap::from([(QuotaType::Conversions, 3)]),
                concurrent_limit: 1,
                features: HashMap::from([
                    ("hd_output".to_string(), false),
                    ("batch_conversion".to_string(), false),
                ]),
                upgrade_to: Some("pro".to_string()),
            },
        );
        plans.insert(
            "pro".to_string(),
            PlanQuota {
                monthly: HashMap::from([
                    (QuotaType::Conversions, 500),
                    (QuotaType::Shares, 1_000),
                    (QuotaType::StorageMb, 10_240),
                ]),
                daily: HashMap::from([(QuotaType::Conversions, 100)]),
                hourly: HashMap::from([(QuotaType::Conversions, 30)]),
                concurrent_limit: 3,
                features: HashMap::from([
                    ("hd_output".to_string(), true),
                    ("batch_conversion".to_string(), true),
                ]),
                upgrade_to: Some("business".to_string()),
            },
        );
        plans.insert(
            "business".to_string(),
            PlanQuota {
                monthly: HashMap::from([(QuotaType::Conversions, 10_000)]),
                daily: HashMap::new(),
                hourly: HashMap::from([(QuotaType::Conversions, 1_000)]),
                concurrent_limit: 10,
                features: HashMap::from([
                    ("hd_output".to_string(), true),
                    ("batch_conversion".to_string(), true),
                    ("api_access".to_string(), true),
                ]),
                upgrade_to: None,
            },
        );

        Self {
            default_plan: "free".to_string(),
            plans,
            reset_interval_secs: 300,
            alert_on_exceeded: true,
        }
    }
}

/// Capability URL configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SignedUrlConfig {
    /// Shared HMAC secret. Must be set before signing anything.
    pub signing_key: String,

    /// Scheme and host the signed paths are joined onto.
    pub base_url: String,

    pub default_expiry_secs: u64,

    /// Upper bound on any requested lifetime.
    pub max_expiry_secs: u64,

    /// Reject URLs used from an IP other than the one they were issued for.
    pub bind_ip: bool,

    pub bind_user_agent: bool,

    pub bind_referer: bool,
}

impl Default for SignedUrlConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            base_url: "http://localhost:8080".to_string(),
            default_expiry_secs: 3_600,
            max_expiry_secs: 7 * 24 * 3_600,
            bind_ip: false,
            bind_user_agent: false,
            bind_referer: false,
        }
    }
}

/// Retry policy for one downstream service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceRetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    pub base_delay_ms: u64,

    pub max_delay_ms: u64,

    /// Growth factor for exponential backoff.
    pub multiplier: f64,

    pub backoff: BackoffType,

    /// Add up to 10% random delay.
    pub jitter: bool,

    /// Substrings marking an opaque failure as retryable.
    pub retryable_patterns: Vec<String>,

    /// Substrings that veto a retry. Checked first.
    pub non_retryable_patterns: Vec<String>,
}

impl Default for ServiceRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            backoff: BackoffType::Exponential,
            jitter: true,
            retryable_patterns: [
                "timeout",
                "timed out",
                "connection",
                "temporarily unavailable",
                "500",
                "502",
                "503",
                "504",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            non_retryable_patterns: ["invalid", "unauthorized", "forbidden", "quota"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RetryConfig {
    /// Fallback for services without their own entry.
    pub default: ServiceRetryConfig,

    /// Per-service overrides keyed by service name.
    pub services: HashMap<String, ServiceRetryConfig>,
}

impl RetryConfig {
    pub fn for_service(&self, service: &str) -> &ServiceRetryConfig {
        self.services.get(service).unwrap_or(&self.default)
    }
}

/// Error normalisation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorHandlingConfig {
    /// Include internal details in responses.
    pub show_detailed_errors: bool,

    /// Minimum severity that triggers an alert.
    pub alert_threshold: Severity,

    /// User-facing message overrides keyed by error code.
    pub message_overrides: HashMap<String, String>,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            show_detailed_errors: false,
            alert_threshold: Severity::High,
            message_overrides: HashMap::new(),
        }
    }
}

/// Alert delivery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub enabled: bool,

    /// Webhook receiving JSON alerts; alerts go to the log when unset.
    pub webhook_url: Option<String>,

    pub timeout_secs: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            timeout_secs: 5,
        }
    }
}

/// Hook registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub max_hooks: usize,

    pub max_pipelines: usize,

    /// Mode used by `execute_hooks_by_type`.
    pub default_mode: ExecutionMode,

    pub continue_on_error: bool,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            max_hooks: 100,
            max_pipelines: 20,
            default_mode: ExecutionMode::Parallel,
            continue_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// A route whose successful use is charged against a quota.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaRoute {
    pub path_prefix: String,

    /// Only this method is charged; any method when unset.
    #[serde(default)]
    pub method: Option<String>,

    pub quota_type: QuotaType,

    #[serde(default = "default_quota_amount")]
    pub amount: u64,
}

fn default_quota_amount() -> u64 {
    1
}

/// Route-level governance wiring for the middleware.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// Paths that require a valid signed URL.
    pub protected_prefixes: Vec<String>,

    pub quota_routes: Vec<QuotaRoute>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            protected_prefixes: vec!["/v1/files/".to_string()],
            quota_routes: vec![QuotaRoute {
                path_prefix: "/v1/conversions".to_string(),
                method: Some("POST".to_string()),
                quota_type: QuotaType::Conversions,
                amount: 1,
            }],
        }
    }
}

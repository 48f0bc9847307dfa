//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and references
//! between sections (default plan exists, upgrade targets exist, ...).
//! Every problem is reported, not just the first.

use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::{GovernanceConfig, LimitRule, ScopedLimits, ServiceRetryConfig};
use crate::resilience::backoff::BackoffType;

/// Minimum length of the signed-URL HMAC secret.
pub const MIN_SIGNING_KEY_LEN: usize = 32;

/// Longest signed-URL lifetime accepted in config (one year).
pub const MAX_SIGNED_URL_LIFETIME_SECS: u64 = 365 * 24 * 3_600;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GovernanceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.bind_address.trim().is_empty() {
        errors.push(ValidationError::new("server.bind_address", "must not be empty"));
    }

    validate_rate_limits(config, &mut errors);
    validate_quota(config, &mut errors);
    validate_signed_urls(config, &mut errors);

    validate_retry("retries.default", &config.retries.default, &mut errors);
    for (service, retry) in &config.retries.services {
        validate_retry(&format!("retries.services.{service}"), retry, &mut errors);
    }

    if config.extensions.max_hooks == 0 {
        errors.push(ValidationError::new("extensions.max_hooks", "must be greater than 0"));
    }
    if config.extensions.max_pipelines == 0 {
        errors.push(ValidationError::new("extensions.max_pipelines", "must be greater than 0"));
    }

    if let Some(webhook) = &config.alerting.webhook_url {
        if Url::parse(webhook).is_err() {
            errors.push(ValidationError::new("alerting.webhook_url", "is not a valid URL"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "is not a valid socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_rule(field: &str, rule: &LimitRule, errors: &mut Vec<ValidationError>) {
    if rule.requests == 0 {
        errors.push(ValidationError::new(format!("{field}.requests"), "must be greater than 0"));
    }
    if rule.window_secs == 0 {
        errors.push(ValidationError::new(
            format!("{field}.window_secs"),
            "must be greater than 0",
        ));
    }
}

fn validate_scoped(field: &str, limits: &ScopedLimits, errors: &mut Vec<ValidationError>) {
    if let Some(rule) = &limits.per_ip {
        validate_rule(&format!("{field}.per_ip"), rule, errors);
    }
    if let Some(rule) = &limits.per_user {
        validate_rule(&format!("{field}.per_user"), rule, errors);
    }
}

fn validate_rate_limits(config: &GovernanceConfig, errors: &mut Vec<ValidationError>) {
    let rate_limit = &config.rate_limit;
    if rate_limit.cleanup_interval_secs == 0 {
        errors.push(ValidationError::new(
            "rate_limit.cleanup_interval_secs",
            "must be greater than 0",
        ));
    }
    if rate_limit.max_entries == 0 {
        errors.push(ValidationError::new("rate_limit.max_entries", "must be greater than 0"));
    }

    validate_scoped("rate_limit.global", &rate_limit.global, errors);
    for (endpoint, limits) in &rate_limit.endpoints {
        validate_scoped(&format!("rate_limit.endpoints.{endpoint}"), limits, errors);
    }
    for (plan, limits) in &rate_limit.plans {
        validate_scoped(&format!("rate_limit.plans.{plan}"), limits, errors);
    }
}

fn validate_quota(config: &GovernanceConfig, errors: &mut Vec<ValidationError>) {
    let quota = &config.quota;
    if !quota.plans.contains_key(&quota.default_plan) {
        errors.push(ValidationError::new(
            "quota.default_plan",
            format!("plan '{}' is not defined in quota.plans", quota.default_plan),
        ));
    }
    if quota.reset_interval_secs == 0 {
        errors.push(ValidationError::new(
            "quota.reset_interval_secs",
            "must be greater than 0",
        ));
    }

    for (name, plan) in &quota.plans {
        if let Some(target) = &plan.upgrade_to {
            if !quota.plans.contains_key(target) {
                errors.push(ValidationError::new(
                    format!("quota.plans.{name}.upgrade_to"),
                    format!("plan '{target}' is not defined"),
                ));
            }
        }
    }

    for (i, route) in config.routes.quota_routes.iter().enumerate() {
        if route.amount == 0 {
            errors.push(ValidationError::new(
                format!("routes.quota_routes[{i}].amount"),
                "must be greater than 0",
            ));
        }
    }
}

fn validate_signed_urls(config: &GovernanceConfig, errors: &mut Vec<ValidationError>) {
    let signed = &config.signed_urls;
    if signed.signing_key.len() < MIN_SIGNING_KEY_LEN {
        errors.push(ValidationError::new(
            "signed_urls.signing_key",
            format!("must be at least {MIN_SIGNING_KEY_LEN} bytes"),
        ));
    }
    if Url::parse(&signed.base_url).is_err() {
        errors.push(ValidationError::new("signed_urls.base_url", "is not a valid URL"));
    }
    if signed.max_expiry_secs > MAX_SIGNED_URL_LIFETIME_SECS {
        errors.push(ValidationError::new(
            "signed_urls.max_expiry_secs",
            format!("must not exceed {MAX_SIGNED_URL_LIFETIME_SECS}"),
        ));
    }
    if signed.default_expiry_secs == 0 || signed.default_expiry_secs > signed.max_expiry_secs {
        errors.push(ValidationError::new(
            "signed_urls.default_expiry_secs",
            "must be between 1 and max_expiry_secs",
        ));
    }
}

fn validate_retry(field: &str, retry: &ServiceRetryConfig, errors: &mut Vec<ValidationError>) {
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(ValidationError::new(
            format!("{field}.base_delay_ms"),
            "must not exceed max_delay_ms",
        ));
    }
    if retry.backoff == BackoffType::Exponential && retry.multiplier < 1.0 {
        errors.push(ValidationError::new(
            format!("{field}.multiplier"),
            "must be at least 1.0 for exponential backoff",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> GovernanceConfig {
        let mut config = GovernanceConfig::default();
        config.signed_urls.signing_key = "k".repeat(MIN_SIGNING_KEY_LEN);
        config
    }

    #[test]
    fn test_default_config_with_key_is_valid() {
        assert_eq!(validate_config(&valid_config()), Ok(()));
    }

    #[test]
    fn test_collects_every_problem() {
        let mut config = valid_config();
        config.signed_urls.signing_key = "short".into();
        config.rate_limit.global.per_ip = Some(LimitRule::new(0, 0));
        config.retries.default.base_delay_ms = 10_000;
        config.extensions.max_hooks = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"signed_urls.signing_key"));
        assert!(fields.contains(&"rate_limit.global.per_ip.requests"));
        assert!(fields.contains(&"rate_limit.global.per_ip.window_secs"));
        assert!(fields.contains(&"retries.default.base_delay_ms"));
        assert!(fields.contains(&"extensions.max_hooks"));
    }

    #[test]
    fn test_signed_url_lifetime_ceiling() {
        let mut config = valid_config();
        config.signed_urls.max_expiry_secs = u64::MAX;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "signed_urls.max_expiry_secs");
    }

    #[test]
    fn test_dangling_upgrade_target() {
        let mut config = valid_config();
        if let Some(plan) = config.quota.plans.get_mut("business") {
            plan.upgrade_to = Some("enterprise".into());
        }

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "quota.plans.business.upgrade_to");
    }
}

//! Retry service for calls to downstream services.
//!
//! Every service name resolves to its own [`ServiceRetryConfig`] (or the
//! default). A failing call is retried up to `max_retries` times after the
//! initial attempt, sleeping per the configured backoff curve, and stops
//! early on the first non-retryable error.

use std::future::Future;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::{RetryConfig, ServiceRetryConfig};
use crate::errors::{Classify, ErrorType};
use crate::observability::metrics;
use crate::resilience::backoff::compute_delay;

/// Counters for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Invocations of the operation, including the initial one.
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    /// Calls that ended in an error.
    pub failures: u64,
    /// Failed calls that stopped because the error was not retryable.
    pub non_retryable_aborts: u64,
}

/// Decide whether a failure is worth another attempt.
///
/// An explicit override on the error wins. Otherwise a non-retryable pattern
/// vetoes, the error kind decides, and opaque `system`/`external` failures
/// fall back to the retryable patterns.
pub fn is_retryable<E: Classify + ?Sized>(error: &E, config: &ServiceRetryConfig) -> bool {
    if let Some(retryable) = error.retryable_override() {
        return retryable;
    }

    let message = error.to_string().to_lowercase();
    let matches = |patterns: &[String]| {
        patterns
            .iter()
            .any(|p| !p.is_empty() && message.contains(&p.to_lowercase()))
    };

    if matches(&config.non_retryable_patterns) {
        return false;
    }

    let kind = error.error_type();
    if kind.is_retryable() {
        return true;
    }

    matches!(kind, ErrorType::System | ErrorType::External) && matches(&config.retryable_patterns)
}

#[derive(Debug)]
pub struct RetryService {
    config: RetryConfig,
    stats: DashMap<String, RetryStats>,
}

impl RetryService {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: DashMap::new(),
        }
    }

    pub fn config_for(&self, service: &str) -> &ServiceRetryConfig {
        self.config.for_service(service)
    }

    /// Run `operation` with the service's retry policy.
    pub async fn retry<E, F, Fut>(&self, service: &str, operation: F) -> Result<(), E>
    where
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.retry_with_result(service, operation).await
    }

    /// Run `operation` with the service's retry policy and return its value.
    pub async fn retry_with_result<T, E, F, Fut>(&self, service: &str, mut operation: F) -> Result<T, E>
    where
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let config = self.config.for_service(service);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.update(service, |s| s.attempts += 1);
            metrics::record_retry_attempt(service);

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(service, attempt, "Retry succeeded");
                    }
                    self.update(service, |s| s.successes += 1);
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !is_retryable(&error, config) {
                tracing::debug!(service, attempt, error = %error, "Non-retryable error, giving up");
                self.update(service, |s| {
                    s.failures += 1;
                    s.non_retryable_aborts += 1;
                });
                return Err(error);
            }

            if attempt > config.max_retries {
                tracing::warn!(service, attempts = attempt, error = %error, "Retries exhausted");
                self.update(service, |s| s.failures += 1);
                return Err(error);
            }

            let mut delay = compute_delay(attempt, config);
            if let Some(hint) = error.retry_after() {
                delay = delay.max(hint.min(std::time::Duration::from_millis(config.max_delay_ms)));
            }

            tracing::debug!(
                service,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            self.update(service, |s| s.retries += 1);
            tokio::time::sleep(delay).await;
        }
    }

    pub fn stats(&self, service: &str) -> RetryStats {
        self.stats.get(service).map(|s| *s.value()).unwrap_or_default()
    }

    fn update(&self, service: &str, f: impl FnOnce(&mut RetryStats)) {
        f(self.stats.entry(service.to_string()).or_default().value_mut());
    }
}

//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every governance component from one [`GovernanceConfig`]
//! - Wire alerting into the error handler and quota enforcer
//! - Register the built-in hooks
//! - Start the background sweepers
//!
//! Any failure here is fatal; the binary exits before binding a listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

use crate::alerting::{AlertError, LogAlerter, SharedAlerting, WebhookAlerter};
use crate::clock::SharedClock;
use crate::config::{AlertingConfig, GovernanceConfig};
use crate::errors::ErrorHandler;
use crate::extensions::{
    AnalyticsHook, EventType, ExecutionError, ExtensionRegistry, RecommendationHook, RegistryError,
    ServiceEvent, ServiceHook,
};
use crate::gate::RequestGate;
use crate::lifecycle::Shutdown;
use crate::quota::{QuotaEnforcer, SharedQuotaStore};
use crate::resilience::RetryService;
use crate::security::rate_limit::RateLimiter;
use crate::security::signed_url::{SignedUrlError, SignedUrlService};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("signed URL service: {0}")]
    SignedUrl(#[from] SignedUrlError),

    #[error("invalid alert webhook URL: {0}")]
    WebhookUrl(#[from] url::ParseError),

    #[error("alerting: {0}")]
    Alerting(#[from] AlertError),

    #[error("hook registration: {0}")]
    Registry(#[from] RegistryError),
}

/// Event types the analytics hook counts.
const ANALYTICS_EVENTS: [EventType; 6] = [
    EventType::ConversionRequested,
    EventType::ConversionCompleted,
    EventType::ConversionFailed,
    EventType::FileShared,
    EventType::FileDownloaded,
    EventType::QuotaExceeded,
];

/// Every long-lived component of a running gateway.
#[derive(Debug, Clone)]
pub struct Services {
    pub config: Arc<GovernanceConfig>,
    pub clock: SharedClock,
    pub limiter: Arc<RateLimiter>,
    pub quota: Arc<QuotaEnforcer>,
    pub signed_urls: Arc<SignedUrlService>,
    pub retries: Arc<RetryService>,
    pub errors: Arc<ErrorHandler>,
    pub extensions: Arc<ExtensionRegistry>,
    pub analytics: Arc<AnalyticsHook>,
    pub recommendations: Arc<RecommendationHook>,
    pub gate: RequestGate,
}

impl Services {
    /// Start the rate-limit sweeper and the quota reset task.
    pub fn spawn_background_tasks(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.quota.clone().spawn_reset_task(shutdown.subscribe())];
        if self.limiter.is_enabled() {
            tasks.push(self.limiter.clone().spawn_sweeper(shutdown.subscribe()));
        }
        tasks
    }

    /// Deliver an event to its hooks in the background.
    ///
    /// Every subscribed hook runs once; only the hooks that failed are
    /// retried, one by one, under the `extensions` retry policy.
    pub fn emit(&self, event: ServiceEvent) {
        let registry = self.extensions.clone();
        let retries = self.retries.clone();
        tokio::spawn(async move {
            let event_id = event.id;
            let event_type = event.event_type;
            let report = match registry.execute_hooks_by_type(event.clone()).await {
                Ok(report) | Err(ExecutionError::HooksFailed(report)) => report,
                Err(e) => {
                    tracing::warn!(%event_id, %event_type, error = %e, "Event delivery failed");
                    return;
                }
            };

            let mut unresolved = 0;
            for failure in &report.failures {
                let result = retries
                    .retry("extensions", || registry.execute_hook(&failure.hook_id, &event))
                    .await;
                if let Err(e) = result {
                    unresolved += 1;
                    tracing::warn!(
                        %event_id,
                        %event_type,
                        hook = %failure.hook_name,
                        error = %e,
                        "Hook failed after retries"
                    );
                }
            }

            tracing::debug!(
                %event_id,
                %event_type,
                executed = report.executed,
                retried = report.failures.len(),
                unresolved,
                "Event delivered"
            );
        });
    }
}

fn build_alerting(config: &AlertingConfig) -> Result<Option<SharedAlerting>, StartupError> {
    if !config.enabled {
        return Ok(None);
    }
    let alerting: SharedAlerting = match &config.webhook_url {
        Some(raw) => {
            let url = Url::parse(raw)?;
            tracing::info!(webhook = %url, "Alerts delivered to webhook");
            Arc::new(WebhookAlerter::new(url, Duration::from_secs(config.timeout_secs))?)
        }
        None => Arc::new(LogAlerter),
    };
    Ok(Some(alerting))
}

/// Build the component graph in dependency order.
pub fn build_services(
    config: GovernanceConfig,
    clock: SharedClock,
    store: SharedQuotaStore,
) -> Result<Services, StartupError> {
    let alerting = build_alerting(&config.alerting)?;

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
    let signed_urls = Arc::new(SignedUrlService::new(config.signed_urls.clone(), clock.clone())?);
    let retries = Arc::new(RetryService::new(config.retries.clone()));

    let mut quota = QuotaEnforcer::new(config.quota.clone(), store, clock.clone());
    let mut errors = ErrorHandler::new(config.errors.clone());
    if let Some(alerting) = &alerting {
        quota = quota.with_alerting(alerting.clone());
        errors = errors.with_alerting(alerting.clone());
    }
    let quota = Arc::new(quota);
    let errors = Arc::new(errors);

    let extensions = Arc::new(ExtensionRegistry::new(config.extensions.clone()));
    let analytics = Arc::new(AnalyticsHook::new());
    for event_type in ANALYTICS_EVENTS {
        extensions.register_hook(
            ServiceHook::new("analytics", event_type, analytics.clone()).with_priority(100),
        )?;
    }

    let upgrades: HashMap<String, String> = config
        .quota
        .plans
        .iter()
        .filter_map(|(name, plan)| plan.upgrade_to.clone().map(|to| (name.clone(), to)))
        .collect();
    let recommendations = Arc::new(RecommendationHook::new(upgrades));
    for event_type in [EventType::QuotaExceeded, EventType::ConversionCompleted] {
        extensions.register_hook(ServiceHook::new(
            "recommendations",
            event_type,
            recommendations.clone(),
        ))?;
    }

    let gate = RequestGate::new(
        limiter.clone(),
        quota.clone(),
        signed_urls.clone(),
        config.routes.clone(),
        clock.clone(),
    );

    tracing::info!(
        rate_limiting = limiter.is_enabled(),
        plans = config.quota.plans.len(),
        hooks = extensions.hook_count(),
        alerting = alerting.is_some(),
        "Governance services initialised"
    );

    Ok(Services {
        config: Arc::new(config),
        clock,
        limiter,
        quota,
        signed_urls,
        retries,
        errors,
        extensions,
        analytics,
        recommendations,
        gate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::quota::InMemoryQuotaStore;

    fn config() -> GovernanceConfig {
        let mut config = GovernanceConfig::default();
        config.signed_urls.signing_key = "s".repeat(32);
        config
    }

    #[test]
    fn test_build_registers_builtin_hooks() {
        let services =
            build_services(config(), system_clock(), Arc::new(InMemoryQuotaStore::new())).unwrap();

        assert_eq!(services.extensions.hook_count(), ANALYTICS_EVENTS.len() + 2);
        assert_eq!(services.extensions.hooks_by_type(EventType::QuotaExceeded).len(), 2);
    }

    #[test]
    fn test_missing_signing_key_is_fatal() {
        let result = build_services(
            GovernanceConfig::default(),
            system_clock(),
            Arc::new(InMemoryQuotaStore::new()),
        );
        assert!(matches!(result, Err(StartupError::SignedUrl(SignedUrlError::MissingKey))));
    }

    #[test]
    fn test_hook_limit_is_fatal() {
        let mut config = config();
        config.extensions.max_hooks = 2;
        let result = build_services(config, system_clock(), Arc::new(InMemoryQuotaStore::new()));
        assert!(matches!(result, Err(StartupError::Registry(_))));
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let services =
            build_services(config(), system_clock(), Arc::new(InMemoryQuotaStore::new())).unwrap();
        let shutdown = Shutdown::new();
        let tasks = services.spawn_background_tasks(&shutdown);
        assert_eq!(tasks.len(), 2);

        shutdown.trigger();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("task should stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_analytics() {
        use crate::extensions::EventPayload;

        let services =
            build_services(config(), system_clock(), Arc::new(InMemoryQuotaStore::new())).unwrap();
        services.emit(ServiceEvent::new(
            EventType::FileDownloaded,
            "test",
            EventPayload::File {
                user_id: "u1".into(),
                file_id: "out.webp".into(),
                path: "/v1/files/out.webp".into(),
            },
        ));

        for _ in 0..100 {
            if services.analytics.event_count(EventType::FileDownloaded) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(services.analytics.user_event_count("u1"), 1);
    }

    #[tokio::test]
    async fn test_emit_retries_only_the_failed_hook() {
        use crate::extensions::{EventPayload, FnHook, HookError};
        use std::sync::atomic::{AtomicU32, Ordering};

        let services =
            build_services(config(), system_clock(), Arc::new(InMemoryQuotaStore::new())).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = FnHook::new(move |_event: &ServiceEvent| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HookError::failed("webhook receiver busy"))
            } else {
                Ok(())
            }
        });
        services
            .extensions
            .register_hook(ServiceHook::new("flaky", EventType::FileShared, Arc::new(flaky)))
            .unwrap();

        services.emit(ServiceEvent::new(
            EventType::FileShared,
            "test",
            EventPayload::File {
                user_id: "u1".into(),
                file_id: "out.webp".into(),
                path: "/v1/files/out.webp".into(),
            },
        ));

        for _ in 0..100 {
            if services.retries.stats("extensions").successes == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(services.retries.stats("extensions").successes, 1);
        assert_eq!(services.analytics.event_count(EventType::FileShared), 1);
    }
}

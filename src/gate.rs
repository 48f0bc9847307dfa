//! Framework-agnostic admission for incoming requests.
//!
//! # Data Flow
//! ```text
//! GateRequest (client ip, user?, plan?, method, path, query, headers)
//!     → RateLimiter::allow (all applicable scopes)
//!     → QuotaEnforcer::consume_quota + concurrent slot (quota routes only)
//!     → SignedUrlService::validate_signed_url (protected prefixes only)
//!     → Admission::Allowed | Admission::Denied
//! ```
//!
//! Quota charged for an admitted request is handed back through
//! [`RequestGate::complete`] when the action fails, or by a [`ChargeGuard`]
//! dropped before the action reported back.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::{QuotaRoute, RoutesConfig};
use crate::errors::{Classify, ErrorType, ServiceError};
use crate::quota::enforcer::retry_after as quota_retry_after;
use crate::quota::{QuotaEnforcer, QuotaError, QuotaTier, QuotaType};
use crate::security::rate_limit::{RateLimitDecision, RateLimiter};
use crate::security::signed_url::{SignedUrlService, ValidatedUrl};

/// What the gate needs to know about a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateRequest<'a> {
    pub client_ip: &'a str,
    pub user_id: Option<&'a str>,
    pub plan: Option<&'a str>,
    pub method: &'a str,
    pub path: &'a str,
    /// Raw query string without the leading `?`.
    pub query: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub referer: Option<&'a str>,
}

/// Quota charged for an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCharge {
    pub user_id: String,
    pub quota_type: QuotaType,
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct Admitted {
    pub rate: RateLimitDecision,
    pub charge: Option<QuotaCharge>,
    pub signed_url: Option<ValidatedUrl>,
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub error_type: ErrorType,
    /// Machine-readable reason, e.g. `global_ip_limit_exceeded` or `expired`.
    pub reason: String,
    pub retry_after: Option<Duration>,
    /// Limit of the failing rate-limit scope.
    pub limit: Option<u64>,
    /// Label of the failing rate-limit scope.
    pub scope: Option<&'static str>,
    pub upgrade_suggestion: Option<String>,
    /// Quota type and tier that ran out, for quota denials.
    pub quota: Option<(QuotaType, QuotaTier)>,
}

impl Denial {
    fn new(error_type: ErrorType, reason: impl Into<String>) -> Self {
        Self {
            error_type,
            reason: reason.into(),
            retry_after: None,
            limit: None,
            scope: None,
            upgrade_suggestion: None,
            quota: None,
        }
    }

    pub fn to_service_error(&self) -> ServiceError {
        let error = ServiceError::new(self.error_type, self.reason.clone());
        match self.retry_after {
            Some(retry_after) => error.with_retry_after(retry_after),
            None => error,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Admission {
    Allowed(Admitted),
    Denied(Denial),
}

/// A URL signed for `GET` also admits `HEAD`.
fn method_allowed(signed: &str, requested: &str) -> bool {
    signed.eq_ignore_ascii_case(requested)
        || (signed.eq_ignore_ascii_case("GET") && requested.eq_ignore_ascii_case("HEAD"))
}

/// Runs the governance checks in order and stops at the first denial.
#[derive(Debug, Clone)]
pub struct RequestGate {
    limiter: Arc<RateLimiter>,
    quota: Arc<QuotaEnforcer>,
    signed_urls: Arc<SignedUrlService>,
    routes: RoutesConfig,
    clock: SharedClock,
}

impl RequestGate {
    pub fn new(
        limiter: Arc<RateLimiter>,
        quota: Arc<QuotaEnforcer>,
        signed_urls: Arc<SignedUrlService>,
        routes: RoutesConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            limiter,
            quota,
            signed_urls,
            routes,
            clock,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn quota(&self) -> &Arc<QuotaEnforcer> {
        &self.quota
    }

    pub fn signed_urls(&self) -> &Arc<SignedUrlService> {
        &self.signed_urls
    }

    /// Quota route charged for a request, if any.
    pub fn quota_route(&self, method: &str, path: &str) -> Option<&QuotaRoute> {
        self.routes.quota_routes.iter().find(|route| {
            path.starts_with(&route.path_prefix)
                && route
                    .method
                    .as_deref()
                    .map_or(true, |m| m.eq_ignore_ascii_case(method))
        })
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.routes
            .protected_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub async fn admit(&self, request: &GateRequest<'_>) -> Result<Admission, QuotaError> {
        let rate = self
            .limiter
            .allow(request.client_ip, request.user_id, request.path, request.plan);
        if !rate.allowed {
            let mut denial = Denial::new(
                ErrorType::RateLimit,
                rate.reason.clone().unwrap_or_else(|| "rate_limit_exceeded".to_string()),
            );
            denial.retry_after = rate.retry_after;
            denial.limit = rate.limit;
            denial.scope = rate.scope;
            return Ok(Admission::Denied(denial));
        }

        let charge = match self.quota_route(request.method, request.path) {
            None => None,
            Some(route) => {
                let Some(user_id) = request.user_id else {
                    return Ok(Admission::Denied(Denial::new(
                        ErrorType::Authentication,
                        "authentication_required",
                    )));
                };
                match self.charge(user_id, route.quota_type, route.amount).await? {
                    Ok(charge) => Some(charge),
                    Err(denial) => return Ok(Admission::Denied(denial)),
                }
            }
        };

        let signed_url = if self.is_protected(request.path) {
            let uri = match request.query {
                Some(query) => format!("{}?{}", request.path, query),
                None => request.path.to_string(),
            };
            match self.signed_urls.validate_signed_url(
                &uri,
                Some(request.client_ip),
                request.user_agent,
                request.referer,
            ) {
                Ok(validated) if method_allowed(&validated.method, request.method) => Some(validated),
                Ok(validated) => {
                    tracing::info!(
                        signed = %validated.method,
                        requested = %request.method,
                        path = %request.path,
                        "Signed URL used with another method"
                    );
                    if let Some(charge) = &charge {
                        self.complete(charge, false).await;
                    }
                    return Ok(Admission::Denied(Denial::new(
                        ErrorType::Authorization,
                        "method_mismatch",
                    )));
                }
                Err(failure) => {
                    if let Some(charge) = &charge {
                        self.complete(charge, false).await;
                    }
                    return Ok(Admission::Denied(Denial::new(
                        failure.error_type(),
                        failure.as_str(),
                    )));
                }
            }
        } else {
            None
        };

        Ok(Admission::Allowed(Admitted {
            rate,
            charge,
            signed_url,
        }))
    }

    /// Consume quota and take a concurrent slot for a quota-bearing action.
    async fn charge(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        amount: u64,
    ) -> Result<Result<QuotaCharge, Denial>, QuotaError> {
        let result = self.quota.consume_quota(user_id, quota_type, amount).await?;
        if !result.allowed {
            let mut denial = Denial::new(
                ErrorType::QuotaExceeded,
                result.reason.clone().unwrap_or_else(|| "quota_exceeded".to_string()),
            );
            denial.retry_after = quota_retry_after(&result, self.clock.now());
            denial.upgrade_suggestion = result.upgrade_suggestion;
            denial.quota = result.tier.map(|tier| (quota_type, tier));
            return Ok(Err(denial));
        }

        if !self.quota.acquire_concurrent_slot(user_id).await? {
            self.quota.release_quota(user_id, quota_type, amount).await?;
            let mut denial = Denial::new(
                ErrorType::QuotaExceeded,
                format!("concurrent quota exceeded for {quota_type}"),
            );
            denial.quota = Some((quota_type, QuotaTier::Concurrent));
            return Ok(Err(denial));
        }

        Ok(Ok(QuotaCharge {
            user_id: user_id.to_string(),
            quota_type,
            amount,
        }))
    }

    /// Wrap an admitted request's charge so it is settled exactly once.
    pub fn guard(&self, charge: Option<QuotaCharge>) -> ChargeGuard {
        ChargeGuard {
            gate: self.clone(),
            charge,
        }
    }

    /// Release the concurrent slot of a finished action, and its quota if
    /// the action failed. Store errors are logged, not returned.
    pub async fn complete(&self, charge: &QuotaCharge, succeeded: bool) {
        if let Err(e) = self.quota.release_concurrent_slot(&charge.user_id).await {
            tracing::warn!(user_id = %charge.user_id, error = %e, "Failed to release concurrent slot");
        }
        if succeeded {
            return;
        }
        if let Err(e) = self
            .quota
            .release_quota(&charge.user_id, charge.quota_type, charge.amount)
            .await
        {
            tracing::warn!(user_id = %charge.user_id, error = %e, "Failed to release quota");
        } else {
            tracing::debug!(
                user_id = %charge.user_id,
                quota_type = %charge.quota_type,
                amount = charge.amount,
                "Released quota for failed action"
            );
        }
    }
}

/// Keeps an admitted request's quota charge until the action reports back.
///
/// A guard dropped without [`finish`](ChargeGuard::finish) (handler timeout,
/// client disconnect, panic) hands the charge back as a failed action on a
/// spawned task, so the concurrent slot is never lost.
#[derive(Debug)]
pub struct ChargeGuard {
    gate: RequestGate,
    charge: Option<QuotaCharge>,
}

impl ChargeGuard {
    pub fn charge(&self) -> Option<&QuotaCharge> {
        self.charge.as_ref()
    }

    /// Settle the charge with the action's outcome.
    pub async fn finish(mut self, succeeded: bool) {
        if let Some(charge) = self.charge.take() {
            self.gate.complete(&charge, succeeded).await;
        }
    }
}

impl Drop for ChargeGuard {
    fn drop(&mut self) {
        let Some(charge) = self.charge.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::info!(
                    user_id = %charge.user_id,
                    quota_type = %charge.quota_type,
                    "Action dropped before completion, releasing its charge"
                );
                let gate = self.gate.clone();
                handle.spawn(async move {
                    gate.complete(&charge, false).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %charge.user_id,
                    "No runtime to release the charge of a dropped action"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{GovernanceConfig, LimitRule, ScopedLimits};
    use crate::quota::{InMemoryQuotaStore, QuotaStore};
    use crate::security::signed_url::SignedUrlRequest;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    struct Fixture {
        gate: RequestGate,
        store: Arc<InMemoryQuotaStore>,
    }

    fn fixture() -> Fixture {
        let mut config = GovernanceConfig::default();
        config.signed_urls.signing_key = "k".repeat(32);
        config.rate_limit.global = ScopedLimits {
            per_ip: Some(LimitRule::new(5, 60)),
            per_user: None,
        };
        config.rate_limit.endpoints = HashMap::new();
        config.rate_limit.plans = HashMap::new();

        let clock: SharedClock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(InMemoryQuotaStore::new());
        let gate = RequestGate::new(
            Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone())),
            Arc::new(QuotaEnforcer::new(config.quota.clone(), store.clone(), clock.clone())),
            Arc::new(SignedUrlService::new(config.signed_urls.clone(), clock.clone()).unwrap()),
            config.routes.clone(),
            clock,
        );
        Fixture { gate, store }
    }

    fn conversion(user: Option<&'static str>) -> GateRequest<'static> {
        GateRequest {
            client_ip: "203.0.113.9",
            user_id: user,
            plan: Some("free"),
            method: "POST",
            path: "/v1/conversions",
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rate_limit_denial() {
        let Fixture { gate, .. } = fixture();
        let request = GateRequest {
            client_ip: "198.51.100.1",
            method: "GET",
            path: "/health",
            ..Default::default()
        };

        for _ in 0..5 {
            assert!(matches!(gate.admit(&request).await.unwrap(), Admission::Allowed(_)));
        }
        match gate.admit(&request).await.unwrap() {
            Admission::Denied(denial) => {
                assert_eq!(denial.error_type, ErrorType::RateLimit);
                assert_eq!(denial.reason, "global_ip_limit_exceeded");
                assert_eq!(denial.limit, Some(5));
                assert!(denial.retry_after.is_some());
            }
            Admission::Allowed(_) => panic!("sixth request should be limited"),
        }
    }

    #[tokio::test]
    async fn test_quota_route_charges_and_releases() {
        let Fixture { gate, store } = fixture();

        let charge = match gate.admit(&conversion(Some("u1"))).await.unwrap() {
            Admission::Allowed(admitted) => admitted.charge.unwrap(),
            Admission::Denied(denial) => panic!("unexpected denial: {denial:?}"),
        };
        let usage = store.get_user_quota("u1").await.unwrap().unwrap();
        assert_eq!(usage.used(QuotaTier::Monthly, QuotaType::Conversions), 1);
        assert_eq!(usage.concurrent_count, 1);

        // Free plan allows one action at a time.
        match gate.admit(&conversion(Some("u1"))).await.unwrap() {
            Admission::Denied(denial) => {
                assert_eq!(denial.error_type, ErrorType::QuotaExceeded);
                assert_eq!(denial.quota, Some((QuotaType::Conversions, QuotaTier::Concurrent)));
            }
            Admission::Allowed(_) => panic!("concurrent slot should be taken"),
        }

        gate.complete(&charge, false).await;
        let usage = store.get_user_quota("u1").await.unwrap().unwrap();
        assert_eq!(usage.used(QuotaTier::Monthly, QuotaType::Conversions), 0);
        assert_eq!(usage.concurrent_count, 0);
    }

    #[tokio::test]
    async fn test_quota_route_requires_user() {
        let Fixture { gate, .. } = fixture();
        match gate.admit(&conversion(None)).await.unwrap() {
            Admission::Denied(denial) => {
                assert_eq!(denial.error_type, ErrorType::Authentication);
                assert_eq!(denial.reason, "authentication_required");
            }
            Admission::Allowed(_) => panic!("anonymous conversions must be refused"),
        }
    }

    #[tokio::test]
    async fn test_quota_denial_carries_upgrade() {
        let Fixture { gate, store } = fixture();
        let mut usage = crate::quota::QuotaUsage::new("u1", "free", Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
        usage.monthly.insert(QuotaType::Conversions, 10);
        store.update_user_quota(&usage).await.unwrap();

        match gate.admit(&conversion(Some("u1"))).await.unwrap() {
            Admission::Denied(denial) => {
                assert_eq!(denial.reason, "monthly quota exceeded for conversions");
                assert_eq!(denial.upgrade_suggestion.as_deref(), Some("pro"));
                assert_eq!(denial.quota, Some((QuotaType::Conversions, QuotaTier::Monthly)));
                assert!(denial.retry_after.is_some());
            }
            Admission::Allowed(_) => panic!("quota should be exhausted"),
        }
    }

    #[tokio::test]
    async fn test_protected_path_needs_signature() {
        let Fixture { gate, .. } = fixture();
        let signed = gate
            .signed_urls()
            .generate_signed_url(&SignedUrlRequest::new("/v1/files/out.webp").user("u1"))
            .unwrap();
        let query = signed.url.split_once('?').map(|(_, q)| q.to_string()).unwrap();

        let request = GateRequest {
            client_ip: "203.0.113.9",
            method: "GET",
            path: "/v1/files/out.webp",
            query: Some(&query),
            ..Default::default()
        };
        match gate.admit(&request).await.unwrap() {
            Admission::Allowed(admitted) => {
                assert_eq!(admitted.signed_url.unwrap().user_id.as_deref(), Some("u1"));
            }
            Admission::Denied(denial) => panic!("unexpected denial: {denial:?}"),
        }

        let upload = GateRequest {
            method: "PUT",
            ..request
        };
        match gate.admit(&upload).await.unwrap() {
            Admission::Denied(denial) => assert_eq!(denial.reason, "method_mismatch"),
            Admission::Allowed(_) => panic!("a download URL must not admit uploads"),
        }
        let head = GateRequest {
            method: "HEAD",
            ..request
        };
        assert!(matches!(gate.admit(&head).await.unwrap(), Admission::Allowed(_)));

        let unsigned = GateRequest {
            query: None,
            ..request
        };
        match gate.admit(&unsigned).await.unwrap() {
            Admission::Denied(denial) => {
                assert_eq!(denial.error_type, ErrorType::Authorization);
                assert_eq!(denial.reason, "missing_signature");
            }
            Admission::Allowed(_) => panic!("unsigned access must be refused"),
        }
    }

    async fn concurrent_count(store: &InMemoryQuotaStore, user_id: &str) -> u32 {
        store.get_user_quota(user_id).await.unwrap().unwrap().concurrent_count
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_charge() {
        let Fixture { gate, store } = fixture();

        let charge = match gate.admit(&conversion(Some("u1"))).await.unwrap() {
            Admission::Allowed(admitted) => admitted.charge,
            Admission::Denied(denial) => panic!("unexpected denial: {denial:?}"),
        };
        assert_eq!(concurrent_count(&store, "u1").await, 1);

        drop(gate.guard(charge));

        for _ in 0..100 {
            if concurrent_count(&store, "u1").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let usage = store.get_user_quota("u1").await.unwrap().unwrap();
        assert_eq!(usage.concurrent_count, 0);
        assert_eq!(usage.used(QuotaTier::Monthly, QuotaType::Conversions), 0);
    }

    #[tokio::test]
    async fn test_finished_guard_keeps_successful_charge() {
        let Fixture { gate, store } = fixture();

        let charge = match gate.admit(&conversion(Some("u1"))).await.unwrap() {
            Admission::Allowed(admitted) => admitted.charge,
            Admission::Denied(denial) => panic!("unexpected denial: {denial:?}"),
        };
        gate.guard(charge).finish(true).await;

        let usage = store.get_user_quota("u1").await.unwrap().unwrap();
        assert_eq!(usage.concurrent_count, 0);
        assert_eq!(usage.used(QuotaTier::Monthly, QuotaType::Conversions), 1);
    }
}

//! Quota evaluation and accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::alerting::{dispatch_alert, Alert, AlertCategory, SharedAlerting};
use crate::clock::SharedClock;
use crate::config::QuotaConfig;
use crate::errors::{Classify, ErrorType, Severity};
use crate::observability::metrics;
use crate::quota::store::{SharedQuotaStore, StoreError};
use crate::quota::types::{PlanQuota, QuotaCheckResult, QuotaTier, QuotaType, QuotaUsage};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for QuotaError {
    fn error_type(&self) -> ErrorType {
        match self {
            QuotaError::Store(e) => e.error_type(),
        }
    }
}

/// Dashboard view of a user's quota.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub user_id: String,
    pub plan_name: String,
    pub usage: QuotaUsage,
    pub limits: PlanQuota,
    pub remaining: HashMap<QuotaType, u64>,
}

/// Enforces per-plan quotas against records held by a [`QuotaStore`].
///
/// Mutations are read-modify-write through the store; callers serialise
/// quota mutations per user.
///
/// [`QuotaStore`]: crate::quota::QuotaStore
#[derive(Debug)]
pub struct QuotaEnforcer {
    config: QuotaConfig,
    store: SharedQuotaStore,
    clock: SharedClock,
    alerting: Option<SharedAlerting>,
    /// Used only if the default plan is missing from config.
    unlimited: PlanQuota,
}

impl QuotaEnforcer {
    pub fn new(config: QuotaConfig, store: SharedQuotaStore, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
            alerting: None,
            unlimited: PlanQuota::default(),
        }
    }

    pub fn with_alerting(mut self, alerting: SharedAlerting) -> Self {
        self.alerting = Some(alerting);
        self
    }

    /// Limits of a plan, falling back to the default plan for unknown names.
    pub fn plan(&self, name: &str) -> &PlanQuota {
        self.config
            .plans
            .get(name)
            .or_else(|| self.config.plans.get(&self.config.default_plan))
            .unwrap_or(&self.unlimited)
    }

    /// Current record with stale tiers rolled, created on first use.
    async fn load(&self, user_id: &str) -> Result<QuotaUsage, QuotaError> {
        let now = self.clock.now();
        match self.store.get_user_quota(user_id).await? {
            Some(mut usage) => {
                if usage.refresh(now) {
                    self.store.update_user_quota(&usage).await?;
                }
                Ok(usage)
            }
            None => {
                let usage = QuotaUsage::new(user_id, self.config.default_plan.clone(), now);
                self.store.update_user_quota(&usage).await?;
                tracing::debug!(user_id, plan = %usage.plan_name, "Created quota record");
                Ok(usage)
            }
        }
    }

    /// Check whether `amount` more units of `quota_type` fit. Does not consume.
    pub async fn check_quota(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        amount: u64,
    ) -> Result<QuotaCheckResult, QuotaError> {
        let usage = self.load(user_id).await?;
        let plan = self.plan(&usage.plan_name);
        let result = evaluate(&usage, plan, quota_type, amount);

        metrics::record_quota_check(
            result.tier.map(|t| t.as_str()).unwrap_or("none"),
            result.allowed,
        );

        if !result.allowed {
            tracing::info!(
                user_id,
                plan = %usage.plan_name,
                quota_type = %quota_type,
                reason = ?result.reason,
                "Quota exceeded"
            );
            self.alert_exceeded(&usage, quota_type, &result);
        }

        Ok(result)
    }

    /// Check and, if allowed, charge the usage.
    pub async fn consume_quota(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        amount: u64,
    ) -> Result<QuotaCheckResult, QuotaError> {
        let mut result = self.check_quota(user_id, quota_type, amount).await?;
        if result.allowed {
            self.store.increment_usage(user_id, quota_type, amount).await?;
            if let Some(remaining) = result.remaining.get_mut(&quota_type) {
                *remaining = remaining.saturating_sub(amount);
            }
        }
        Ok(result)
    }

    /// Give back usage charged for an action that did not complete.
    pub async fn release_quota(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        amount: u64,
    ) -> Result<(), QuotaError> {
        self.store.decrement_usage(user_id, quota_type, amount).await?;
        Ok(())
    }

    /// False when the user's plan or the feature is unknown.
    pub async fn check_feature_access(&self, user_id: &str, feature: &str) -> Result<bool, QuotaError> {
        let plan_name = match self.store.get_user_quota(user_id).await? {
            Some(usage) => usage.plan_name,
            None => self.config.default_plan.clone(),
        };

        Ok(self
            .config
            .plans
            .get(&plan_name)
            .and_then(|plan| plan.features.get(feature))
            .copied()
            .unwrap_or(false))
    }

    /// Move a user to another plan, starting every period afresh.
    pub async fn update_user_plan(&self, user_id: &str, plan_name: &str) -> Result<(), QuotaError> {
        if !self.config.plans.contains_key(plan_name) {
            tracing::warn!(user_id, plan = plan_name, "Unknown plan, default limits will apply");
        }
        let usage = QuotaUsage::new(user_id, plan_name, self.clock.now());
        self.store.update_user_quota(&usage).await?;
        tracing::info!(user_id, plan = plan_name, "User plan updated");
        Ok(())
    }

    /// Zero a user's counters without changing plan or periods.
    pub async fn reset_user_quota(&self, user_id: &str) -> Result<(), QuotaError> {
        self.store.reset_user_quota(user_id).await?;
        Ok(())
    }

    /// Take a concurrent-action slot. Returns false when the plan's limit is reached.
    pub async fn acquire_concurrent_slot(&self, user_id: &str) -> Result<bool, QuotaError> {
        let mut usage = self.load(user_id).await?;
        if let Some(limit) = self
            .plan(&usage.plan_name)
            .limit(QuotaTier::Concurrent, QuotaType::Conversions)
        {
            if u64::from(usage.concurrent_count) >= limit {
                tracing::debug!(user_id, limit, "Concurrent slot refused");
                return Ok(false);
            }
        }
        usage.concurrent_count = usage.concurrent_count.saturating_add(1);
        self.store.update_user_quota(&usage).await?;
        Ok(true)
    }

    pub async fn release_concurrent_slot(&self, user_id: &str) -> Result<(), QuotaError> {
        let mut usage = self.load(user_id).await?;
        usage.concurrent_count = usage.concurrent_count.saturating_sub(1);
        self.store.update_user_quota(&usage).await?;
        Ok(())
    }

    pub async fn quota_status(&self, user_id: &str) -> Result<QuotaStatus, QuotaError> {
        let usage = self.load(user_id).await?;
        let limits = self.plan(&usage.plan_name).clone();
        let remaining = remaining_allowance(&usage, &limits);
        Ok(QuotaStatus {
            user_id: user_id.to_string(),
            plan_name: usage.plan_name.clone(),
            usage,
            limits,
            remaining,
        })
    }

    /// Roll stale tiers of every stored record. Returns how many changed.
    pub async fn reset_expired_quotas(&self) -> Result<usize, QuotaError> {
        let now = self.clock.now();
        let mut rolled = 0;
        for mut usage in self.store.get_all_user_quotas().await? {
            if usage.refresh(now) {
                self.store.update_user_quota(&usage).await?;
                rolled += 1;
            }
        }
        if rolled > 0 {
            tracing::debug!(rolled, "Rolled expired quota periods");
        }
        Ok(rolled)
    }

    /// Run [`reset_expired_quotas`](Self::reset_expired_quotas) on
    /// `reset_interval_secs` until shutdown.
    pub fn spawn_reset_task(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.reset_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.reset_expired_quotas().await {
                            tracing::warn!(error = %e, "Quota reset sweep failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Quota reset task received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }

    fn alert_exceeded(&self, usage: &QuotaUsage, quota_type: QuotaType, result: &QuotaCheckResult) {
        if !self.config.alert_on_exceeded {
            return;
        }
        let Some(alerting) = &self.alerting else {
            return;
        };

        let tier = result.tier.map(|t| t.as_str()).unwrap_or("unknown");
        let alert = Alert::new(
            AlertCategory::Quota,
            Severity::Medium,
            "quota_enforcer",
            "Quota exceeded",
            result.reason.clone().unwrap_or_else(|| "quota exceeded".to_string()),
        )
        .with_field("user_id", usage.user_id.clone())
        .with_field("plan", usage.plan_name.clone())
        .with_field("quota_type", quota_type.as_str())
        .with_field("tier", tier);

        dispatch_alert(alerting.clone(), alert);
    }
}

/// Smallest remaining allowance across counted tiers, per limited quota type.
fn remaining_allowance(usage: &QuotaUsage, plan: &PlanQuota) -> HashMap<QuotaType, u64> {
    QuotaType::ALL
        .iter()
        .filter_map(|&quota_type| {
            QuotaTier::COUNTED
                .iter()
                .filter_map(|&tier| {
                    plan.limit(tier, quota_type)
                        .map(|limit| limit.saturating_sub(usage.used(tier, quota_type)))
                })
                .min()
                .map(|remaining| (quota_type, remaining))
        })
        .collect()
}

/// Tiers in order monthly → daily → hourly → concurrent; the first violation wins.
fn evaluate(usage: &QuotaUsage, plan: &PlanQuota, quota_type: QuotaType, amount: u64) -> QuotaCheckResult {
    let remaining = remaining_allowance(usage, plan);

    let violated = QuotaTier::COUNTED
        .into_iter()
        .find(|&tier| {
            plan.limit(tier, quota_type)
                .is_some_and(|limit| usage.used(tier, quota_type).saturating_add(amount) > limit)
        })
        .or_else(|| {
            plan.limit(QuotaTier::Concurrent, quota_type)
                .filter(|&limit| usage.used(QuotaTier::Concurrent, quota_type) >= limit)
                .map(|_| QuotaTier::Concurrent)
        });

    match violated {
        None => QuotaCheckResult {
            allowed: true,
            reason: None,
            tier: None,
            remaining,
            reset_time: None,
            upgrade_suggestion: None,
        },
        Some(tier) => QuotaCheckResult {
            allowed: false,
            reason: Some(format!("{tier} quota exceeded for {quota_type}")),
            tier: Some(tier),
            remaining,
            reset_time: usage.reset_at(tier),
            upgrade_suggestion: plan.upgrade_to.clone(),
        },
    }
}

/// Time until a denied check's tier resets, if it resets at all.
pub fn retry_after(result: &QuotaCheckResult, now: DateTime<Utc>) -> Option<Duration> {
    result
        .reset_time
        .and_then(|reset| (reset - now).to_std().ok())
}

//! Layered fixed-window rate limiter.
//!
//! Every request is checked against up to six counters, in order:
//! global per-IP, global per-user, endpoint per-IP, endpoint per-user,
//! plan per-IP, plan per-user. All applicable counters are checked and, only
//! if every one has room, incremented inside the same critical section.
//!
//! Windows are fixed, not sliding: a counter drops to zero the instant
//! `now - window_start >= window`, so a burst can straddle two windows and
//! briefly see up to twice the limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::{LimitRule, RateLimitConfig};
use crate::observability::metrics;

/// Namespace of a counter. IP- and user-keyed counters never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimitScope {
    GlobalIp,
    GlobalUser,
    EndpointIp(String),
    EndpointUser(String),
    PlanIp(String),
    PlanUser(String),
}

impl LimitScope {
    pub fn label(&self) -> &'static str {
        match self {
            LimitScope::GlobalIp => "global_ip",
            LimitScope::GlobalUser => "global_user",
            LimitScope::EndpointIp(_) => "endpoint_ip",
            LimitScope::EndpointUser(_) => "endpoint_user",
            LimitScope::PlanIp(_) => "plan_ip",
            LimitScope::PlanUser(_) => "plan_user",
        }
    }
}

/// Composite `(scope, subject)` counter key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    pub scope: LimitScope,
    /// Client IP or user ID, depending on the scope.
    pub subject: String,
}

impl LimitKey {
    pub fn new(scope: LimitScope, subject: impl Into<String>) -> Self {
        Self {
            scope,
            subject: subject.into(),
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            LimitScope::GlobalIp => write!(f, "ip:{}", self.subject),
            LimitScope::GlobalUser => write!(f, "user:{}", self.subject),
            LimitScope::EndpointIp(e) => write!(f, "endpoint:{e}:ip:{}", self.subject),
            LimitScope::EndpointUser(e) => write!(f, "endpoint:{e}:user:{}", self.subject),
            LimitScope::PlanIp(p) => write!(f, "plan:{p}:ip:{}", self.subject),
            LimitScope::PlanUser(p) => write!(f, "plan:{p}:user:{}", self.subject),
        }
    }
}

/// One fixed-window counter.
#[derive(Debug, Clone)]
pub struct LimitEntry {
    pub count: u64,
    pub window: TimeDelta,
    pub window_start: DateTime<Utc>,
    /// Eligible for eviction after this instant.
    pub expires_at: DateTime<Utc>,
}

impl LimitEntry {
    fn new(window: TimeDelta, now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window,
            window_start: now,
            expires_at: now + window * 2,
        }
    }

    fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        now - self.window_start >= self.window
    }

    /// Count within the window containing `now`.
    pub fn current_count(&self, now: DateTime<Utc>) -> u64 {
        if self.window_elapsed(now) {
            0
        } else {
            self.count
        }
    }

    fn increment(&mut self, now: DateTime<Utc>) -> u64 {
        if self.window_elapsed(now) {
            self.count = 0;
            self.window_start = now;
            self.expires_at = now + self.window * 2;
        }
        self.count += 1;
        self.count
    }

    fn resets_in(&self, now: DateTime<Utc>) -> Duration {
        (self.window_start + self.window - now)
            .to_std()
            .unwrap_or_default()
    }
}

/// Outcome of [`RateLimiter::allow`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Machine-readable reason, e.g. `endpoint_user_limit_exceeded`.
    pub reason: Option<String>,
    /// Label of the failing scope.
    pub scope: Option<&'static str>,
    /// Limit of the failing scope, or of the tightest applied scope.
    pub limit: Option<u64>,
    /// Requests left in the tightest applied scope.
    pub remaining: Option<u64>,
    /// Time until the failing window resets.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn unrestricted() -> Self {
        Self {
            allowed: true,
            reason: None,
            scope: None,
            limit: None,
            remaining: None,
            retry_after: None,
        }
    }
}

/// Counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub trimmed: usize,
}

/// Longest window honoured; larger configured values are clamped.
const MAX_WINDOW_SECS: u64 = 366 * 24 * 3_600;

fn window_of(rule: &LimitRule) -> TimeDelta {
    TimeDelta::seconds(rule.window_secs.min(MAX_WINDOW_SECS) as i64)
}

/// Process-local layered rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<LimitKey, LimitEntry>>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Counters that apply to this request, least specific first.
    fn applicable_checks(
        &self,
        ip: &str,
        user_id: Option<&str>,
        endpoint: &str,
        plan: Option<&str>,
    ) -> Vec<(LimitKey, LimitRule)> {
        let mut checks = Vec::with_capacity(6);
        let mut push = |limits_ip: Option<LimitRule>, limits_user: Option<LimitRule>, ip_scope, user_scope| {
            if let Some(rule) = limits_ip {
                checks.push((LimitKey::new(ip_scope, ip), rule));
            }
            if let (Some(rule), Some(user)) = (limits_user, user_id) {
                checks.push((LimitKey::new(user_scope, user), rule));
            }
        };

        let global = &self.config.global;
        push(global.per_ip, global.per_user, LimitScope::GlobalIp, LimitScope::GlobalUser);

        if let Some(limits) = self.config.endpoints.get(endpoint) {
            push(
                limits.per_ip,
                limits.per_user,
                LimitScope::EndpointIp(endpoint.to_string()),
                LimitScope::EndpointUser(endpoint.to_string()),
            );
        }

        if let Some(plan) = plan {
            if let Some(limits) = self.config.plans.get(plan) {
                push(
                    limits.per_ip,
                    limits.per_user,
                    LimitScope::PlanIp(plan.to_string()),
                    LimitScope::PlanUser(plan.to_string()),
                );
            }
        }

        checks
    }

    /// Admit or deny a request.
    ///
    /// A denial names the most specific exceeded scope and leaves every
    /// counter untouched.
    pub fn allow(
        &self,
        ip: &str,
        user_id: Option<&str>,
        endpoint: &str,
        plan: Option<&str>,
    ) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::unrestricted();
        }

        let checks = self.applicable_checks(ip, user_id, endpoint, plan);
        if checks.is_empty() {
            return RateLimitDecision::unrestricted();
        }

        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let mut exceeded: Option<(&LimitKey, u64, Duration)> = None;
        for (key, rule) in &checks {
            if let Some(entry) = entries.get(key) {
                if entry.current_count(now) >= rule.requests {
                    exceeded = Some((key, rule.requests, entry.resets_in(now)));
                }
            }
        }

        if let Some((key, limit, retry_after)) = exceeded {
            let table_size = entries.len();
            drop(entries);

            let scope = key.scope.label();
            tracing::warn!(
                key = %key,
                scope,
                limit,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            metrics::record_rate_limited(scope);
            metrics::record_rate_limit_entries(table_size);

            return RateLimitDecision {
                allowed: false,
                reason: Some(format!("{scope}_limit_exceeded")),
                scope: Some(scope),
                limit: Some(limit),
                remaining: Some(0),
                retry_after: Some(retry_after),
            };
        }

        let mut tightest: Option<(u64, u64)> = None;
        for (key, rule) in checks {
            let window = window_of(&rule);
            let count = entries
                .entry(key)
                .or_insert_with(|| LimitEntry::new(window, now))
                .increment(now);
            let remaining = rule.requests.saturating_sub(count);
            if tightest.map_or(true, |(_, r)| remaining < r) {
                tightest = Some((rule.requests, remaining));
            }
        }
        let table_size = entries.len();
        drop(entries);

        metrics::record_rate_limit_entries(table_size);

        RateLimitDecision {
            allowed: true,
            reason: None,
            scope: None,
            limit: tightest.map(|(limit, _)| limit),
            remaining: tightest.map(|(_, remaining)| remaining),
            retry_after: None,
        }
    }

    /// Current count for a key, without touching it.
    pub fn usage(&self, key: &LimitKey) -> Option<u64> {
        let now = self.clock.now();
        self.entries.lock().get(key).map(|e| e.current_count(now))
    }

    /// Drop every counter for an IP or user. Returns how many were removed.
    pub fn reset_subject(&self, subject: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| key.subject != subject);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(subject, removed, "Rate limit counters reset");
        }
        removed
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Evict expired counters, then trim ~10% of the table if it is still
    /// above `max_entries`. Trimming follows map iteration order, not recency.
    pub fn sweep(&self) -> SweepStats {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        let expired = before - entries.len();

        let mut trimmed = 0;
        if entries.len() > self.config.max_entries {
            let victims: Vec<LimitKey> = entries
                .keys()
                .take((entries.len() / 10).max(1))
                .cloned()
                .collect();
            for key in &victims {
                entries.remove(key);
            }
            trimmed = victims.len();
        }

        let remaining = entries.len();
        drop(entries);

        if expired > 0 || trimmed > 0 {
            tracing::debug!(expired, trimmed, remaining, "Rate limiter sweep");
        }
        metrics::record_rate_limit_entries(remaining);

        SweepStats { expired, trimmed }
    }

    /// Run [`sweep`](Self::sweep) every `cleanup_interval_secs` until shutdown.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.cleanup_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Rate limiter sweeper received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }
}

//! Quota plans, usage records and check results.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Resource a quota is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    Conversions,
    ApiCalls,
    StorageMb,
    Downloads,
    Shares,
}

impl QuotaType {
    pub const ALL: [QuotaType; 5] = [
        QuotaType::Conversions,
        QuotaType::ApiCalls,
        QuotaType::StorageMb,
        QuotaType::Downloads,
        QuotaType::Shares,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::Conversions => "conversions",
            QuotaType::ApiCalls => "api_calls",
            QuotaType::StorageMb => "storage_mb",
            QuotaType::Downloads => "downloads",
            QuotaType::Shares => "shares",
        }
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tiers in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaTier {
    Monthly,
    Daily,
    Hourly,
    Concurrent,
}

impl QuotaTier {
    /// Tiers that count usage per quota type.
    pub const COUNTED: [QuotaTier; 3] = [QuotaTier::Monthly, QuotaTier::Daily, QuotaTier::Hourly];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaTier::Monthly => "monthly",
            QuotaTier::Daily => "daily",
            QuotaTier::Hourly => "hourly",
            QuotaTier::Concurrent => "concurrent",
        }
    }
}

impl fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits of one plan. A quota type missing from a tier is unlimited in
/// that tier; a `concurrent_limit` of 0 disables the concurrent tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanQuota {
    pub monthly: HashMap<QuotaType, u64>,
    pub daily: HashMap<QuotaType, u64>,
    pub hourly: HashMap<QuotaType, u64>,
    pub concurrent_limit: u32,
    pub features: HashMap<String, bool>,
    /// Plan suggested when a user of this plan runs out.
    pub upgrade_to: Option<String>,
}

impl PlanQuota {
    pub fn limit(&self, tier: QuotaTier, quota_type: QuotaType) -> Option<u64> {
        match tier {
            QuotaTier::Monthly => self.monthly.get(&quota_type).copied(),
            QuotaTier::Daily => self.daily.get(&quota_type).copied(),
            QuotaTier::Hourly => self.hourly.get(&quota_type).copied(),
            QuotaTier::Concurrent => {
                (self.concurrent_limit > 0).then_some(u64::from(self.concurrent_limit))
            }
        }
    }
}

/// Live usage record of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub user_id: String,
    pub plan_name: String,
    pub monthly: HashMap<QuotaType, u64>,
    pub daily: HashMap<QuotaType, u64>,
    pub hourly: HashMap<QuotaType, u64>,
    pub concurrent_count: u32,
    /// Start of the current monthly period.
    pub last_reset: DateTime<Utc>,
    /// End of the current monthly period.
    pub next_reset: DateTime<Utc>,
    pub daily_reset_at: DateTime<Utc>,
    pub hourly_reset_at: DateTime<Utc>,
}

fn one_month_after(start: DateTime<Utc>) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(1))
        .unwrap_or(start + TimeDelta::days(30))
}

impl QuotaUsage {
    /// Fresh record with all periods starting at `now`.
    pub fn new(user_id: impl Into<String>, plan_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            plan_name: plan_name.into(),
            monthly: HashMap::new(),
            daily: HashMap::new(),
            hourly: HashMap::new(),
            concurrent_count: 0,
            last_reset: now,
            next_reset: one_month_after(now),
            daily_reset_at: now + TimeDelta::days(1),
            hourly_reset_at: now + TimeDelta::hours(1),
        }
    }

    pub fn used(&self, tier: QuotaTier, quota_type: QuotaType) -> u64 {
        match tier {
            QuotaTier::Monthly => self.monthly.get(&quota_type).copied().unwrap_or(0),
            QuotaTier::Daily => self.daily.get(&quota_type).copied().unwrap_or(0),
            QuotaTier::Hourly => self.hourly.get(&quota_type).copied().unwrap_or(0),
            QuotaTier::Concurrent => u64::from(self.concurrent_count),
        }
    }

    /// When the tier's counters next reset. Concurrent slots are not a
    /// budget; leftovers are only cleared with the daily tier.
    pub fn reset_at(&self, tier: QuotaTier) -> Option<DateTime<Utc>> {
        match tier {
            QuotaTier::Monthly => Some(self.next_reset),
            QuotaTier::Daily => Some(self.daily_reset_at),
            QuotaTier::Hourly => Some(self.hourly_reset_at),
            QuotaTier::Concurrent => None,
        }
    }

    /// Add `amount` to every counted tier.
    pub fn add(&mut self, quota_type: QuotaType, amount: u64) {
        for tier in [&mut self.monthly, &mut self.daily, &mut self.hourly] {
            let used = tier.entry(quota_type).or_insert(0);
            *used = used.saturating_add(amount);
        }
    }

    /// Remove `amount` from every counted tier, never below zero.
    pub fn subtract(&mut self, quota_type: QuotaType, amount: u64) {
        for tier in [&mut self.monthly, &mut self.daily, &mut self.hourly] {
            if let Some(used) = tier.get_mut(&quota_type) {
                *used = used.saturating_sub(amount);
            }
        }
    }

    /// Zero all counters without moving the period boundaries.
    pub fn clear(&mut self) {
        self.monthly.clear();
        self.daily.clear();
        self.hourly.clear();
        self.concurrent_count = 0;
    }

    /// Roll every tier whose period ended, clearing concurrent slots with the
    /// daily tier. Returns true if anything changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if now >= self.next_reset {
            self.monthly.clear();
            self.last_reset = now;
            self.next_reset = one_month_after(now);
            changed = true;
        }
        if now >= self.daily_reset_at {
            self.daily.clear();
            // No action holds a slot for a whole day; anything left leaked.
            self.concurrent_count = 0;
            self.daily_reset_at = now + TimeDelta::days(1);
            changed = true;
        }
        if now >= self.hourly_reset_at {
            self.hourly.clear();
            self.hourly_reset_at = now + TimeDelta::hours(1);
            changed = true;
        }

        changed
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    /// e.g. "monthly quota exceeded for conversions".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<QuotaTier>,
    /// Smallest remaining allowance across tiers, per limited quota type.
    pub remaining: HashMap<QuotaType, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    /// Plan to upgrade to, when the user's plan names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_suggestion: Option<String>,
}

impl QuotaCheckResult {
    pub fn remaining_for(&self, quota_type: QuotaType) -> Option<u64> {
        self.remaining.get(&quota_type).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_monthly_period_is_a_calendar_month() {
        let start = Utc.with_ymd_and_hms(2025, 1, 31, 10, 0, 0).unwrap();
        let usage = QuotaUsage::new("u1", "free", start);

        assert_eq!(usage.next_reset, Utc.with_ymd_and_hms(2025, 2, 28, 10, 0, 0).unwrap());
        assert_eq!(usage.daily_reset_at, start + TimeDelta::days(1));
    }

    #[test]
    fn test_refresh_rolls_only_stale_tiers() {
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let mut usage = QuotaUsage::new("u1", "free", start);
        usage.add(QuotaType::Conversions, 2);

        assert!(!usage.refresh(start + TimeDelta::minutes(59)));
        assert!(usage.refresh(start + TimeDelta::minutes(61)));

        assert_eq!(usage.used(QuotaTier::Hourly, QuotaType::Conversions), 0);
        assert_eq!(usage.used(QuotaTier::Daily, QuotaType::Conversions), 2);
        assert_eq!(usage.used(QuotaTier::Monthly, QuotaType::Conversions), 2);
    }

    #[test]
    fn test_daily_rollover_clears_leaked_slots() {
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let mut usage = QuotaUsage::new("u1", "free", start);
        usage.concurrent_count = 1;

        usage.refresh(start + TimeDelta::hours(2));
        assert_eq!(usage.concurrent_count, 1);

        usage.refresh(start + TimeDelta::days(1));
        assert_eq!(usage.concurrent_count, 0);
    }

    #[test]
    fn test_subtract_saturates() {
        let mut usage = QuotaUsage::new("u1", "free", Utc::now());
        usage.add(QuotaType::Shares, 1);
        usage.subtract(QuotaType::Shares, 5);
        assert_eq!(usage.used(QuotaTier::Monthly, QuotaType::Shares), 0);
    }

    #[test]
    fn test_plan_limits() {
        let plan = PlanQuota {
            monthly: HashMap::from([(QuotaType::Conversions, 10)]),
            ..Default::default()
        };
        assert_eq!(plan.limit(QuotaTier::Monthly, QuotaType::Conversions), Some(10));
        assert_eq!(plan.limit(QuotaTier::Daily, QuotaType::Conversions), None);
        assert_eq!(plan.limit(QuotaTier::Concurrent, QuotaType::Conversions), None);
    }
}

//! Hooks shipped with the gateway.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::extensions::types::{EventPayload, EventType, HookError, HookHandler, ServiceEvent};

/// Adapts a plain closure into a [`HookHandler`].
pub struct FnHook<F> {
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&ServiceEvent) -> Result<(), HookError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(&ServiceEvent) -> Result<(), HookError> + Send + Sync,
{
    async fn handle(&self, event: &ServiceEvent) -> Result<(), HookError> {
        (self.f)(event)
    }
}

/// Counts events per type and per user.
#[derive(Debug, Default)]
pub struct AnalyticsHook {
    by_type: DashMap<EventType, u64>,
    by_user: DashMap<String, u64>,
}

impl AnalyticsHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self, event_type: EventType) -> u64 {
        self.by_type.get(&event_type).map(|c| *c).unwrap_or(0)
    }

    pub fn user_event_count(&self, user_id: &str) -> u64 {
        self.by_user.get(user_id).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<EventType, u64> {
        self.by_type.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

#[async_trait]
impl HookHandler for AnalyticsHook {
    async fn handle(&self, event: &ServiceEvent) -> Result<(), HookError> {
        *self.by_type.entry(event.event_type).or_insert(0) += 1;
        if let Some(user_id) = event.payload.user_id() {
            *self.by_user.entry(user_id.to_string()).or_insert(0) += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    PlanUpgrade,
    OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    /// Plan name or output format being recommended.
    pub target: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Conversions in one output format before it is suggested as the default.
pub const FORMAT_RECOMMENDATION_THRESHOLD: u64 = 3;

/// Derives per-user recommendations from quota and conversion events.
#[derive(Debug, Default)]
pub struct RecommendationHook {
    /// Plan name → plan to suggest when it runs out.
    upgrades: HashMap<String, String>,
    format_history: DashMap<String, HashMap<String, u64>>,
    recommendations: DashMap<String, Vec<Recommendation>>,
}

impl RecommendationHook {
    pub fn new(upgrades: HashMap<String, String>) -> Self {
        Self {
            upgrades,
            ..Default::default()
        }
    }

    pub fn recommendations_for(&self, user_id: &str) -> Vec<Recommendation> {
        self.recommendations
            .get(user_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Record unless an identical recommendation is already pending.
    fn recommend(&self, user_id: &str, kind: RecommendationKind, target: &str, message: String) {
        let mut pending = self.recommendations.entry(user_id.to_string()).or_default();
        if pending.iter().any(|r| r.kind == kind && r.target == target) {
            return;
        }
        tracing::debug!(user_id, ?kind, target, "Recommendation added");
        pending.push(Recommendation {
            kind,
            target: target.to_string(),
            message,
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl HookHandler for RecommendationHook {
    async fn handle(&self, event: &ServiceEvent) -> Result<(), HookError> {
        match &event.payload {
            EventPayload::Quota {
                user_id,
                plan,
                quota_type,
                ..
            } => {
                if let Some(target) = self.upgrades.get(plan) {
                    self.recommend(
                        user_id,
                        RecommendationKind::PlanUpgrade,
                        target,
                        format!("Upgrade to {target} for more {quota_type}"),
                    );
                }
            }
            EventPayload::Conversion {
                user_id,
                output_format,
                error: None,
                ..
            } if event.event_type == EventType::ConversionCompleted => {
                let uses = {
                    let mut history = self.format_history.entry(user_id.clone()).or_default();
                    let count = history.entry(output_format.to_lowercase()).or_insert(0);
                    *count += 1;
                    *count
                };
                if uses >= FORMAT_RECOMMENDATION_THRESHOLD {
                    let format = output_format.to_lowercase();
                    self.recommend(
                        user_id,
                        RecommendationKind::OutputFormat,
                        &format,
                        format!("Set {format} as your default output format"),
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaType;

    fn conversion(user_id: &str, format: &str) -> ServiceEvent {
        ServiceEvent::new(
            EventType::ConversionCompleted,
            "converter",
            EventPayload::Conversion {
                user_id: user_id.into(),
                conversion_id: "c".into(),
                input_format: "png".into(),
                output_format: format.into(),
                file_size_bytes: 10,
                duration_ms: None,
                error: None,
            },
        )
    }

    #[tokio::test]
    async fn test_analytics_counts() {
        let hook = AnalyticsHook::new();
        hook.handle(&conversion("u1", "webp")).await.unwrap();
        hook.handle(&conversion("u1", "avif")).await.unwrap();
        hook.handle(&conversion("u2", "webp")).await.unwrap();

        assert_eq!(hook.event_count(EventType::ConversionCompleted), 3);
        assert_eq!(hook.event_count(EventType::FileShared), 0);
        assert_eq!(hook.user_event_count("u1"), 2);
        assert_eq!(hook.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_recommendation_on_quota_event() {
        let hook = RecommendationHook::new(HashMap::from([("free".to_string(), "pro".to_string())]));
        let event = ServiceEvent::new(
            EventType::QuotaExceeded,
            "quota_enforcer",
            EventPayload::Quota {
                user_id: "u1".into(),
                plan: "free".into(),
                quota_type: QuotaType::Conversions,
                tier: "monthly".into(),
            },
        );

        hook.handle(&event).await.unwrap();
        hook.handle(&event).await.unwrap();

        let recs = hook.recommendations_for("u1");
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::PlanUpgrade);
        assert_eq!(recs[0].target, "pro");
        assert_eq!(recs[0].message, "Upgrade to pro for more conversions");
    }

    #[tokio::test]
    async fn test_format_recommendation_after_threshold() {
        let hook = RecommendationHook::default();
        for _ in 0..2 {
            hook.handle(&conversion("u1", "WEBP")).await.unwrap();
        }
        assert!(hook.recommendations_for("u1").is_empty());

        hook.handle(&conversion("u1", "webp")).await.unwrap();
        hook.handle(&conversion("u1", "webp")).await.unwrap();

        let recs = hook.recommendations_for("u1");
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].target, "webp");
    }

    #[tokio::test]
    async fn test_fn_hook() {
        let hook = FnHook::new(|event: &ServiceEvent| {
            if event.source == "bad" {
                Err(HookError::failed("rejected"))
            } else {
                Ok(())
            }
        });
        assert!(hook.handle(&conversion("u1", "png")).await.is_ok());

        let mut bad = conversion("u1", "png");
        bad.source = "bad".into();
        assert_eq!(hook.handle(&bad).await, Err(HookError::failed("rejected")));
    }
}

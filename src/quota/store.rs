//! Persistence boundary for quota usage records.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::errors::{Classify, ErrorType};
use crate::quota::types::{QuotaType, QuotaUsage};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no quota record for user '{0}'")]
    NotFound(String),

    #[error("quota store unavailable: {0}")]
    Unavailable(String),
}

impl Classify for StoreError {
    fn error_type(&self) -> ErrorType {
        match self {
            StoreError::NotFound(_) => ErrorType::NotFound,
            StoreError::Unavailable(_) => ErrorType::Storage,
        }
    }
}

/// Storage of one usage record per user.
#[async_trait]
pub trait QuotaStore: Send + Sync + Debug {
    async fn get_user_quota(&self, user_id: &str) -> Result<Option<QuotaUsage>, StoreError>;

    /// Insert or replace a record.
    async fn update_user_quota(&self, usage: &QuotaUsage) -> Result<(), StoreError>;

    /// Zero every counter of a user, keeping plan and period boundaries.
    async fn reset_user_quota(&self, user_id: &str) -> Result<(), StoreError>;

    async fn increment_usage(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        amount: u64,
    ) -> Result<(), StoreError>;

    async fn decrement_usage(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        amount: u64,
    ) -> Result<(), StoreError>;

    async fn get_all_user_quotas(&self) -> Result<Vec<QuotaUsage>, StoreError>;
}

pub type SharedQuotaStore = Arc<dyn QuotaStore>;

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    records: DashMap<String, QuotaUsage>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn modify(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut QuotaUsage),
    ) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        f(record.value_mut());
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get_user_quota(&self, user_id: &str) -> Result<Option<QuotaUsage>, StoreError> {
        Ok(self.records.get(user_id).map(|r| r.value().clone()))
    }

    async fn update_user_quota(&self, usage: &QuotaUsage) -> Result<(), StoreError> {
        self.records.insert(usage.user_id.clone(), usage.clone());
        Ok(())
    }

    async fn reset_user_quota(&self, user_id: &str) -> Result<(), StoreError> {
        self.modify(user_id, QuotaUsage::clear)
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        amount: u64,
    ) -> Result<(), StoreError> {
        self.modify(user_id, |usage| usage.add(quota_type, amount))
    }

    async fn decrement_usage(
        &self,
        user_id: &str,
        quota_type: QuotaType,
        amount: u64,
    ) -> Result<(), StoreError> {
        self.modify(user_id, |usage| usage.subtract(quota_type, amount))
    }

    async fn get_all_user_quotas(&self) -> Result<Vec<QuotaUsage>, StoreError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}

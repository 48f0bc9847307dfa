//! Per-plan usage quotas.
//!
//! # Data Flow
//! ```text
//! middleware / handler
//!     → QuotaEnforcer::consume_quota (monthly → daily → hourly → concurrent)
//!     → QuotaStore (records keyed by user)
//!     → on denial: QuotaCheckResult + optional quota alert
//! ```
//!
//! # Design Decisions
//! - Plans are immutable after construction; unknown plan names use the default plan
//! - Tiers roll lazily: stale counters are zeroed when a record is next read
//! - A background task rolls records nobody touched

pub mod enforcer;
pub mod store;
pub mod types;

pub use enforcer::{QuotaEnforcer, QuotaError, QuotaStatus};
pub use store::{InMemoryQuotaStore, QuotaStore, SharedQuotaStore, StoreError};
pub use types::{PlanQuota, QuotaCheckResult, QuotaTier, QuotaType, QuotaUsage};

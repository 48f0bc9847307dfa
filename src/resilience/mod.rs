//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a downstream service (upscaler, storage, payment provider, ...):
//!     → retries.rs (classify failure, retry with backoff until the budget is spent)
//!     → backoff.rs (delay curve per service, capped and jittered)
//! ```
//!
//! # Design Decisions
//! - Each service has its own retry curve with a global default
//! - Typed error kinds decide retryability; message patterns are a fallback
//! - Jittered backoff prevents thundering herd

pub mod backoff;
pub mod retries;

pub use backoff::{compute_delay, BackoffType};
pub use retries::{is_retryable, RetryService, RetryStats};

//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (global, endpoint and plan scopes, per IP and per user)
//!     → signed_url.rs (capability check for protected paths)
//! ```
//!
//! # Design Decisions
//! - Fail closed: a failed signature, expiry or binding check rejects
//! - Signatures are compared in constant time
//! - No trust in client input: every signed field is re-derived from the URL

pub mod rate_limit;
pub mod signed_url;

pub use rate_limit::{LimitKey, LimitScope, RateLimitDecision, RateLimiter};
pub use signed_url::{
    SignedUrl, SignedUrlError, SignedUrlRequest, SignedUrlService, ValidatedUrl, ValidationFailure,
};

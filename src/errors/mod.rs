//! Error taxonomy and normalisation.
//!
//! # Data Flow
//! ```text
//! component failure (ServiceError / module error implementing Classify)
//!     → handler.rs (severity, code, user-safe message, retryability)
//!     → ApiError (JSON body + HTTP status)
//!     → alerting (when severity >= threshold, fire-and-forget)
//! ```

pub mod handler;
pub mod taxonomy;

pub use handler::ErrorHandler;
pub use taxonomy::{ApiError, Classify, ErrorContext, ErrorType, ServiceError, Severity};

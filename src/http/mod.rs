//! HTTP layer.
//!
//! # Data Flow
//! ```text
//! TcpListener
//!     → SetRequestId → Trace → PropagateRequestId → Timeout
//!     → governance_middleware (rate limit → quota → signed URL)
//!     → handler
//!     → X-RateLimit-* headers, quota kept only on 2xx
//! ```

pub mod handlers;
pub mod middleware;
pub mod response;
pub mod server;

pub use middleware::{governance_middleware, Caller};
pub use server::HttpServer;

//! Request governance for an image-conversion SaaS.
//!
//! Rate limiting, plan quotas, signed capability URLs, retries for
//! downstream calls, a hook framework for domain events, and error
//! normalisation, served behind an Axum middleware.

pub mod alerting;
pub mod clock;
pub mod config;
pub mod errors;
pub mod extensions;
pub mod gate;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod quota;
pub mod resilience;
pub mod security;

pub use config::GovernanceConfig;
pub use gate::{Admission, GateRequest, RequestGate};
pub use http::HttpServer;
pub use lifecycle::{build_services, Services, Shutdown};

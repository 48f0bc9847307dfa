//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GovernanceConfig (validated, immutable)
//!     → sections handed to each component at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there are no global config singletons
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AlertingConfig, ErrorHandlingConfig, ExtensionConfig, GovernanceConfig, LimitRule, LogFormat,
    ObservabilityConfig, QuotaConfig, QuotaRoute, RateLimitConfig, RetryConfig, RoutesConfig,
    ScopedLimits, ServerConfig, ServiceRetryConfig, SignedUrlConfig,
};
pub use validation::{validate_config, ValidationError};

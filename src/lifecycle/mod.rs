//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     GovernanceConfig → alerting → limiter / quota / signed URLs / errors
//!         → extension registry + built-in hooks → RequestGate → Services
//!
//! Background (startup.rs):
//!     Services::spawn_background_tasks → rate-limit sweeper, quota reset task
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger → sweepers stop, server drains
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Components are built in dependency order, never lazily
//! - One broadcast channel stops every long-running task

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
pub use startup::{build_services, Services, StartupError};

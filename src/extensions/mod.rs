//! Extensibility framework.
//!
//! # Data Flow
//! ```text
//! handler / background job
//!     → ServiceEvent (closed payload per event category)
//!     → ExtensionRegistry::execute_hooks_by_type | execute_pipeline
//!     → hooks ordered by descending priority
//!     → Sequential (short-circuit unless continue_on_error)
//!       or Parallel (JoinSet: spawn all, join all, collect failures)
//! ```

pub mod builtin;
pub mod registry;
pub mod types;

pub use builtin::{AnalyticsHook, FnHook, Recommendation, RecommendationHook, RecommendationKind};
pub use registry::{
    ExecutionError, ExecutionReport, ExtensionRegistry, HookFailure, HookStats, PipelineStats,
    RegistryError,
};
pub use types::{
    EventPayload, EventType, ExecutionMode, HookError, HookHandler, PipelineConfig, ServiceEvent,
    ServiceHook, ServicePipeline,
};

//! Hook and pipeline registry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::config::ExtensionConfig;
use crate::errors::{Classify, ErrorType};
use crate::extensions::types::{
    EventType, ExecutionMode, HookError, PipelineConfig, ServiceEvent, ServiceHook, ServicePipeline,
};
use crate::observability::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("hook limit of {0} reached")]
    HookLimitReached(usize),

    #[error("pipeline limit of {0} reached")]
    PipelineLimitReached(usize),

    #[error("hook '{0}' is already registered")]
    DuplicateHook(String),

    #[error("pipeline '{0}' already exists")]
    DuplicatePipeline(String),

    #[error("hook '{0}' not found")]
    HookNotFound(String),

    #[error("pipeline '{0}' not found")]
    PipelineNotFound(String),
}

impl Classify for RegistryError {
    fn error_type(&self) -> ErrorType {
        match self {
            RegistryError::HookNotFound(_) | RegistryError::PipelineNotFound(_) => ErrorType::NotFound,
            _ => ErrorType::Conflict,
        }
    }
}

/// A hook that failed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookFailure {
    pub hook_id: String,
    pub hook_name: String,
    pub error: String,
}

/// Outcome of running a set of hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    /// Hooks whose handler ran.
    pub executed: usize,
    pub succeeded: usize,
    /// Disabled hooks that were not run.
    pub skipped: usize,
    pub failures: Vec<HookFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("pipeline '{0}' not found")]
    PipelineNotFound(String),

    #[error("{} hook(s) failed", .0.failures.len())]
    HooksFailed(ExecutionReport),
}

impl Classify for ExecutionError {
    fn error_type(&self) -> ErrorType {
        match self {
            ExecutionError::PipelineNotFound(_) => ErrorType::NotFound,
            ExecutionError::HooksFailed(_) => ErrorType::System,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HookStats {
    pub executions: u64,
    pub failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub executions: u64,
    /// Runs in which at least one hook failed.
    pub failures: u64,
}

/// Holds hooks and pipelines and dispatches events to them.
///
/// Locks are only held to snapshot hook lists; handlers run without any
/// registry lock.
#[derive(Debug)]
pub struct ExtensionRegistry {
    config: ExtensionConfig,
    hooks: RwLock<Vec<ServiceHook>>,
    pipelines: RwLock<HashMap<String, ServicePipeline>>,
    hook_stats: DashMap<String, HookStats>,
    pipeline_stats: DashMap<String, PipelineStats>,
}

impl ExtensionRegistry {
    pub fn new(config: ExtensionConfig) -> Self {
        Self {
            config,
            hooks: RwLock::new(Vec::new()),
            pipelines: RwLock::new(HashMap::new()),
            hook_stats: DashMap::new(),
            pipeline_stats: DashMap::new(),
        }
    }

    /// Execution settings for pipelines created without explicit ones.
    pub fn default_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::from(&self.config)
    }

    pub fn register_hook(&self, hook: ServiceHook) -> Result<String, RegistryError> {
        let mut hooks = self.hooks.write();
        if hooks.len() >= self.config.max_hooks {
            tracing::warn!(hook = %hook.name, max_hooks = self.config.max_hooks, "Hook limit reached");
            return Err(RegistryError::HookLimitReached(self.config.max_hooks));
        }
        if hooks.iter().any(|h| h.id == hook.id) {
            return Err(RegistryError::DuplicateHook(hook.id));
        }

        tracing::info!(
            hook_id = %hook.id,
            hook = %hook.name,
            hook_type = %hook.hook_type,
            priority = hook.priority,
            "Hook registered"
        );
        let id = hook.id.clone();
        hooks.push(hook);
        Ok(id)
    }

    pub fn unregister_hook(&self, hook_id: &str) -> Result<ServiceHook, RegistryError> {
        let mut hooks = self.hooks.write();
        let index = hooks
            .iter()
            .position(|h| h.id == hook_id)
            .ok_or_else(|| RegistryError::HookNotFound(hook_id.to_string()))?;
        self.hook_stats.remove(hook_id);
        Ok(hooks.remove(index))
    }

    pub fn set_hook_enabled(&self, hook_id: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut hooks = self.hooks.write();
        let hook = hooks
            .iter_mut()
            .find(|h| h.id == hook_id)
            .ok_or_else(|| RegistryError::HookNotFound(hook_id.to_string()))?;
        hook.enabled = enabled;
        Ok(())
    }

    /// Registered hooks for an event type, highest priority first.
    pub fn hooks_by_type(&self, event_type: EventType) -> Vec<ServiceHook> {
        let mut hooks: Vec<ServiceHook> = self
            .hooks
            .read()
            .iter()
            .filter(|h| h.hook_type == event_type)
            .cloned()
            .collect();
        sort_by_priority(&mut hooks);
        hooks
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn create_pipeline(&self, pipeline: ServicePipeline) -> Result<String, RegistryError> {
        let mut pipelines = self.pipelines.write();
        if pipelines.len() >= self.config.max_pipelines {
            return Err(RegistryError::PipelineLimitReached(self.config.max_pipelines));
        }
        if pipelines.contains_key(&pipeline.id) {
            return Err(RegistryError::DuplicatePipeline(pipeline.id));
        }

        tracing::info!(
            pipeline_id = %pipeline.id,
            pipeline = %pipeline.name,
            hooks = pipeline.hooks.len(),
            mode = ?pipeline.config.mode,
            "Pipeline created"
        );
        let id = pipeline.id.clone();
        pipelines.insert(id.clone(), pipeline);
        Ok(id)
    }

    pub fn remove_pipeline(&self, pipeline_id: &str) -> Result<ServicePipeline, RegistryError> {
        self.pipeline_stats.remove(pipeline_id);
        self.pipelines
            .write()
            .remove(pipeline_id)
            .ok_or_else(|| RegistryError::PipelineNotFound(pipeline_id.to_string()))
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn hook_stats(&self, hook_id: &str) -> Option<HookStats> {
        self.hook_stats.get(hook_id).map(|s| s.value().clone())
    }

    pub fn pipeline_stats(&self, pipeline_id: &str) -> Option<PipelineStats> {
        self.pipeline_stats.get(pipeline_id).map(|s| *s.value())
    }

    /// Run every hook of a pipeline against an event.
    pub async fn execute_pipeline(
        &self,
        pipeline_id: &str,
        event: ServiceEvent,
    ) -> Result<ExecutionReport, ExecutionError> {
        let (hooks, config) = {
            let pipelines = self.pipelines.read();
            let pipeline = pipelines
                .get(pipeline_id)
                .ok_or_else(|| ExecutionError::PipelineNotFound(pipeline_id.to_string()))?;
            (pipeline.hooks.clone(), pipeline.config)
        };

        let result = self.run(hooks, config, Arc::new(event)).await;

        let failed = match &result {
            Ok(report) => !report.failures.is_empty(),
            Err(_) => true,
        };
        let mut stats = self.pipeline_stats.entry(pipeline_id.to_string()).or_default();
        stats.executions += 1;
        if failed {
            stats.failures += 1;
        }

        result
    }

    /// Run every registered hook subscribed to the event's type.
    pub async fn execute_hooks_by_type(&self, event: ServiceEvent) -> Result<ExecutionReport, ExecutionError> {
        let hooks = self.hooks_by_type(event.event_type);
        self.run(hooks, self.default_pipeline_config(), Arc::new(event)).await
    }

    /// Run one registered hook against an event, e.g. to retry a hook that
    /// failed. A hook that was removed or disabled meanwhile is skipped.
    pub async fn execute_hook(&self, hook_id: &str, event: &ServiceEvent) -> Result<(), HookError> {
        let hook = self
            .hooks
            .read()
            .iter()
            .find(|h| h.id == hook_id && h.enabled)
            .cloned();
        let Some(hook) = hook else {
            tracing::debug!(hook_id, event_id = %event.id, "Hook no longer active, skipping");
            return Ok(());
        };

        let result = hook.handler.handle(event).await;
        self.record_stats(&hook, &result);
        result
    }

    async fn run(
        &self,
        mut hooks: Vec<ServiceHook>,
        config: PipelineConfig,
        event: Arc<ServiceEvent>,
    ) -> Result<ExecutionReport, ExecutionError> {
        sort_by_priority(&mut hooks);
        let mut report = ExecutionReport::default();
        let (enabled, disabled): (Vec<_>, Vec<_>) = hooks.into_iter().partition(|h| h.enabled);
        report.skipped = disabled.len();

        match config.mode {
            ExecutionMode::Sequential => {
                for hook in enabled {
                    let result = hook.handler.handle(&event).await;
                    report.executed += 1;
                    if !self.record(&hook, result, &mut report) && !config.continue_on_error {
                        tracing::debug!(event_id = %event.id, hook = %hook.name, "Stopping after failed hook");
                        return Err(ExecutionError::HooksFailed(report));
                    }
                }
            }
            ExecutionMode::Parallel => {
                let mut join_set = JoinSet::new();
                let mut task_hooks = HashMap::new();
                for hook in enabled {
                    let handler = hook.handler.clone();
                    let event = event.clone();
                    let handle = join_set.spawn(async move { handler.handle(&event).await });
                    task_hooks.insert(handle.id(), hook);
                }

                while let Some(joined) = join_set.join_next_with_id().await {
                    let (task_id, result) = match joined {
                        Ok((task_id, result)) => (task_id, result),
                        Err(e) => (e.id(), Err(HookError::Panicked(e.to_string()))),
                    };
                    report.executed += 1;
                    if let Some(hook) = task_hooks.get(&task_id) {
                        self.record(hook, result, &mut report);
                    }
                }
            }
        }

        if !report.failures.is_empty() && !config.continue_on_error {
            return Err(ExecutionError::HooksFailed(report));
        }
        Ok(report)
    }

    fn record_stats(&self, hook: &ServiceHook, result: &Result<(), HookError>) {
        let mut stats = self.hook_stats.entry(hook.id.clone()).or_default();
        stats.executions += 1;
        metrics::record_hook_execution(&hook.name, result.is_ok());

        if let Err(e) = result {
            tracing::warn!(hook_id = %hook.id, hook = %hook.name, error = %e, "Hook failed");
            stats.failures += 1;
            stats.last_error = Some(e.to_string());
        }
    }

    /// Update stats and the report. Returns whether the hook succeeded.
    fn record(
        &self,
        hook: &ServiceHook,
        result: Result<(), HookError>,
        report: &mut ExecutionReport,
    ) -> bool {
        self.record_stats(hook, &result);
        match result {
            Ok(()) => {
                report.succeeded += 1;
                true
            }
            Err(e) => {
                report.failures.push(HookFailure {
                    hook_id: hook.id.clone(),
                    hook_name: hook.name.clone(),
                    error: e.to_string(),
                });
                false
            }
        }
    }
}

/// Stable sort, highest priority first.
fn sort_by_priority(hooks: &mut [ServiceHook]) {
    hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
}

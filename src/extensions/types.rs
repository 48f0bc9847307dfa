//! Events, hooks and pipelines.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ExtensionConfig;
use crate::errors::{Classify, ErrorType};
use crate::quota::QuotaType;

/// Domain events hooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ConversionRequested,
    ConversionCompleted,
    ConversionFailed,
    FileShared,
    FileDownloaded,
    QuotaExceeded,
    Webhook,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ConversionRequested => "conversion_requested",
            EventType::ConversionCompleted => "conversion_completed",
            EventType::ConversionFailed => "conversion_failed",
            EventType::FileShared => "file_shared",
            EventType::FileDownloaded => "file_downloaded",
            EventType::QuotaExceeded => "quota_exceeded",
            EventType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event data, one shape per event category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Conversion {
        user_id: String,
        conversion_id: String,
        input_format: String,
        output_format: String,
        file_size_bytes: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    File {
        user_id: String,
        file_id: String,
        path: String,
    },
    Quota {
        user_id: String,
        plan: String,
        quota_type: QuotaType,
        tier: String,
    },
    /// Free-form body received from a third party.
    Webhook(Map<String, Value>),
}

impl EventPayload {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            EventPayload::Conversion { user_id, .. }
            | EventPayload::File { user_id, .. }
            | EventPayload::Quota { user_id, .. } => Some(user_id),
            EventPayload::Webhook(body) => body.get("user_id").and_then(Value::as_str),
        }
    }
}

/// An ephemeral domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Component that emitted the event.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ServiceEvent {
    pub fn new(event_type: EventType, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source: source.into(),
            timestamp: Utc::now(),
            payload,
            correlation_id: None,
            request_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),

    #[error("hook panicked: {0}")]
    Panicked(String),
}

impl HookError {
    pub fn failed(message: impl Into<String>) -> Self {
        HookError::Failed(message.into())
    }
}

impl Classify for HookError {
    /// A handler failure is treated like any other downstream failure; a
    /// panic is a bug and is not retried.
    fn error_type(&self) -> ErrorType {
        match self {
            HookError::Failed(_) => ErrorType::External,
            HookError::Panicked(_) => ErrorType::System,
        }
    }

    fn retryable_override(&self) -> Option<bool> {
        matches!(self, HookError::Panicked(_)).then_some(false)
    }
}

/// Work performed when an event reaches a hook.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: &ServiceEvent) -> Result<(), HookError>;
}

/// A registered unit of extension behaviour.
#[derive(Clone)]
pub struct ServiceHook {
    pub id: String,
    pub name: String,
    pub hook_type: EventType,
    /// Higher runs first.
    pub priority: i32,
    pub enabled: bool,
    pub handler: Arc<dyn HookHandler>,
}

impl ServiceHook {
    pub fn new(name: impl Into<String>, hook_type: EventType, handler: Arc<dyn HookHandler>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            hook_type,
            priority: 0,
            enabled: true,
            handler,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for ServiceHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHook")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("hook_type", &self.hook_type)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub mode: ExecutionMode,
    /// Keep going after a hook fails and report the run as successful.
    pub continue_on_error: bool,
}

impl From<&ExtensionConfig> for PipelineConfig {
    fn from(config: &ExtensionConfig) -> Self {
        Self {
            mode: config.default_mode,
            continue_on_error: config.continue_on_error,
        }
    }
}

/// An ordered set of hooks run together.
#[derive(Debug, Clone)]
pub struct ServicePipeline {
    pub id: String,
    pub name: String,
    pub hooks: Vec<ServiceHook>,
    pub config: PipelineConfig,
}

impl ServicePipeline {
    pub fn new(name: impl Into<String>, config: PipelineConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            hooks: Vec::new(),
            config,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_hook(mut self, hook: ServiceHook) -> Self {
        self.hooks.push(hook);
        self
    }
}

//! Tabula Plugin Runtime
//!
//! In-process plugin runtime for the Tabula spreadsheet editor:
//! - Plugin discovery from a manifest directory or a static factory table
//! - Dependency resolution (topological load order, version constraints)
//! - Lifecycle state machine with permission gating
//! - Priority event bus with synchronous and queued delivery
//! - Cooperative cancellation of partitioned work on a bounded worker pool
//! - Workflows chaining plugins sequentially, in parallel, or conditionally

pub mod config;
pub mod dependencies;
pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod permissions;
pub mod plugin;
pub mod security;
pub mod store;
pub mod system;
pub mod version;
pub mod worker;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

pub use events::{Event, EventBus, EventEmitter, SubscriptionId};
pub use lifecycle::LifecycleState;
pub use permissions::{Permission, PermissionApprover, PermissionManager};
pub use plugin::{ConfigMap, DataContext, Plugin, PluginContext, PluginSnapshot};
pub use system::{LoadSummary, PluginInfo, PluginSystem, PluginSystemBuilder};

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Failed to load plugin '{plugin}': {reason}")]
    Load { plugin: String, reason: String },

    #[error("Invalid configuration for plugin '{plugin}': {reason}")]
    Config { plugin: String, reason: String },

    #[error("Plugin '{plugin}' is missing permissions: {}", permissions::join(.missing))]
    Permission {
        plugin: String,
        missing: Vec<Permission>,
    },

    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("No version of '{dependency}' satisfies all constraints: {constraints}")]
    VersionConflict {
        dependency: String,
        constraints: String,
    },

    #[error("Invalid version or constraint: {0}")]
    InvalidVersion(String),

    #[error("Plugin '{plugin}' cannot {action} while {state}")]
    InvalidTransition {
        plugin: String,
        state: LifecycleState,
        action: &'static str,
    },

    #[error("Plugin '{plugin}' failed while processing data: {reason}")]
    Runtime { plugin: String, reason: String },

    #[error("Processing cancelled for plugin '{0}'")]
    Cancelled(String),

    #[error("Unknown permission: {0}")]
    UnknownPermission(String),

    #[error("Workflow '{workflow}': {reason}")]
    Workflow { workflow: String, reason: String },

    #[error(transparent)]
    Core(#[from] tabula_core::Error),

    #[error("Plugin IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PluginError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E500",
            Self::Load { .. } => "E501",
            Self::Config { .. } => "E502",
            Self::Permission { .. } => "E503",
            Self::CircularDependency { .. } => "E504",
            Self::VersionConflict { .. } => "E505",
            Self::InvalidVersion(_) => "E506",
            Self::InvalidTransition { .. } => "E507",
            Self::Runtime { .. } => "E508",
            Self::Cancelled(_) => "E509",
            Self::UnknownPermission(_) => "E510",
            Self::Workflow { .. } => "E511",
            Self::Core(e) => e.code(),
            Self::Io(_) | Self::Serialization(_) | Self::Other(_) => "E9999",
        }
    }

    pub(crate) fn load(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn workflow(workflow: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Workflow {
            workflow: workflow.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

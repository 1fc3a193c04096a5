//! Plugin lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PluginError, PluginResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unloaded,
    Loaded,
    Active,
    Running,
    Inactive,
    Error,
}

/// Lifecycle operations that move a plugin between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Load,
    Activate,
    Start,
    Stop,
    Deactivate,
    Unload,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Activate => "activate",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Deactivate => "deactivate",
            Self::Unload => "unload",
        }
    }
}

impl LifecycleState {
    /// Target state for `transition`, or `None` when not allowed from here.
    ///
    /// No transition leads to `Error`; the orchestrator puts a plugin there
    /// when a hook fails. `Error` only accepts `Unload`.
    pub fn next(self, transition: Transition) -> Option<LifecycleState> {
        use LifecycleState::*;
        use Transition as T;

        match (self, transition) {
            (Unloaded, T::Load) => Some(Loaded),
            (Loaded | Inactive, T::Activate) => Some(Active),
            (Active, T::Start) => Some(Running),
            (Running | Active, T::Stop) => Some(Active),
            (Active, T::Deactivate) => Some(Inactive),
            (Error | Inactive | Loaded, T::Unload) => Some(Unloaded),
            _ => None,
        }
    }

    /// Like [`next`](Self::next) but as a typed error naming the plugin
    pub fn advance(self, plugin: &str, transition: Transition) -> PluginResult<LifecycleState> {
        self.next(transition)
            .ok_or_else(|| PluginError::InvalidTransition {
                plugin: plugin.to_string(),
                state: self,
                action: transition.as_str(),
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Running => "running",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }

    /// `Active` or `Running`
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Runtime configuration with file persistence

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "TABULA_CONFIG_DIR";

/// Environment variable overriding the plugin directory
pub const PLUGIN_DIR_ENV: &str = "TABULA_PLUGIN_DIR";

/// Tabula plugin runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub plugins: PluginsConfig,
    pub security: SecurityConfig,
    pub workers: WorkersConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned for plugin manifests
    pub plugin_dir: PathBuf,
    /// Per-plugin config files; defaults to `<plugin_dir>/configs`
    pub config_dir: Option<PathBuf>,
    /// Persisted permission grants; defaults to `<plugin_dir>/permissions.json`
    pub permission_file: Option<PathBuf>,
    /// Saved workflow definitions; defaults to `<plugin_dir>/workflows`
    pub workflow_dir: Option<PathBuf>,
    /// Encrypt permission, config and workflow files at rest
    pub encrypt_at_rest: bool,
    /// Key file for at-rest encryption; defaults to `<config_dir>/config.key`
    pub key_file: Option<PathBuf>,
    pub max_manifest_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// External dependency names plugins may declare
    pub dependency_whitelist: Vec<String>,
    /// Reject manifests that carry no signature
    pub require_signatures: bool,
    /// Base64 ed25519 public key used to verify manifest signatures
    pub trusted_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_workers: usize,
    /// How long cancellation waits for in-flight work before resetting the pool
    pub cancel_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Soft bound for the queued delivery mode; exceeding it logs a warning
    pub queue_capacity: usize,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        let plugin_dir = if let Ok(path) = env::var(PLUGIN_DIR_ENV) {
            PathBuf::from(path)
        } else {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tabula")
                .join("plugins")
        };

        Self {
            plugin_dir,
            config_dir: None,
            permission_file: None,
            workflow_dir: None,
            encrypt_at_rest: false,
            key_file: None,
            max_manifest_bytes: 64 * 1024,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            cancel_grace_ms: 2_000,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
        }
    }
}

impl PluginsConfig {
    /// Config directory after applying defaults
    pub fn resolved_config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join("configs"))
    }

    /// Permission file after applying defaults
    pub fn resolved_permission_file(&self) -> PathBuf {
        self.permission_file
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join("permissions.json"))
    }

    /// Workflow directory after applying defaults
    pub fn resolved_workflow_dir(&self) -> PathBuf {
        self.workflow_dir
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join("workflows"))
    }

    /// Key file after applying defaults
    pub fn resolved_key_file(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.resolved_config_dir().join("config.key"))
    }
}

impl RuntimeConfig {
    /// Create a configuration rooted at an explicit plugin directory
    pub fn with_plugin_dir(plugin_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.plugins.plugin_dir = plugin_dir.into();
        config
    }

    /// Get the config directory path
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?
                .join("tabula")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("runtime.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit file, or defaults if absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No runtime config file, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to an explicit file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        debug!(path = %path.display(), "Runtime config saved");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers.max_workers == 0 {
            return Err(Error::Config(
                "workers.max_workers must be greater than zero".to_string(),
            ));
        }
        if self.workers.cancel_grace_ms == 0 {
            return Err(Error::Config(
                "workers.cancel_grace_ms must be greater than zero".to_string(),
            ));
        }
        if self.plugins.max_manifest_bytes == 0 {
            return Err(Error::Config(
                "plugins.max_manifest_bytes must be greater than zero".to_string(),
            ));
        }
        if let Some(key) = &self.security.trusted_key {
            use base64::{Engine, engine::general_purpose::STANDARD};
            let bytes = STANDARD
                .decode(key)
                .map_err(|e| Error::Config(format!("security.trusted_key is not base64: {e}")))?;
            if bytes.len() != 32 {
                return Err(Error::Config(format!(
                    "security.trusted_key must decode to 32 bytes, got {}",
                    bytes.len()
                )));
            }
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "plugins.plugin_dir" => self.plugins.plugin_dir.display().to_string(),
            "plugins.config_dir" => self.plugins.resolved_config_dir().display().to_string(),
            "plugins.permission_file" => {
                self.plugins.resolved_permission_file().display().to_string()
            }
            "plugins.workflow_dir" => self.plugins.resolved_workflow_dir().display().to_string(),
            "plugins.encrypt_at_rest" => self.plugins.encrypt_at_rest.to_string(),
            "plugins.max_manifest_bytes" => self.plugins.max_manifest_bytes.to_string(),
            "security.dependency_whitelist" => self.security.dependency_whitelist.join(", "),
            "security.require_signatures" => self.security.require_signatures.to_string(),
            "security.trusted_key" => self
                .security
                .trusted_key
                .clone()
                .unwrap_or_else(|| "(not set)".to_string()),
            "workers.max_workers" => self.workers.max_workers.to_string(),
            "workers.cancel_grace_ms" => self.workers.cancel_grace_ms.to_string(),
            "events.queue_capacity" => self.events.queue_capacity.to_string(),
            _ => return Err(Error::UnknownConfigKey(key.to_string())),
        };
        Ok(value)
    }

    /// Set a configuration value by key; the config is left untouched on error
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut candidate = self.clone();
        candidate.apply(key, value)?;
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "plugins.plugin_dir" => self.plugins.plugin_dir = PathBuf::from(value),
            "plugins.config_dir" => self.plugins.config_dir = Some(PathBuf::from(value)),
            "plugins.permission_file" => self.plugins.permission_file = Some(PathBuf::from(value)),
            "plugins.workflow_dir" => self.plugins.workflow_dir = Some(PathBuf::from(value)),
            "plugins.encrypt_at_rest" => self.plugins.encrypt_at_rest = parse_value(key, value)?,
            "plugins.max_manifest_bytes" => {
                self.plugins.max_manifest_bytes = parse_value(key, value)?
            }
            "security.dependency_whitelist" => {
                self.security.dependency_whitelist = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "security.require_signatures" => {
                self.security.require_signatures = parse_value(key, value)?
            }
            "security.trusted_key" => {
                self.security.trusted_key = Some(value.trim().to_string()).filter(|v| !v.is_empty())
            }
            "workers.max_workers" => self.workers.max_workers = parse_value(key, value)?,
            "workers.cancel_grace_ms" => self.workers.cancel_grace_ms = parse_value(key, value)?,
            "events.queue_capacity" => self.events.queue_capacity = parse_value(key, value)?,
            _ => return Err(Error::UnknownConfigKey(key.to_string())),
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        const KEYS: &[&str] = &[
            "plugins.plugin_dir",
            "plugins.config_dir",
            "plugins.permission_file",
            "plugins.workflow_dir",
            "plugins.encrypt_at_rest",
            "plugins.max_manifest_bytes",
            "security.dependency_whitelist",
            "security.require_signatures",
            "security.trusted_key",
            "workers.max_workers",
            "workers.cancel_grace_ms",
            "events.queue_capacity",
        ];

        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("Invalid value for {key}: {value} ({e})")))
}

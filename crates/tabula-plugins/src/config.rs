//! Plugin config schemas and the per-plugin config store

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tabula_core::security::Encryption;
use tracing::{debug, info};

use crate::loader::validate_plugin_id;
use crate::plugin::ConfigMap;
use crate::{PluginError, PluginResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Permitted values; anything else is rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSchema {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            default: None,
            allowed: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn allowed(mut self, values: Vec<Value>) -> Self {
        self.allowed = Some(values);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Declared shape of a plugin's config; keys not in the schema pass through
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    pub fields: BTreeMap<String, FieldSchema>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, schema: FieldSchema) -> Self {
        self.fields.insert(name.into(), schema);
        self
    }

    /// First violation found, in field-name order
    pub fn validate(&self, config: &ConfigMap) -> Result<(), String> {
        for (key, field) in &self.fields {
            let Some(value) = config.get(key) else {
                if field.required {
                    return Err(format!("missing required field '{key}'"));
                }
                continue;
            };

            if !field.field_type.accepts(value) {
                return Err(format!(
                    "field '{key}' must be of type {:?}, got {value}",
                    field.field_type
                ));
            }

            if field
                .allowed
                .as_ref()
                .is_some_and(|allowed| !allowed.contains(value))
            {
                return Err(format!("field '{key}' has a value outside the allowed set: {value}"));
            }
        }
        Ok(())
    }

    /// `config` with defaults filled in for absent fields
    pub fn with_defaults(&self, config: &ConfigMap) -> ConfigMap {
        let mut effective = config.clone();
        for (key, field) in &self.fields {
            if let Some(default) = &field.default {
                effective
                    .entry(key.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        effective
    }
}

/// One file per plugin under `dir`, loaded lazily and cached
pub struct PluginConfigStore {
    dir: PathBuf,
    codec: Arc<dyn Encryption>,
    cache: RwLock<HashMap<String, ConfigMap>>,
}

impl PluginConfigStore {
    pub fn new(dir: impl Into<PathBuf>, codec: Arc<dyn Encryption>) -> Self {
        Self {
            dir: dir.into(),
            codec,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<plugin>.config.<ext>` where ext follows the codec
    pub fn config_path(&self, plugin: &str) -> PluginResult<PathBuf> {
        validate_plugin_id(plugin)?;
        Ok(self
            .dir
            .join(format!("{plugin}.config.{}", self.codec.extension())))
    }

    /// Stored config, or an empty map if none has been saved
    pub fn get_config(&self, plugin: &str) -> PluginResult<ConfigMap> {
        let path = self.config_path(plugin)?;
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin)
        {
            return Ok(cached.clone());
        }

        let config = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                ConfigMap::new()
            } else {
                match self.codec.decrypt(&bytes)? {
                    Value::Object(map) => map,
                    other => {
                        return Err(PluginError::config(
                            plugin,
                            format!("stored config is not an object: {other}"),
                        ));
                    }
                }
            }
        } else {
            ConfigMap::new()
        };

        debug!(plugin = %plugin, keys = config.len(), "Loaded plugin config");
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.to_string(), config.clone());
        Ok(config)
    }

    /// Replace the stored config
    pub fn save_config(&self, plugin: &str, config: ConfigMap) -> PluginResult<()> {
        let path = self.config_path(plugin)?;
        fs::create_dir_all(&self.dir)?;
        let bytes = self.codec.encrypt(&Value::Object(config.clone()))?;
        fs::write(path, bytes)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.to_string(), config);
        info!(plugin = %plugin, "Plugin config saved");
        Ok(())
    }

    /// Merge `updates` over the stored config and save; returns the result
    pub fn update_config(&self, plugin: &str, updates: ConfigMap) -> PluginResult<ConfigMap> {
        let mut config = self.get_config(plugin)?;
        config.extend(updates);
        self.save_config(plugin, config.clone())?;
        Ok(config)
    }

    /// Delete the stored config file and cache entry
    pub fn remove_config(&self, plugin: &str) -> PluginResult<bool> {
        let path = self.config_path(plugin)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin);
        if path.exists() {
            fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }
}

//! Permission model and persisted grant store

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tabula_core::security::Encryption;
use tracing::{debug, info, warn};

use crate::{PluginError, PluginResult};

/// A named right a plugin must hold before an action class is allowed
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    #[serde(alias = "file_read")]
    FileRead,
    #[serde(alias = "file_write")]
    FileWrite,
    #[serde(alias = "data_read")]
    DataRead,
    #[serde(alias = "data_write")]
    DataWrite,
    #[serde(alias = "ui_modify")]
    UiModify,
    #[serde(alias = "network")]
    Network,
    #[serde(alias = "system_exec")]
    SystemExec,
}

impl Permission {
    pub const ALL: [Permission; 7] = [
        Permission::FileRead,
        Permission::FileWrite,
        Permission::DataRead,
        Permission::DataWrite,
        Permission::UiModify,
        Permission::Network,
        Permission::SystemExec,
    ];

    /// Persisted symbol name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileRead => "FILE_READ",
            Self::FileWrite => "FILE_WRITE",
            Self::DataRead => "DATA_READ",
            Self::DataWrite => "DATA_WRITE",
            Self::UiModify => "UI_MODIFY",
            Self::Network => "NETWORK",
            Self::SystemExec => "SYSTEM_EXEC",
        }
    }

    /// Human-readable description shown in approval prompts
    pub fn description(&self) -> &'static str {
        match self {
            Self::FileRead => "Read files",
            Self::FileWrite => "Write files",
            Self::DataRead => "Read spreadsheet data",
            Self::DataWrite => "Modify spreadsheet data",
            Self::UiModify => "Modify the user interface",
            Self::Network => "Access the network",
            Self::SystemExec => "Execute system commands",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == upper)
            .ok_or_else(|| PluginError::UnknownPermission(s.to_string()))
    }
}

pub(crate) fn join<'a>(permissions: impl IntoIterator<Item = &'a Permission>) -> String {
    permissions
        .into_iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A pending request shown to the approval collaborator
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub plugin: String,
    pub permissions: Vec<Permission>,
}

impl PermissionRequest {
    /// Prompt text listing every requested permission with its description
    pub fn message(&self) -> String {
        let mut message = format!("Plugin '{}' requests the following permissions:\n", self.plugin);
        for permission in &self.permissions {
            message.push_str(&format!("- {} ({})\n", permission.description(), permission));
        }
        message.push_str("\nGranted permissions are saved permanently.");
        message
    }
}

/// Interactive approval, usually a dialog in the host UI
#[async_trait]
pub trait PermissionApprover: Send + Sync {
    async fn approve(&self, request: &PermissionRequest) -> bool;
}

/// Denies every request; the default for headless hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

#[async_trait]
impl PermissionApprover for DenyAll {
    async fn approve(&self, request: &PermissionRequest) -> bool {
        debug!(plugin = %request.plugin, "Permission request denied (no approver)");
        false
    }
}

/// Approves every request
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl PermissionApprover for AllowAll {
    async fn approve(&self, _request: &PermissionRequest) -> bool {
        true
    }
}

/// Persisted mapping `plugin -> set(permission)`.
///
/// Every grant or revoke rewrites the whole file. Concurrent writers from
/// separate processes are last-writer-wins.
pub struct PermissionManager {
    path: PathBuf,
    codec: Arc<dyn Encryption>,
    grants: RwLock<HashMap<String, BTreeSet<Permission>>>,
}

impl PermissionManager {
    /// Open the store at `path`, creating an empty one if it does not exist
    pub fn open(path: impl Into<PathBuf>, codec: Arc<dyn Encryption>) -> PluginResult<Self> {
        let path = path.into();
        let manager = Self {
            grants: RwLock::new(HashMap::new()),
            codec,
            path,
        };

        if manager.path.exists() {
            let loaded = manager.read_file()?;
            info!(path = %manager.path.display(), plugins = loaded.len(), "Loaded permission grants");
            *manager.grants.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        } else {
            manager.persist()?;
        }

        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> PluginResult<HashMap<String, BTreeSet<Permission>>> {
        let bytes = fs::read(&self.path)?;
        let value = self.codec.decrypt(&bytes)?;
        let raw: HashMap<String, Vec<String>> = serde_json::from_value(value)?;

        let mut grants = HashMap::with_capacity(raw.len());
        for (plugin, names) in raw {
            let mut set = BTreeSet::new();
            for name in names {
                match name.parse::<Permission>() {
                    Ok(permission) => {
                        set.insert(permission);
                    }
                    Err(_) => warn!(plugin = %plugin, permission = %name, "Skipping unknown persisted permission"),
                }
            }
            grants.insert(plugin, set);
        }
        Ok(grants)
    }

    fn persist(&self) -> PluginResult<()> {
        let snapshot: HashMap<String, Vec<Permission>> = self
            .grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(plugin, set)| (plugin.clone(), set.iter().copied().collect()))
            .collect();

        let bytes = self.codec.encrypt(&serde_json::to_value(snapshot)?)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Permission grants persisted");
        Ok(())
    }

    /// Permissions currently granted to `plugin`
    pub fn granted(&self, plugin: &str) -> BTreeSet<Permission> {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_permission(&self, plugin: &str, permission: Permission) -> bool {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin)
            .is_some_and(|set| set.contains(&permission))
    }

    /// `required - granted(plugin)`
    pub fn missing(&self, plugin: &str, required: &BTreeSet<Permission>) -> BTreeSet<Permission> {
        let granted = self.granted(plugin);
        required.difference(&granted).copied().collect()
    }

    /// Grant a permission and persist; returns whether it was newly added
    pub fn grant(&self, plugin: &str, permission: Permission) -> PluginResult<bool> {
        let added = self
            .grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(plugin.to_string())
            .or_default()
            .insert(permission);
        self.persist()?;
        if added {
            info!(plugin = %plugin, permission = %permission, "Permission granted");
        }
        Ok(added)
    }

    /// Revoke a permission and persist; returns whether it was present
    pub fn revoke(&self, plugin: &str, permission: Permission) -> PluginResult<bool> {
        let removed = self
            .grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(plugin)
            .is_some_and(|set| set.remove(&permission));
        self.persist()?;
        if removed {
            info!(plugin = %plugin, permission = %permission, "Permission revoked");
        }
        Ok(removed)
    }

    /// Resolve a single permission for a plugin.
    ///
    /// Already granted returns `true` without prompting. A permission the
    /// plugin does not declare (`declared == false`) is refused outright.
    /// Otherwise the approver decides and an approval is persisted.
    pub async fn request(
        &self,
        plugin: &str,
        permission: Permission,
        declared: bool,
        approver: &dyn PermissionApprover,
    ) -> PluginResult<bool> {
        if self.has_permission(plugin, permission) {
            return Ok(true);
        }
        if !declared {
            warn!(plugin = %plugin, permission = %permission, "Refusing undeclared permission");
            return Ok(false);
        }

        let request = PermissionRequest {
            plugin: plugin.to_string(),
            permissions: vec![permission],
        };
        if !approver.approve(&request).await {
            info!(plugin = %plugin, permission = %permission, "Permission request denied");
            return Ok(false);
        }

        self.grant(plugin, permission)?;
        Ok(true)
    }
}

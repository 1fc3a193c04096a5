//! Plugin loading and discovery
//!
//! A [`PluginSource`] lists plugin ids and turns a manifest into an instance.
//! Instances come from an explicit [`FactoryTable`] keyed by the manifest's
//! `entry`, never from runtime introspection.

use chrono::{DateTime, Utc};
use semver::Version;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::plugin::Plugin;
use crate::security::DependencySecurity;
use crate::version::{DependencySpec, parse_version};
use crate::{PluginError, PluginResult};

/// Reject identifiers that could escape a per-plugin directory or file
pub(crate) fn validate_plugin_id(id: &str) -> PluginResult<()> {
    if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
        return Err(PluginError::load(id, "invalid plugin identifier"));
    }
    Ok(())
}

/// Operations a manifest must export
pub const REQUIRED_EXPORTS: &[&str] = &[
    "get_name",
    "get_version",
    "get_description",
    "get_config_schema",
    "validate_parameters",
    "process_data",
    "get_required_permissions",
    "get_optional_permissions",
    "get_dependencies",
    "initialize",
    "activate",
    "deactivate",
    "cleanup",
    "start",
    "stop",
    "save_state",
    "restore_state",
];

/// Manifest file name inside each plugin directory
pub const MANIFEST_FILE: &str = "plugin.json";

/// Plugin manifest (`<plugin_dir>/<id>/plugin.json`)
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Key into the factory table
    pub entry: String,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Base64 ed25519 signature over the manifest with this field cleared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl PluginManifest {
    /// Manifest for an in-process plugin: every export present, no signature
    pub fn for_plugin(plugin: &dyn Plugin) -> Self {
        Self {
            id: plugin.name().to_string(),
            name: plugin.name().to_string(),
            version: plugin.version().to_string(),
            description: plugin.description().to_string(),
            entry: plugin.name().to_string(),
            exports: REQUIRED_EXPORTS.iter().map(|s| s.to_string()).collect(),
            dependencies: plugin.dependencies(),
            signature: None,
        }
    }

    /// Bytes covered by the signature
    pub fn signing_payload(&self) -> PluginResult<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Required operations this manifest does not export
    pub fn missing_exports(&self) -> Vec<&'static str> {
        let exported: HashSet<&str> = self.exports.iter().map(String::as_str).collect();
        REQUIRED_EXPORTS
            .iter()
            .copied()
            .filter(|op| !exported.contains(op))
            .collect()
    }

    fn validate(&self) -> PluginResult<()> {
        if self.id.trim().is_empty()
            || self.name.trim().is_empty()
            || self.version.trim().is_empty()
            || self.entry.trim().is_empty()
        {
            return Err(PluginError::load(
                &self.id,
                "manifest fields id, name, version and entry cannot be empty",
            ));
        }

        if let Some(op) = self.missing_exports().first() {
            return Err(PluginError::load(
                &self.id,
                format!("missing required operation '{op}'"),
            ));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep) {
                return Err(PluginError::load(
                    &self.id,
                    format!("duplicate dependency '{dep}'"),
                ));
            }
        }

        Ok(())
    }
}

/// Constructor for a plugin instance
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Explicit mapping from manifest `entry` to constructor
#[derive(Clone, Default)]
pub struct FactoryTable {
    factories: HashMap<String, PluginFactory>,
}

impl FactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(entry.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, entry: &str) -> Option<&PluginFactory> {
        self.factories.get(entry)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Where plugins are discovered and constructed
pub trait PluginSource: Send + Sync {
    /// Identifiers of every discoverable plugin
    fn scan(&self) -> PluginResult<Vec<String>>;

    fn manifest(&self, id: &str) -> PluginResult<PluginManifest>;

    fn instantiate(&self, manifest: &PluginManifest) -> PluginResult<Arc<dyn Plugin>>;
}

/// Manifests on disk, one directory per plugin
pub struct DirectorySource {
    root: PathBuf,
    max_manifest_bytes: u64,
    factories: FactoryTable,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, factories: FactoryTable) -> Self {
        Self {
            root: root.into(),
            max_manifest_bytes: 64 * 1024,
            factories,
        }
    }

    pub fn with_max_manifest_bytes(mut self, max: u64) -> Self {
        self.max_manifest_bytes = max;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn canonical_root(&self) -> PluginResult<PathBuf> {
        fs::create_dir_all(&self.root)?;
        Ok(self.root.canonicalize()?)
    }

    /// Resolve `<root>/<id>/plugin.json`, refusing symlinks and escapes from the root
    fn resolve_manifest_path(&self, id: &str) -> PluginResult<PathBuf> {
        validate_plugin_id(id)?;

        let base = self.canonical_root()?;
        let dir = self.root.join(id);
        let path = dir.join(MANIFEST_FILE);

        for candidate in [&dir, &path] {
            let metadata = fs::symlink_metadata(candidate).map_err(|e| {
                PluginError::load(id, format!("{}: {e}", candidate.display()))
            })?;
            if metadata.file_type().is_symlink() {
                return Err(PluginError::load(
                    id,
                    "plugin paths cannot point to symlinks",
                ));
            }
        }

        let canonical = path.canonicalize()?;
        if !canonical.starts_with(&base) {
            return Err(PluginError::load(
                id,
                format!("manifest {canonical:?} must reside under {base:?}"),
            ));
        }
        if !fs::metadata(&canonical)?.is_file() {
            return Err(PluginError::load(id, "manifest must be a regular file"));
        }
        Ok(canonical)
    }
}

impl PluginSource for DirectorySource {
    fn scan(&self) -> PluginResult<Vec<String>> {
        if !self.root.exists() {
            warn!(dir = %self.root.display(), "Plugin directory not found");
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if !file_type.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if id.starts_with(['.', '_']) {
                continue;
            }
            if entry.path().join(MANIFEST_FILE).is_file() {
                ids.push(id);
            }
        }
        ids.sort();
        debug!(dir = %self.root.display(), count = ids.len(), "Scanned plugin directory");
        Ok(ids)
    }

    fn manifest(&self, id: &str) -> PluginResult<PluginManifest> {
        let path = self.resolve_manifest_path(id)?;

        let size = fs::metadata(&path)?.len();
        if size > self.max_manifest_bytes {
            return Err(PluginError::load(
                id,
                format!(
                    "manifest too large: {size} bytes (limit {})",
                    self.max_manifest_bytes
                ),
            ));
        }

        let data = fs::read_to_string(&path)?;
        let manifest: PluginManifest = serde_json::from_str(&data)
            .map_err(|e| PluginError::load(id, format!("invalid manifest JSON: {e}")))?;

        if manifest.id != id {
            return Err(PluginError::load(
                id,
                format!("manifest id '{}' does not match its directory", manifest.id),
            ));
        }
        Ok(manifest)
    }

    fn instantiate(&self, manifest: &PluginManifest) -> PluginResult<Arc<dyn Plugin>> {
        let factory = self.factories.get(&manifest.entry).ok_or_else(|| {
            PluginError::load(
                &manifest.id,
                format!("no factory registered for entry '{}'", manifest.entry),
            )
        })?;
        Ok(factory())
    }
}

/// In-process plugins registered directly by the host
#[derive(Default)]
pub struct StaticSource {
    entries: BTreeMap<String, (PluginManifest, PluginFactory)>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin; its manifest is derived from a sample instance
    pub fn with_plugin<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        let sample = factory();
        let manifest = PluginManifest::for_plugin(sample.as_ref());
        self.entries
            .insert(manifest.id.clone(), (manifest, Arc::new(factory)));
        self
    }

    /// Register with an explicit manifest
    pub fn with_manifest<F>(mut self, manifest: PluginManifest, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.entries
            .insert(manifest.id.clone(), (manifest, Arc::new(factory)));
        self
    }
}

impl PluginSource for StaticSource {
    fn scan(&self) -> PluginResult<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn manifest(&self, id: &str) -> PluginResult<PluginManifest> {
        self.entries
            .get(id)
            .map(|(manifest, _)| manifest.clone())
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    fn instantiate(&self, manifest: &PluginManifest) -> PluginResult<Arc<dyn Plugin>> {
        let (_, factory) = self
            .entries
            .get(&manifest.id)
            .ok_or_else(|| PluginError::NotFound(manifest.id.clone()))?;
        Ok(factory())
    }
}

/// A validated, constructed plugin
#[derive(Clone)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub instance: Arc<dyn Plugin>,
    pub version: Version,
    pub dependencies: Vec<DependencySpec>,
    pub loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    pub fn name(&self) -> &str {
        &self.manifest.id
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("manifest", &self.manifest)
            .field("version", &self.version)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Resolves plugins from a source, applies security checks, caches results
pub struct PluginLoader {
    source: Arc<dyn PluginSource>,
    security: Arc<dyn DependencySecurity>,
    cache: RwLock<HashMap<String, LoadedPlugin>>,
}

impl PluginLoader {
    pub fn new(source: Arc<dyn PluginSource>, security: Arc<dyn DependencySecurity>) -> Self {
        Self {
            source,
            security,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn scan(&self) -> PluginResult<Vec<String>> {
        self.source.scan()
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Load `name`, returning the cached handle unless `force_reload`
    pub fn load(&self, name: &str, force_reload: bool) -> PluginResult<LoadedPlugin> {
        if !force_reload {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.get(name) {
                debug!(plugin = %name, "Plugin already loaded, using cache");
                return Ok(cached.clone());
            }
        }

        let loaded = self.resolve(name)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), loaded.clone());
        info!(plugin = %name, version = %loaded.version, "Plugin module loaded");
        Ok(loaded)
    }

    /// Evict `name`; returns whether it was cached
    pub fn unload(&self, name: &str) -> bool {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    fn resolve(&self, name: &str) -> PluginResult<LoadedPlugin> {
        let manifest = self.source.manifest(name)?;
        manifest.validate()?;
        self.check_signature(&manifest)?;

        let instance = self.source.instantiate(&manifest)?;
        if instance.name() != manifest.id {
            return Err(PluginError::load(
                name,
                format!(
                    "instance reports name '{}' but manifest id is '{}'",
                    instance.name(),
                    manifest.id
                ),
            ));
        }

        let version = parse_version(instance.version())
            .map_err(|e| PluginError::load(name, e.to_string()))?;

        let declared = if manifest.dependencies.is_empty() {
            instance.dependencies()
        } else {
            manifest.dependencies.clone()
        };
        let dependencies = declared
            .iter()
            .map(|d| d.parse::<DependencySpec>())
            .collect::<PluginResult<Vec<_>>>()
            .map_err(|e| PluginError::load(name, e.to_string()))?;

        self.check_dependencies(name, &dependencies)?;

        Ok(LoadedPlugin {
            manifest,
            instance,
            version,
            dependencies,
            loaded_at: Utc::now(),
        })
    }

    fn check_signature(&self, manifest: &PluginManifest) -> PluginResult<()> {
        match &manifest.signature {
            Some(signature) => {
                let payload = manifest.signing_payload()?;
                if !self.security.verify_signature(&payload, signature) {
                    return Err(PluginError::load(
                        &manifest.id,
                        "manifest signature verification failed",
                    ));
                }
                debug!(plugin = %manifest.id, "Manifest signature verified");
                Ok(())
            }
            None if self.security.signatures_required() => Err(PluginError::load(
                &manifest.id,
                "manifest is unsigned and signatures are required",
            )),
            None => Ok(()),
        }
    }

    /// Each dependency must be a discoverable plugin or whitelisted
    fn check_dependencies(&self, name: &str, dependencies: &[DependencySpec]) -> PluginResult<()> {
        if dependencies.is_empty() {
            return Ok(());
        }

        let known: HashSet<String> = self.source.scan()?.into_iter().collect();
        for dep in dependencies {
            if known.contains(&dep.name) || self.security.check_whitelist(&dep.name) {
                continue;
            }
            warn!(plugin = %name, dependency = %dep.name, "Dependency rejected by security policy");
            return Err(PluginError::load(
                name,
                format!(
                    "dependency '{}' is neither a known plugin nor whitelisted",
                    dep.name
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::TrustPolicy;
    use crate::testing::TestPlugin;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use ed25519_dalek::{Signer, SigningKey};
    use tempfile::TempDir;

    fn manifest(id: &str) -> PluginManifest {
        PluginManifest::for_plugin(&TestPlugin::new(id))
    }

    fn write_manifest(root: &Path, manifest: &PluginManifest) {
        let dir = root.join(&manifest.id);
        fs::create_dir_all(&dir).expect("plugin dir");
        fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(manifest).expect("serialize"),
        )
        .expect("write manifest");
    }

    fn factories(ids: &[&str]) -> FactoryTable {
        ids.iter().fold(FactoryTable::new(), |table, id| {
            table.register(*id, TestPlugin::new(id).factory())
        })
    }

    fn sign(manifest: &mut PluginManifest, key: &SigningKey) {
        let payload = manifest.signing_payload().expect("payload");
        let digest = crate::security::sha256(&payload);
        manifest.signature = Some(BASE64_STANDARD.encode(key.sign(&digest).to_bytes()));
    }

    #[test]
    fn test_missing_export_names_the_operation() {
        let mut m = manifest("csv");
        m.exports.retain(|e| e != "restore_state");
        assert_eq!(m.missing_exports(), vec!["restore_state"]);
        let err = m.validate().expect_err("invalid");
        assert!(err.to_string().contains("restore_state"), "{err}");
    }

    #[test]
    fn test_directory_scan_and_load() {
        let temp = TempDir::new().expect("temp dir");
        write_manifest(temp.path(), &manifest("alpha"));
        write_manifest(temp.path(), &manifest("beta"));
        fs::create_dir_all(temp.path().join("empty")).expect("dir without manifest");
        fs::create_dir_all(temp.path().join("__pycache__")).expect("hidden dir");

        let source = DirectorySource::new(temp.path(), factories(&["alpha", "beta"]));
        assert_eq!(source.scan().expect("scan"), vec!["alpha", "beta"]);

        let loader = PluginLoader::new(Arc::new(source), Arc::new(TrustPolicy::new()));
        let loaded = loader.load("alpha", false).expect("load");
        assert_eq!(loaded.name(), "alpha");
        assert_eq!(loaded.version, Version::new(1, 0, 0));
        assert!(loader.is_cached("alpha"));
    }

    #[test]
    fn test_cache_hit_unless_forced() {
        let source = StaticSource::new().with_plugin(TestPlugin::new("p").factory());
        let loader = PluginLoader::new(Arc::new(source), Arc::new(TrustPolicy::new()));

        let first = loader.load("p", false).expect("load");
        let cached = loader.load("p", false).expect("cached");
        assert!(Arc::ptr_eq(&first.instance, &cached.instance));

        let forced = loader.load("p", true).expect("forced");
        assert!(!Arc::ptr_eq(&first.instance, &forced.instance));

        assert!(loader.unload("p"));
        assert!(!loader.unload("p"));
        assert!(!loader.is_cached("p"));
    }

    #[test]
    fn test_manifest_id_must_match_directory() {
        let temp = TempDir::new().expect("temp dir");
        let mut m = manifest("alpha");
        write_manifest(temp.path(), &m);
        m.id = "impostor".into();
        fs::write(
            temp.path().join("alpha").join(MANIFEST_FILE),
            serde_json::to_vec(&m).expect("serialize"),
        )
        .expect("overwrite");

        let source = DirectorySource::new(temp.path(), factories(&["alpha"]));
        assert!(matches!(source.manifest("alpha"), Err(PluginError::Load { .. })));
        assert!(source.manifest("../etc").is_err());
    }

    #[test]
    fn test_plugin_id_validation() {
        for bad in ["", ".", "..", "../x", "a/b", "a\\b"] {
            assert!(validate_plugin_id(bad).is_err(), "{bad:?} accepted");
        }
        validate_plugin_id("csv-reader").expect("plain id");
    }

    #[test]
    fn test_oversized_manifest_rejected() {
        let temp = TempDir::new().expect("temp dir");
        write_manifest(temp.path(), &manifest("alpha"));
        let source =
            DirectorySource::new(temp.path(), factories(&["alpha"])).with_max_manifest_bytes(16);
        let err = source.manifest("alpha").expect_err("too large");
        assert!(err.to_string().contains("too large"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_plugin_dir_rejected() {
        let temp = TempDir::new().expect("temp dir");
        let outside = TempDir::new().expect("outside");
        write_manifest(outside.path(), &manifest("alpha"));
        fs::create_dir_all(temp.path()).expect("root");
        std::os::unix::fs::symlink(outside.path().join("alpha"), temp.path().join("alpha"))
            .expect("symlink");

        let source = DirectorySource::new(temp.path(), factories(&["alpha"]));
        let err = source.manifest("alpha").expect_err("symlink");
        assert!(err.to_string().contains("symlink"));
    }

    #[test]
    fn test_unknown_entry_is_load_error() {
        let temp = TempDir::new().expect("temp dir");
        write_manifest(temp.path(), &manifest("alpha"));
        let source = DirectorySource::new(temp.path(), FactoryTable::new());
        let loader = PluginLoader::new(Arc::new(source), Arc::new(TrustPolicy::new()));
        let err = loader.load("alpha", false).expect_err("no factory");
        assert!(err.to_string().contains("no factory"));
    }

    #[test]
    fn test_dependency_security() {
        let source = StaticSource::new()
            .with_plugin(TestPlugin::new("base").factory())
            .with_plugin(TestPlugin::new("ok").depends_on("base>=1.0").factory())
            .with_plugin(TestPlugin::new("ext").depends_on("numpy~=1.26").factory())
            .with_plugin(TestPlugin::new("bad").depends_on("evil").factory());
        let loader = PluginLoader::new(
            Arc::new(source),
            Arc::new(TrustPolicy::new().allow("numpy")),
        );

        let ok = loader.load("ok", false).expect("known plugin dependency");
        assert_eq!(ok.dependencies[0].name, "base");
        loader.load("ext", false).expect("whitelisted dependency");
        let err = loader.load("bad", false).expect_err("rejected");
        assert!(err.to_string().contains("evil"));
        assert!(!loader.is_cached("bad"));
    }

    #[test]
    fn test_signed_manifests() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let temp = TempDir::new().expect("temp dir");

        let mut signed = manifest("signed");
        sign(&mut signed, &key);
        write_manifest(temp.path(), &signed);

        let mut tampered = manifest("tampered");
        sign(&mut tampered, &key);
        tampered.description = "changed after signing".into();
        write_manifest(temp.path(), &tampered);

        write_manifest(temp.path(), &manifest("unsigned"));

        let policy = TrustPolicy::new()
            .with_trusted_key(key.verifying_key())
            .require_signatures(true);
        let source = DirectorySource::new(
            temp.path(),
            factories(&["signed", "tampered", "unsigned"]),
        );
        let loader = PluginLoader::new(Arc::new(source), Arc::new(policy));

        loader.load("signed", false).expect("valid signature");
        assert!(loader.load("tampered", false).is_err());
        let err = loader.load("unsigned", false).expect_err("unsigned");
        assert!(err.to_string().contains("unsigned"));
    }
}

//! Dependency whitelist and manifest signature verification (ed25519)

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tabula_core::config::SecurityConfig;
use tracing::{debug, warn};

use crate::{PluginError, PluginResult};

/// Security checks consulted by the loader
pub trait DependencySecurity: Send + Sync {
    /// Whether an external dependency name may be declared
    fn check_whitelist(&self, name: &str) -> bool;

    /// Verify a base64 signature over `bytes`
    fn verify_signature(&self, bytes: &[u8], signature: &str) -> bool;

    /// Reject unsigned manifests
    fn signatures_required(&self) -> bool {
        false
    }
}

/// Whitelist plus an optional trusted ed25519 key.
///
/// Signatures are checked over the SHA-256 digest of the signed bytes.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    whitelist: BTreeSet<String>,
    trusted_key: Option<VerifyingKey>,
    require_signatures: bool,
}

impl TrustPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SecurityConfig) -> PluginResult<Self> {
        let trusted_key = config
            .trusted_key
            .as_deref()
            .map(decode_verifying_key)
            .transpose()?;

        Ok(Self {
            whitelist: config.dependency_whitelist.iter().cloned().collect(),
            trusted_key,
            require_signatures: config.require_signatures,
        })
    }

    pub fn allow(mut self, name: impl Into<String>) -> Self {
        self.whitelist.insert(name.into());
        self
    }

    pub fn with_trusted_key(mut self, key: VerifyingKey) -> Self {
        self.trusted_key = Some(key);
        self
    }

    pub fn require_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }
}

impl DependencySecurity for TrustPolicy {
    fn check_whitelist(&self, name: &str) -> bool {
        self.whitelist.contains(name)
    }

    fn verify_signature(&self, bytes: &[u8], signature: &str) -> bool {
        let Some(key) = &self.trusted_key else {
            warn!("Signature present but no trusted key configured");
            return false;
        };

        let sig_bytes = match BASE64_STANDARD.decode(signature.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Invalid signature encoding");
                return false;
            }
        };
        let sig = match Signature::from_slice(&sig_bytes) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "Invalid signature");
                return false;
            }
        };

        let verified = key.verify(&sha256(bytes), &sig).is_ok();
        debug!(verified, "Signature checked");
        verified
    }

    fn signatures_required(&self) -> bool {
        self.require_signatures
    }
}

pub(crate) fn sha256(bytes: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().to_vec()
}

fn decode_verifying_key(key_b64: &str) -> PluginResult<VerifyingKey> {
    let invalid = |reason: String| {
        PluginError::Core(tabula_core::Error::InvalidKey(format!(
            "trusted key: {reason}"
        )))
    };

    let key_bytes = BASE64_STANDARD
        .decode(key_b64.trim())
        .map_err(|e| invalid(e.to_string()))?;

    let key_array: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = key_bytes
        .try_into()
        .map_err(|_| invalid("must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&key_array).map_err(|e| invalid(e.to_string()))
}

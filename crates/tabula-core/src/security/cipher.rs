//! AES-256-GCM encryption of JSON documents

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of AES-256 key in bytes
const AES_KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes
const NONCE_SIZE: usize = 12;

/// Opaque encrypt/decrypt of JSON documents
pub trait Encryption: Send + Sync {
    /// Serialize and encrypt a document
    fn encrypt(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    /// Decrypt and deserialize a document
    fn decrypt(&self, bytes: &[u8]) -> Result<serde_json::Value>;

    /// File extension used by stores for documents written through this codec
    fn extension(&self) -> &'static str {
        "bin"
    }
}

/// A master encryption key that is securely zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; AES_KEY_SIZE],
}

impl MasterKey {
    /// Generate a new random master key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; AES_KEY_SIZE];
        bytes.copy_from_slice(key.as_slice());
        Self { bytes }
    }

    /// Create a master key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AES_KEY_SIZE {
            return Err(Error::InvalidKey(format!(
                "expected {} bytes, got {}",
                AES_KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; AES_KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Create a master key from base64-encoded string
    pub fn from_base64(b64: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(b64.trim())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Export key as base64 string
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    /// Short fingerprint safe to log
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.bytes[..4])
    }

    fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM codec; output layout is `nonce || ciphertext`
#[derive(Debug, Clone)]
pub struct AesGcmCipher {
    key: MasterKey,
}

impl AesGcmCipher {
    /// Create a cipher from an existing key
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    /// Read the base64 key file, or generate and write one if missing
    pub fn load_or_generate(key_file: &Path) -> Result<Self> {
        if key_file.exists() {
            let encoded = fs::read_to_string(key_file)?;
            let key = MasterKey::from_base64(&encoded)?;
            debug!(key_file = %key_file.display(), fingerprint = %key.fingerprint(), "Loaded encryption key");
            return Ok(Self::new(key));
        }

        if let Some(dir) = key_file.parent() {
            fs::create_dir_all(dir)?;
        }
        let key = MasterKey::generate();
        fs::write(key_file, key.to_base64())?;
        info!(key_file = %key_file.display(), fingerprint = %key.fingerprint(), "Generated encryption key");
        Ok(Self::new(key))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.as_bytes())
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }
}

impl Encryption for AesGcmCipher {
    fn encrypt(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(value)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher()?
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        if bytes.len() <= NONCE_SIZE {
            return Err(Error::DecryptionFailed(format!(
                "payload of {} bytes is shorter than the nonce",
                bytes.len()
            )));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self.cipher()?.decrypt(nonce, ciphertext).map_err(|_| {
            Error::DecryptionFailed("invalid key or corrupted data".to_string())
        })?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Pass-through codec writing human-readable JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainJson;

impl Encryption for PlainJson {
    fn encrypt(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn decrypt(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

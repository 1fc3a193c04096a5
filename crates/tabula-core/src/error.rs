//! Error types for Tabula core services

use thiserror::Error;

/// Result type alias using Tabula's core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types shared by the runtime crates
#[derive(Error, Debug)]
pub enum Error {
    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown configuration key: {0}")]
    UnknownConfigKey(String),

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // Crypto errors (E700-E799)
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "E600",
            Self::UnknownConfigKey(_) => "E601",
            Self::Toml(_) => "E602",
            Self::TomlSerialize(_) => "E603",
            Self::EncryptionFailed(_) => "E700",
            Self::DecryptionFailed(_) => "E701",
            Self::InvalidKey(_) => "E702",
            Self::Serialization(_) | Self::Io(_) => "E9999",
        }
    }

    /// Whether retrying the same operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

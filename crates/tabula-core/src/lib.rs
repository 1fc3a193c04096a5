//! Tabula Core Library
//!
//! Shared services for the Tabula plugin runtime:
//! - Runtime configuration (TOML on disk, dotted get/set keys)
//! - Error types with stable codes
//! - Tracing initialisation
//! - At-rest encryption for persisted runtime state

pub mod config;
pub mod error;
pub mod logging;
pub mod security;

pub use config::RuntimeConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{Error, Result};
    pub use crate::security::{AesGcmCipher, Encryption, PlainJson};
}

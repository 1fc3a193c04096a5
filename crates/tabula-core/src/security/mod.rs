//! At-rest protection for runtime state
//!
//! Permission grants, plugin configs and saved workflows are persisted
//! through the [`Encryption`] trait so stores never depend on a concrete
//! cipher. Two implementations are provided:
//! - [`AesGcmCipher`]: AES-256-GCM with a key file on disk
//! - [`PlainJson`]: pretty-printed JSON, used when encryption is disabled

pub mod cipher;

pub use cipher::{AesGcmCipher, Encryption, MasterKey, PlainJson};

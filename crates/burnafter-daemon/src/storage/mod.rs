//! Storage backends for encrypted secret payloads.
//!
//! The daemon persists only ciphertext: a [`Payload`] bundles the encrypted
//! bytes with the salt used for key derivation and the digest of the client
//! binary that stored it. Lifecycle (TTLs, deadlines) is the daemon's job;
//! the backend is a plain keyed store.
//!
//! Two implementations exist. On Linux the kernel keyring backend is
//! preferred, keeping ciphertext out of the process address space; the
//! in-memory backend is the fallback everywhere else or when the keyring
//! cannot be initialized. Selection happens once at startup, never at
//! runtime.

mod memory;

#[cfg(target_os = "linux")]
mod keyring;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub use memory::MemoryStorage;

#[cfg(target_os = "linux")]
pub use keyring::KeyringStorage;

/// The stored form of a single secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// `nonce || ciphertext || tag` as produced by the crypto layer.
    pub encrypted_data: Vec<u8>,

    /// Salt used to derive this secret's key.
    pub salt: Vec<u8>,

    /// Hex digest of the client binary observed at store time, re-checked
    /// against the caller on every retrieval.
    pub client_digest: String,
}

/// Errors from a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No payload is bound to the requested id.
    #[error("secret not found")]
    NotFound,

    /// The payload bytes in the backend did not decode.
    #[error("decoding stored payload: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The backend itself failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Keyed storage of encrypted payloads.
///
/// `delete` of an unknown id is success; `get` of an unknown id is the
/// distinct [`StorageError::NotFound`]. Payloads must round-trip through
/// `store` then `get` byte-equal on all three fields.
pub trait Storage: Send + Sync {
    /// Insert or replace the payload bound to `id`.
    fn store(&self, id: &str, payload: Payload) -> Result<(), StorageError>;

    /// Return the payload bound to `id`.
    fn get(&self, id: &str) -> Result<Payload, StorageError>;

    /// Remove any binding for `id`. Missing ids are not an error.
    fn delete(&self, id: &str) -> Result<(), StorageError>;
}

/// Select the storage backend for this process.
///
/// Linux tries the kernel keyring first and degrades to the in-memory map
/// when the keyring cannot be initialized; other platforms always use the
/// in-memory map.
pub fn default_backend() -> Arc<dyn Storage> {
    #[cfg(target_os = "linux")]
    {
        match KeyringStorage::new() {
            Ok(keyring) => {
                info!("Using kernel keyring storage backend");
                return Arc::new(keyring);
            }
            Err(e) => {
                warn!(error = %e, "Kernel keyring unavailable, using in-memory storage");
            }
        }
    }

    Arc::new(MemoryStorage::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_encoding_roundtrips_byte_equal() {
        let payload = Payload {
            encrypted_data: vec![0, 1, 2, 255, 254],
            salt: vec![9; 16],
            client_digest: "ab".repeat(32),
        };

        let bytes = serde_json::to_vec(&payload).unwrap();
        let decoded: Payload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn default_backend_is_usable() {
        let backend = default_backend();
        let payload = Payload {
            encrypted_data: vec![1, 2, 3],
            salt: vec![0; 16],
            client_digest: "cd".repeat(32),
        };

        backend.store("smoke-test", payload.clone()).unwrap();
        assert_eq!(backend.get("smoke-test").unwrap(), payload);
        backend.delete("smoke-test").unwrap();
        assert!(matches!(
            backend.get("smoke-test"),
            Err(StorageError::NotFound)
        ));
    }
}

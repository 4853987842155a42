//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{Payload, Storage, StorageError};

/// A map from id to payload behind a reader/writer lock.
///
/// Used when the kernel keyring is absent or failed to initialize. Nothing
/// persists; the store dies with the process, which matches the daemon's
/// ephemeral model anyway.
pub struct MemoryStorage {
    data: RwLock<HashMap<String, Payload>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory backend.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn store(&self, id: &str, payload: Payload) -> Result<(), StorageError> {
        let mut data = self.data.write().expect("storage lock poisoned");
        data.insert(id.to_string(), payload);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Payload, StorageError> {
        let data = self.data.read().expect("storage lock poisoned");
        data.get(id).cloned().ok_or(StorageError::NotFound)
    }

    fn delete(&self, id: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().expect("storage lock poisoned");
        data.remove(id);
        Ok(())
    }
}

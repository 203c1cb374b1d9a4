//! Private key storage backends.
//!
//! A backend holds armored private keys by fingerprint, each with an optional
//! JSON metadata document. The custodian reads from it at startup and on
//! demand when a key is not resident.

mod disk;

pub use disk::DiskBackend;

use dashmap::DashMap;

use crate::types::{KeywardenError, Result};

/// A stored key and its metadata (empty string when absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKey {
    pub data: String,
    pub metadata: String,
}

/// Persistent home for private keys.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Location description for logs
    fn path(&self) -> String;

    /// Identifiers of every stored key
    async fn list(&self) -> Result<Vec<String>>;

    /// Read a key. Missing keys are `NotFound`.
    async fn read(&self, key: &str) -> Result<StoredKey>;

    async fn save(&self, key: &str, data: &str) -> Result<()>;

    async fn save_with_metadata(&self, key: &str, data: &str, metadata: &str) -> Result<()>;

    /// Remove a key and its metadata. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Volatile backend used by tests and by the escrow's master custodian.
#[derive(Default)]
pub struct MemoryBackend {
    keys: DashMap<String, StoredKey>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn path(&self) -> String {
        "memory://".to_string()
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.keys.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn read(&self, key: &str) -> Result<StoredKey> {
        self.keys
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| KeywardenError::NotFound(format!("stored key {}", key)))
    }

    async fn save(&self, key: &str, data: &str) -> Result<()> {
        self.save_with_metadata(key, data, "").await
    }

    async fn save_with_metadata(&self, key: &str, data: &str, metadata: &str) -> Result<()> {
        self.keys.insert(
            key.to_string(),
            StoredKey {
                data: data.to_string(),
                metadata: metadata.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.keys.remove(key);
        Ok(())
    }
}

//! Object storage used to move files between the local machine and clusters.
//!
//! Every backend implements [`ObjectStore`]; [`JobStorage`] scopes one job's
//! reads and writes to its own `input/`, `output/` and `mount/` namespaces.

mod endpoint;
mod error;
mod fs;
mod job;
mod memory;

pub use endpoint::open_store;
pub use error::{Result, StorageError};
pub use fs::FsObjectStore;
pub use job::{Area, JobStorage, PurgeReport, StorageLocation, StorageScope};
pub use memory::MemoryObjectStore;

use async_trait::async_trait;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable endpoint, used in logs and error messages.
    fn describe(&self) -> String;

    /// Checks that the backend is reachable.
    async fn probe(&self) -> Result<()>;

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Keys starting with `prefix`, sorted. Empty when nothing matches.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Rejects keys that could escape the store root or are not plain relative paths.
pub fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

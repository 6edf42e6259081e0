use crate::{FsObjectStore, MemoryObjectStore, ObjectStore, Result, StorageError};
use cumulus_core::constants::schemes;
use cumulus_core::model::StorageConfig;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

static MEMORY_STORES: Lazy<Mutex<HashMap<String, Arc<MemoryObjectStore>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn named_memory_store(name: &str) -> Arc<MemoryObjectStore> {
    let mut stores = MEMORY_STORES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    stores
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(MemoryObjectStore::new(name)))
        .clone()
}

/// Opens the backend an endpoint string names:
/// `file:///path`, `/path`, `~/path` or `memory://name`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let endpoint = config.endpoint.trim();

    if let Some(name) = endpoint.strip_prefix(schemes::MEMORY) {
        return Ok(named_memory_store(name));
    }

    let raw_path = endpoint.strip_prefix(schemes::FILE).unwrap_or(endpoint);
    if raw_path.starts_with('/') || raw_path.starts_with('~') {
        let expanded = shellexpand::tilde(raw_path).into_owned();
        tracing::debug!("Opening filesystem store at '{}'", expanded);
        return Ok(Arc::new(FsObjectStore::new(PathBuf::from(expanded))));
    }

    Err(StorageError::UnsupportedEndpoint(endpoint.to_string()))
}

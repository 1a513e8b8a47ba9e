use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::models::{Collection, CollectionMap};
use super::StateStore;
use crate::error::StorageError;

/// Whole-document JSON store on disk.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    /// Load every collection, or an empty map if the document doesn't exist yet
    fn load(&self) -> Result<CollectionMap, StorageError> {
        if !self.path.exists() {
            log::info!("No data file at {:?}, starting empty", self.path);
            return Ok(CollectionMap::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(CollectionMap::new());
        }
        let collections = serde_json::from_str(&contents)?;
        Ok(collections)
    }

    /// Write the whole map atomically (temp file, then rename)
    fn save(&self, collections: &CollectionMap) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(collections)?;
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// In-process store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<CollectionMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collections(collections: CollectionMap) -> Self {
        Self {
            collections: Mutex::new(collections),
        }
    }

    /// Copy of the last saved state
    pub fn snapshot(&self) -> CollectionMap {
        match self.collections.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn collection(&self, name: &str) -> Option<Collection> {
        self.snapshot().get(name).cloned()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<CollectionMap, StorageError> {
        Ok(self.snapshot())
    }

    fn save(&self, collections: &CollectionMap) -> Result<(), StorageError> {
        let mut guard = match self.collections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = collections.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{AddressRecord, MonitorPolicy};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("nope.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_creates_parent_and_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("nested").join("collections.json"));

        let mut collection = Collection::default();
        collection
            .addresses
            .push(AddressRecord::new("bc1qexample", "donations", MonitorPolicy::default()));
        let mut map = CollectionMap::new();
        map.insert("main".to_string(), collection);

        store.save(&map).unwrap();
        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, map);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("collections.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonFileStore::new(path);
        assert!(matches!(store.load(), Err(StorageError::Json(_))));
    }
}

//! Storage and persistence layer
//!
//! - Collection document models
//! - Whole-document stores (file system, memory)

mod file_system;
pub mod models;

pub use file_system::{JsonFileStore, MemoryStore};
pub use models::{
    AddressRecord, AlertFlags, Balances, Collection, CollectionMap, Field, MonitorPolicy, Policy,
    Source,
};

use crate::error::StorageError;

/// Loads and saves the full collection map as one document.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<CollectionMap, StorageError>;
    fn save(&self, collections: &CollectionMap) -> Result<(), StorageError>;
}

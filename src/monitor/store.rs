//! In-memory collection store
//!
//! Owns the collection document and is the only place that mutates it.
//! Records are addressed by [`AddressRef`] (collection, owning source,
//! address string) so the same address may appear in several places.

use serde::{Deserialize, Serialize};

use super::gap;
use crate::error::MonitorError;
use crate::storage::{AddressRecord, Collection, CollectionMap, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    ExtendedKey,
    Descriptor,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::ExtendedKey => "extended key",
            SourceKind::Descriptor => "descriptor",
        }
    }
}

/// Identity of one tracked address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRef {
    pub address: String,
    #[serde(rename = "collectionName")]
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_name: Option<String>,
}

impl AddressRef {
    pub fn plain(collection: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            collection: collection.into(),
            extended_key_name: None,
            descriptor_name: None,
        }
    }

    pub fn in_source(
        collection: impl Into<String>,
        kind: SourceKind,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let mut item = Self::plain(collection, address);
        match kind {
            SourceKind::ExtendedKey => item.extended_key_name = Some(name.into()),
            SourceKind::Descriptor => item.descriptor_name = Some(name.into()),
        }
        item
    }

    /// Owning source, if the address was derived.
    pub fn source(&self) -> Option<(SourceKind, &str)> {
        if let Some(name) = &self.extended_key_name {
            Some((SourceKind::ExtendedKey, name.as_str()))
        } else {
            self.descriptor_name
                .as_deref()
                .map(|name| (SourceKind::Descriptor, name))
        }
    }
}

/// What a refresh applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum Selector {
    All,
    Collection {
        collection: String,
    },
    Source {
        collection: String,
        kind: SourceKind,
        name: String,
    },
    Address(AddressRef),
}

#[derive(Debug, Default)]
pub struct Store {
    collections: CollectionMap,
}

impl Store {
    /// Take ownership of a loaded document. Stale `queued` flags are cleared,
    /// derived addresses are put back in index order and sources stored
    /// without addresses get their initial batch.
    pub fn new(mut collections: CollectionMap) -> Self {
        for (name, collection) in collections.iter_mut() {
            gap::seed_empty_sources(name, collection);
            for record in collection.addresses.iter_mut() {
                record.queued = false;
            }
            for source in collection
                .extended_keys
                .iter_mut()
                .chain(collection.descriptors.iter_mut())
            {
                tidy_source(source);
                for record in source.addresses.iter_mut() {
                    record.queued = false;
                }
            }
        }
        Self { collections }
    }

    pub fn collections(&self) -> &CollectionMap {
        &self.collections
    }

    pub fn collection(&self, name: &str) -> Result<&Collection, MonitorError> {
        self.collections
            .get(name)
            .ok_or_else(|| MonitorError::NotFound(format!("collection '{}'", name)))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection, MonitorError> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| MonitorError::NotFound(format!("collection '{}'", name)))
    }

    pub fn add_collection(&mut self, name: &str) -> Result<(), MonitorError> {
        if name.trim().is_empty() {
            return Err(MonitorError::InvalidInput("collection name must not be empty".into()));
        }
        if self.collections.contains_key(name) {
            return Err(MonitorError::AlreadyExists(format!("collection '{}'", name)));
        }
        self.collections.insert(name.to_string(), Collection::default());
        Ok(())
    }

    /// Insert or overwrite a whole collection, as on import.
    pub fn insert_collection(&mut self, name: &str, collection: Collection) -> Option<Collection> {
        let mut normalized = Store::new(CollectionMap::from([(name.to_string(), collection)]));
        let collection = normalized.collections.remove(name).unwrap_or_default();
        self.collections.insert(name.to_string(), collection)
    }

    pub fn remove_collection(&mut self, name: &str) -> Result<Collection, MonitorError> {
        self.collections
            .remove(name)
            .ok_or_else(|| MonitorError::NotFound(format!("collection '{}'", name)))
    }

    pub fn add_address(&mut self, collection: &str, record: AddressRecord) -> Result<AddressRef, MonitorError> {
        let target = self.collection_mut(collection)?;
        if target.addresses.iter().any(|r| r.address == record.address) {
            return Err(MonitorError::AlreadyExists(format!(
                "address {} in collection '{}'",
                record.address, collection
            )));
        }
        let item = AddressRef::plain(collection, record.address.clone());
        target.addresses.push(record);
        Ok(item)
    }

    pub fn remove_address(&mut self, collection: &str, address: &str) -> Result<AddressRecord, MonitorError> {
        let target = self.collection_mut(collection)?;
        let position = target
            .addresses
            .iter()
            .position(|r| r.address == address)
            .ok_or_else(|| MonitorError::NotFound(format!("address {} in collection '{}'", address, collection)))?;
        Ok(target.addresses.remove(position))
    }

    fn sources_mut(&mut self, collection: &str, kind: SourceKind) -> Result<&mut Vec<Source>, MonitorError> {
        let target = self.collection_mut(collection)?;
        Ok(match kind {
            SourceKind::ExtendedKey => &mut target.extended_keys,
            SourceKind::Descriptor => &mut target.descriptors,
        })
    }

    pub fn source(&self, collection: &str, kind: SourceKind, name: &str) -> Result<&Source, MonitorError> {
        let target = self.collection(collection)?;
        let sources = match kind {
            SourceKind::ExtendedKey => &target.extended_keys,
            SourceKind::Descriptor => &target.descriptors,
        };
        sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| not_found_source(collection, kind, name))
    }

    fn source_mut(&mut self, collection: &str, kind: SourceKind, name: &str) -> Result<&mut Source, MonitorError> {
        self.sources_mut(collection, kind)?
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| not_found_source(collection, kind, name))
    }

    pub fn add_source(&mut self, collection: &str, kind: SourceKind, mut source: Source) -> Result<(), MonitorError> {
        let sources = self.sources_mut(collection, kind)?;
        if sources.iter().any(|s| s.name == source.name) {
            return Err(MonitorError::AlreadyExists(format!(
                "{} '{}' in collection '{}'",
                kind.label(),
                source.name,
                collection
            )));
        }
        tidy_source(&mut source);
        sources.push(source);
        Ok(())
    }

    /// Swap the source named `name` for `source`, returning the old one.
    pub fn replace_source(
        &mut self,
        collection: &str,
        kind: SourceKind,
        name: &str,
        mut source: Source,
    ) -> Result<Source, MonitorError> {
        let sources = self.sources_mut(collection, kind)?;
        if source.name != name && sources.iter().any(|s| s.name == source.name) {
            return Err(MonitorError::AlreadyExists(format!(
                "{} '{}' in collection '{}'",
                kind.label(),
                source.name,
                collection
            )));
        }
        let slot = sources
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| not_found_source(collection, kind, name))?;
        tidy_source(&mut source);
        Ok(std::mem::replace(slot, source))
    }

    pub fn remove_source(&mut self, collection: &str, kind: SourceKind, name: &str) -> Result<Source, MonitorError> {
        let sources = self.sources_mut(collection, kind)?;
        let position = sources
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| not_found_source(collection, kind, name))?;
        Ok(sources.remove(position))
    }

    /// Append derived records to a source. Records whose address or index is
    /// already present are dropped. Returns references to what was added.
    pub fn append_addresses(
        &mut self,
        collection: &str,
        kind: SourceKind,
        name: &str,
        records: Vec<AddressRecord>,
    ) -> Result<Vec<AddressRef>, MonitorError> {
        let source = self.source_mut(collection, kind, name)?;
        let mut added = Vec::new();
        for record in records {
            let duplicate = source
                .addresses
                .iter()
                .any(|r| r.address == record.address || (record.index.is_some() && r.index == record.index));
            if duplicate {
                continue;
            }
            added.push(AddressRef::in_source(collection, kind, name, record.address.clone()));
            source.addresses.push(record);
        }
        tidy_source(source);
        Ok(added)
    }

    pub fn record(&self, item: &AddressRef) -> Result<&AddressRecord, MonitorError> {
        let records = match item.source() {
            Some((kind, name)) => &self.source(&item.collection, kind, name)?.addresses,
            None => &self.collection(&item.collection)?.addresses,
        };
        records
            .iter()
            .find(|r| r.address == item.address)
            .ok_or_else(|| MonitorError::NotFound(format!("address {}", item.address)))
    }

    pub fn record_mut(&mut self, item: &AddressRef) -> Result<&mut AddressRecord, MonitorError> {
        let records = match item.source() {
            Some((kind, name)) => &mut self.source_mut(&item.collection, kind, name)?.addresses,
            None => &mut self.collection_mut(&item.collection)?.addresses,
        };
        records
            .iter_mut()
            .find(|r| r.address == item.address)
            .ok_or_else(|| MonitorError::NotFound(format!("address {}", item.address)))
    }

    /// Expand a selector into concrete address references, in document order.
    pub fn select(&self, selector: &Selector) -> Result<Vec<AddressRef>, MonitorError> {
        match selector {
            Selector::All => Ok(self
                .collections
                .iter()
                .flat_map(|(name, collection)| collection_refs(name, collection))
                .collect()),
            Selector::Collection { collection } => Ok(collection_refs(collection, self.collection(collection)?)),
            Selector::Source { collection, kind, name } => {
                let source = self.source(collection, *kind, name)?;
                Ok(source_refs(collection, *kind, source))
            }
            Selector::Address(item) => {
                self.record(item)?;
                Ok(vec![item.clone()])
            }
        }
    }

    /// Every place `address` is tracked.
    pub fn locate(&self, address: &str) -> Vec<AddressRef> {
        self.collections
            .iter()
            .flat_map(|(name, collection)| collection_refs(name, collection))
            .filter(|item| item.address == address)
            .collect()
    }
}

fn collection_refs(name: &str, collection: &Collection) -> Vec<AddressRef> {
    let mut refs: Vec<AddressRef> = collection
        .addresses
        .iter()
        .map(|r| AddressRef::plain(name, r.address.clone()))
        .collect();
    for source in &collection.extended_keys {
        refs.extend(source_refs(name, SourceKind::ExtendedKey, source));
    }
    for source in &collection.descriptors {
        refs.extend(source_refs(name, SourceKind::Descriptor, source));
    }
    refs
}

fn source_refs(collection: &str, kind: SourceKind, source: &Source) -> Vec<AddressRef> {
    source
        .addresses
        .iter()
        .map(|r| AddressRef::in_source(collection, kind, source.name.clone(), r.address.clone()))
        .collect()
}

fn not_found_source(collection: &str, kind: SourceKind, name: &str) -> MonitorError {
    MonitorError::NotFound(format!("{} '{}' in collection '{}'", kind.label(), name, collection))
}

/// Index order, one record per address.
fn tidy_source(source: &mut Source) {
    source.addresses.sort_by_key(|r| r.index);
    let mut seen = std::collections::HashSet::new();
    source.addresses.retain(|r| seen.insert(r.address.clone()));
}

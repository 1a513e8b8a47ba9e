use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;

use super::detector;
use super::gap;
use super::queue::{self, WorkQueue};
use super::store::{AddressRef, Selector, SourceKind, Store};
use crate::bitcoin::BalanceSource;
use crate::config::MonitorConfig;
use crate::error::{FetchError, MonitorError, StorageError};
use crate::keys::derive::MAX_DERIVE_COUNT;
use crate::notify::{Notification, NotificationDispatcher, Notifier};
use crate::storage::{AddressRecord, Balances, Collection, CollectionMap, Field, MonitorPolicy, Source, StateStore};

/// Health of the balance API as seen by the last round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiState {
    #[default]
    Ok,
    Error,
    Backoff,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub state: ApiState,
    pub message: Option<String>,
    pub last_round: Option<DateTime<Utc>>,
}

/// Whole-state view handed to observers after every mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub collections: CollectionMap,
    pub status: SystemStatus,
    pub queue_len: usize,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Minimum spacing between dispatches, and the idle wait between cycles
    pub api_delay: Duration,
    pub parallel_limit: usize,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            api_delay: config.api_delay,
            parallel_limit: config.parallel_limit.max(1),
        }
    }
}

/// A plain address added by the operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAddress {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub monitor: MonitorPolicy,
    #[serde(default)]
    pub expect: Balances,
    #[serde(default)]
    pub track_websocket: bool,
}

impl NewAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            monitor: MonitorPolicy::default(),
            expect: Balances::default(),
            track_websocket: false,
        }
    }
}

/// Partial edit of an address record; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressUpdate {
    pub name: Option<String>,
    pub monitor: Option<MonitorPolicy>,
    pub expect: Option<Balances>,
    pub track_websocket: Option<bool>,
}

/// Operator input for an extended-key or descriptor source.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub derivation_path: Option<String>,
    pub gap_limit: Option<u32>,
    pub skip: Option<u32>,
    pub initial_addresses: Option<u32>,
    #[serde(default)]
    pub monitor: MonitorPolicy,
}

impl SourceSpec {
    pub fn extended_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::named(name)
        }
    }

    pub fn descriptor(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: Some(descriptor.into()),
            ..Self::named(name)
        }
    }

    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            descriptor: None,
            derivation_path: None,
            gap_limit: None,
            skip: None,
            initial_addresses: None,
            monitor: MonitorPolicy::default(),
        }
    }

    fn into_source(self, kind: SourceKind) -> Result<Source, MonitorError> {
        if self.name.trim().is_empty() {
            return Err(MonitorError::InvalidInput("name must not be empty".into()));
        }
        let mut source = match (kind, self.key, self.descriptor) {
            (SourceKind::ExtendedKey, Some(key), None) => {
                let mut source = Source::extended_key(self.name, key.trim());
                source.derivation_path = self.derivation_path;
                source
            }
            (SourceKind::Descriptor, None, Some(descriptor)) => {
                if self.derivation_path.is_some() {
                    return Err(MonitorError::InvalidInput(
                        "descriptors carry their own derivation path".into(),
                    ));
                }
                Source::descriptor(self.name, descriptor.trim())
            }
            (SourceKind::ExtendedKey, _, _) => {
                return Err(MonitorError::InvalidInput(
                    "an extended key source needs `key` and no `descriptor`".into(),
                ))
            }
            (SourceKind::Descriptor, _, _) => {
                return Err(MonitorError::InvalidInput(
                    "a descriptor source needs `descriptor` and no `key`".into(),
                ))
            }
        };
        if let Some(gap_limit) = self.gap_limit {
            source.gap_limit = gap_limit;
        }
        if let Some(skip) = self.skip {
            source.skip = skip;
        }
        if let Some(initial) = self.initial_addresses {
            source.initial_addresses = initial;
        }
        for (field, value) in [("gapLimit", source.gap_limit), ("initialAddresses", source.initial_addresses)] {
            if value > MAX_DERIVE_COUNT {
                return Err(MonitorError::InvalidInput(format!(
                    "{} must be at most {}, got {}",
                    field, MAX_DERIVE_COUNT, value
                )));
            }
        }
        source.monitor = self.monitor;
        Ok(source)
    }
}

/// Everything guarded by the monitor's single lock.
#[derive(Debug, Default)]
pub(crate) struct MonitorState {
    pub(crate) store: Store,
    pub(crate) queue: WorkQueue,
    pub(crate) status: SystemStatus,
}

impl MonitorState {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            collections: self.store.collections().clone(),
            status: self.status.clone(),
            queue_len: self.queue.len(),
        }
    }

    pub(crate) fn enqueue(&mut self, selector: &Selector) -> Result<usize, MonitorError> {
        queue::enqueue(&mut self.store, &mut self.queue, selector)
    }

    /// Record the outcome of one balance fetch.
    pub(crate) fn complete_fetch(
        &mut self,
        item: &AddressRef,
        result: &Result<Balances, FetchError>,
    ) -> Result<Option<Notification>, MonitorError> {
        let record = self.store.record_mut(item)?;
        record.queued = false;
        match result {
            Ok(snapshot) => {
                record.error = false;
                record.error_message = None;
                self.reconcile(item, *snapshot)
            }
            Err(e) => {
                // `actual` keeps the last good observation
                record.error = true;
                record.error_message = Some(e.to_string());
                Ok(None)
            }
        }
    }

    /// Run change detection for a fresh cumulative snapshot, then keep the
    /// owning source's gap filled.
    pub(crate) fn reconcile(
        &mut self,
        item: &AddressRef,
        snapshot: Balances,
    ) -> Result<Option<Notification>, MonitorError> {
        let record = self.store.record_mut(item)?;
        let notification = detector::reconcile(record, snapshot).map(|set| Notification {
            collection: item.collection.clone(),
            name: item
                .source()
                .map(|(_, name)| name.to_string())
                .unwrap_or_else(|| record.name.clone()),
            address: record.address.clone(),
            changes: set.changes,
        });

        if let Some((kind, name)) = item.source() {
            self.maintain_gap(&item.collection, kind, name);
        }
        Ok(notification)
    }

    fn maintain_gap(&mut self, collection: &str, kind: SourceKind, name: &str) {
        let records = match self.store.source(collection, kind, name).map(gap::expansion) {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                log::error!("Could not extend {} '{}': {}", kind.label(), name, e);
                return;
            }
            Err(_) => return,
        };
        if records.is_empty() {
            return;
        }

        match self.store.append_addresses(collection, kind, name, records) {
            Ok(added) => {
                log::info!(
                    "➕ Derived {} more address(es) for {} '{}' in '{}'",
                    added.len(),
                    kind.label(),
                    name,
                    collection
                );
                for item in added {
                    if let Err(e) = self.enqueue(&Selector::Address(item)) {
                        log::warn!("Could not queue new address: {}", e);
                    }
                }
            }
            Err(e) => log::error!("Could not store new addresses: {}", e),
        }
    }

    fn drop_queued<F>(&mut self, matches: F)
    where
        F: Fn(&AddressRef) -> bool,
    {
        self.queue.retain(|item| !matches(item));
    }
}

/// Orchestrates the store, the reconciliation queue and alert delivery.
///
/// All mutable state sits behind one lock. Every mutation persists the whole
/// document through the [`StateStore`] and broadcasts a [`StateSnapshot`].
pub struct Monitor {
    pub(crate) state: Mutex<MonitorState>,
    pub(crate) settings: MonitorSettings,
    pub(crate) balances: Arc<dyn BalanceSource>,
    backend: Arc<dyn StateStore>,
    pub(crate) notifications: NotificationDispatcher,
    events: broadcast::Sender<StateSnapshot>,
    pub(crate) wake: Notify,
    pub(crate) last_dispatch: Mutex<Option<Instant>>,
}

impl Monitor {
    /// Build a monitor around the persisted document in `backend`.
    pub fn new(
        settings: MonitorSettings,
        balances: Arc<dyn BalanceSource>,
        backend: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, MonitorError> {
        let store = Store::new(backend.load()?);
        let collections = store.collections();
        log::info!(
            "📂 Loaded {} collection(s) with {} address(es)",
            collections.len(),
            collections.values().map(Collection::address_count).sum::<usize>()
        );

        let (events, _) = broadcast::channel(64);

        Ok(Self {
            state: Mutex::new(MonitorState {
                store,
                ..MonitorState::default()
            }),
            settings,
            balances,
            backend,
            notifications: NotificationDispatcher::new(notifier),
            events,
            wake: Notify::new(),
            last_dispatch: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Persist and broadcast. A failed write is logged and returned; the
    /// broadcast happens either way.
    pub(crate) fn commit(&self, state: &MonitorState) -> Result<(), StorageError> {
        let saved = self.backend.save(state.store.collections());
        if let Err(e) = &saved {
            log::error!("Failed to persist state: {}", e);
        }
        // No receivers is not an error
        let _ = self.events.send(state.snapshot());
        saved
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn status(&self) -> SystemStatus {
        self.state.lock().await.status.clone()
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn record(&self, item: &AddressRef) -> Result<AddressRecord, MonitorError> {
        self.state.lock().await.store.record(item).cloned()
    }

    pub async fn source(&self, collection: &str, kind: SourceKind, name: &str) -> Result<Source, MonitorError> {
        self.state.lock().await.store.source(collection, kind, name).cloned()
    }

    /// Everything, or just one collection.
    pub async fn export(&self, collection: Option<&str>) -> Result<CollectionMap, MonitorError> {
        let state = self.state.lock().await;
        match collection {
            Some(name) => Ok(CollectionMap::from([(name.to_string(), state.store.collection(name)?.clone())])),
            None => Ok(state.store.collections().clone()),
        }
    }

    /// Merge imported collections, replacing any with the same name, and
    /// queue all of their addresses.
    pub async fn import(&self, collections: CollectionMap) -> Result<StateSnapshot, MonitorError> {
        let names: Vec<String> = collections.keys().cloned().collect();
        let snapshot = {
            let mut state = self.state.lock().await;
            for (name, collection) in collections {
                state.drop_queued(|item| item.collection == name);
                if state.store.insert_collection(&name, collection).is_some() {
                    log::info!("📥 Replaced collection '{}'", name);
                } else {
                    log::info!("📥 Imported collection '{}'", name);
                }
                state.enqueue(&Selector::Collection { collection: name })?;
            }
            self.commit(&state)?;
            state.snapshot()
        };
        for name in &names {
            self.notifications.forget_collection(name).await;
        }
        self.wake.notify_one();
        Ok(snapshot)
    }

    pub async fn add_collection(&self, name: &str) -> Result<StateSnapshot, MonitorError> {
        let mut state = self.state.lock().await;
        state.store.add_collection(name)?;
        self.commit(&state)?;
        log::info!("Created collection '{}'", name);
        Ok(state.snapshot())
    }

    /// Cascade-delete a collection with all of its addresses and sources.
    pub async fn delete_collection(&self, name: &str) -> Result<(), MonitorError> {
        {
            let mut state = self.state.lock().await;
            state.store.remove_collection(name)?;
            state.drop_queued(|item| item.collection == name);
            self.commit(&state)?;
        }
        self.notifications.forget_collection(name).await;
        log::info!("🗑️  Deleted collection '{}'", name);
        Ok(())
    }

    pub async fn add_address(&self, collection: &str, request: NewAddress) -> Result<AddressRecord, MonitorError> {
        let address = request.address.trim().to_string();
        address
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| MonitorError::InvalidInput(format!("invalid address {}: {}", address, e)))?;

        let mut record = AddressRecord::new(
            address.clone(),
            request.name.unwrap_or_else(|| address.clone()),
            request.monitor,
        );
        record.expect = request.expect;
        record.track_websocket = request.track_websocket;

        let record = {
            let mut state = self.state.lock().await;
            let item = state.store.add_address(collection, record)?;
            state.enqueue(&Selector::Address(item.clone()))?;
            self.commit(&state)?;
            state.store.record(&item)?.clone()
        };
        self.wake.notify_one();
        log::info!("Watching {} in '{}'", address, collection);
        Ok(record)
    }

    /// Edit any record, plain or derived.
    pub async fn update_address(&self, item: &AddressRef, update: AddressUpdate) -> Result<AddressRecord, MonitorError> {
        let expect_changed = update.expect.is_some();
        let record = {
            let mut state = self.state.lock().await;
            let record = state.store.record_mut(item)?;
            if let Some(name) = update.name {
                record.name = name;
            }
            if let Some(monitor) = update.monitor {
                record.monitor = monitor;
                detector::clear_auto_accepted(record);
            }
            if let Some(expect) = update.expect {
                record.expect = expect;
                if let Some(actual) = record.actual {
                    for field in Field::ALL {
                        if actual.get(field) == expect.get(field) {
                            record.alerted.set(field, false);
                        }
                    }
                }
            }
            if let Some(track) = update.track_websocket {
                record.track_websocket = track;
            }
            let record = record.clone();
            self.commit(&state)?;
            record
        };
        if expect_changed {
            self.notifications.forget_address(&item.collection, &item.address).await;
        }
        Ok(record)
    }

    pub async fn delete_address(&self, collection: &str, address: &str) -> Result<(), MonitorError> {
        {
            let mut state = self.state.lock().await;
            state.store.remove_address(collection, address)?;
            state.drop_queued(|item| item.collection == collection && item.source().is_none() && item.address == address);
            self.commit(&state)?;
        }
        self.notifications.forget_address(collection, address).await;
        Ok(())
    }

    /// Add a source and derive its initial batch. A derivation error leaves
    /// the store untouched.
    pub async fn add_source(&self, collection: &str, kind: SourceKind, spec: SourceSpec) -> Result<Source, MonitorError> {
        let mut source = spec.into_source(kind)?;
        source.addresses = gap::initial_records(&source)?;
        let name = source.name.clone();

        let stored = {
            let mut state = self.state.lock().await;
            state.store.add_source(collection, kind, source)?;
            state.enqueue(&Selector::Source {
                collection: collection.to_string(),
                kind,
                name: name.clone(),
            })?;
            self.commit(&state)?;
            state.store.source(collection, kind, &name)?.clone()
        };
        self.wake.notify_one();
        log::info!(
            "🔑 Added {} '{}' to '{}' with {} address(es)",
            kind.label(),
            name,
            collection,
            stored.addresses.len()
        );
        Ok(stored)
    }

    /// Replace a source's settings. New derivation inputs re-derive the
    /// initial batch from scratch; otherwise the existing addresses are kept
    /// and take the new policy.
    pub async fn update_source(
        &self,
        collection: &str,
        kind: SourceKind,
        name: &str,
        spec: SourceSpec,
    ) -> Result<Source, MonitorError> {
        let mut source = spec.into_source(kind)?;
        let new_name = source.name.clone();

        let (stored, rederived) = {
            let mut state = self.state.lock().await;
            let current = state.store.source(collection, kind, name)?;
            let rederived = current.derivation_differs(&source);
            if rederived {
                source.addresses = gap::initial_records(&source)?;
            } else {
                source.addresses = current.addresses.clone();
                for record in source.addresses.iter_mut() {
                    record.monitor = source.monitor;
                    detector::clear_auto_accepted(record);
                }
            }

            state.store.replace_source(collection, kind, name, source)?;
            let selector = Selector::Source {
                collection: collection.to_string(),
                kind,
                name: new_name.clone(),
            };
            if rederived || new_name != name {
                // Queue entries still point at the old name or old addresses
                state.drop_queued(|item| item.collection == collection && item.source() == Some((kind, name)));
                for record_ref in state.store.select(&selector)? {
                    if let Ok(record) = state.store.record_mut(&record_ref) {
                        record.queued = false;
                    }
                }
                state.enqueue(&selector)?;
            } else {
                state.maintain_gap(collection, kind, &new_name);
            }
            self.commit(&state)?;
            (state.store.source(collection, kind, &new_name)?.clone(), rederived)
        };

        self.wake.notify_one();
        if rederived {
            log::info!("🔑 Re-derived {} '{}' in '{}'", kind.label(), new_name, collection);
        }
        Ok(stored)
    }

    pub async fn delete_source(&self, collection: &str, kind: SourceKind, name: &str) -> Result<(), MonitorError> {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.store.remove_source(collection, kind, name)?;
            state.drop_queued(|item| item.collection == collection && item.source() == Some((kind, name)));
            self.commit(&state)?;
            removed
        };
        for record in &removed.addresses {
            self.notifications.forget_address(collection, &record.address).await;
        }
        log::info!("🗑️  Deleted {} '{}' from '{}'", kind.label(), name, collection);
        Ok(())
    }

    /// Queue the selected addresses for a fetch. Returns how many were added.
    pub async fn refresh(&self, selector: &Selector) -> Result<usize, MonitorError> {
        let added = {
            let mut state = self.state.lock().await;
            let added = state.enqueue(selector)?;
            if added > 0 {
                self.commit(&state)?;
            }
            added
        };
        if added > 0 {
            log::debug!("Queued {} address(es)", added);
            self.wake.notify_one();
        }
        Ok(added)
    }

    /// Operator acknowledgment: expectation becomes the last observation.
    pub async fn accept(&self, item: &AddressRef) -> Result<AddressRecord, MonitorError> {
        let record = {
            let mut state = self.state.lock().await;
            let record = state.store.record_mut(item)?;
            detector::acknowledge(record);
            let record = record.clone();
            self.commit(&state)?;
            record
        };
        self.notifications.forget_address(&item.collection, &item.address).await;
        log::info!("✅ Accepted current balances of {}", item.address);
        Ok(record)
    }
}

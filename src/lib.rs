//! Balance Monitor: watch Bitcoin addresses and reconcile their balances
//!
//! Addresses are given directly or derived from extended public keys and
//! output descriptors. Their cumulative funded/spent totals are polled from
//! an Esplora API and compared against an operator-declared expectation;
//! unexpected changes raise alerts, auto-accepted fields silently move the
//! expectation along.
//!
//! # Architecture
//!
//! - **keys**: extended key normalization, descriptor parsing, derivation
//! - **monitor**: store, paced fetch queue, change detection, gap limit
//! - **bitcoin**: Esplora balance client
//! - **notify**: de-duplicated alert delivery (webhook or log)
//! - **storage**: persisted collection document
//! - **api**: axum control API
//!
//! # Example
//!
//! ```ignore
//! use balance_monitor::{EsploraClient, JsonFileStore, LogNotifier, Monitor, MonitorConfig};
//!
//! let config = MonitorConfig::from_env();
//! let monitor = Arc::new(Monitor::new(
//!     (&config).into(),
//!     Arc::new(EsploraClient::from_config(&config)?),
//!     Arc::new(JsonFileStore::new(&config.data_file)),
//!     Arc::new(LogNotifier),
//! )?);
//! let scheduler = monitor.spawn_scheduler();
//! ```

pub mod api;
pub mod bitcoin;
pub mod config;
pub mod error;
pub mod keys;
pub mod monitor;
pub mod notify;
pub mod storage;

pub use crate::bitcoin::{BalanceSource, EsploraClient};
pub use config::MonitorConfig;
pub use error::{DeriveError, FetchError, MonitorError, NotifyError, StorageError};
pub use keys::{AddressDeriver, DerivedAddress, ScriptKind};
pub use monitor::{
    AddressRef, Monitor, MonitorSettings, RoundReport, SchedulerHandle, Selector, SourceKind, SourceSpec,
    StateSnapshot, TrackingEvent,
};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use storage::{JsonFileStore, MemoryStore, StateStore};

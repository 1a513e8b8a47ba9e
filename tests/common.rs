//! Common test utilities for balance monitor integration tests
//!
//! This module provides shared test infrastructure including:
//! - An in-process Esplora mock with scripted rate limiting
//! - An in-memory balance source that records dispatch times
//! - A notifier that records delivered alerts
//! - Deterministic extended keys

#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use balance_monitor::bitcoin::{AddressStats, BalanceSource, TxoStats};
use balance_monitor::error::{FetchError, NotifyError};
use balance_monitor::keys::normalize::{encode_with_prefix, prefix_for_name};
use balance_monitor::keys::AddressDeriver;
use balance_monitor::monitor::{Monitor, MonitorSettings};
use balance_monitor::notify::Notifier;
use balance_monitor::storage::{Balances, MemoryStore};
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::Network;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Keys
// ============================================================================

/// Master xpub from a fixed seed byte
pub fn xpub_from_seed(seed: u8) -> Xpub {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(Network::Bitcoin, &[seed; 32]).unwrap();
    Xpub::from_priv(&secp, &master)
}

/// Same key material as `xpub_from_seed`, on the test network (tpub)
pub fn tpub_from_seed(seed: u8) -> Xpub {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(Network::Testnet, &[seed; 32]).unwrap();
    Xpub::from_priv(&secp, &master)
}

/// Re-encode a canonical xpub/tpub under another SLIP-132 prefix
pub fn with_prefix(key: &Xpub, prefix: &str) -> String {
    let prefix = prefix_for_name(prefix).unwrap();
    encode_with_prefix(&key.to_string(), prefix).unwrap()
}

/// Account-level xpub for a BIP39 mnemonic at a hardened path
pub fn account_xpub(mnemonic: &str, path: &str) -> Xpub {
    let secp = Secp256k1::new();
    let seed = bip39::Mnemonic::parse(mnemonic).unwrap().to_seed("");
    let master = Xpriv::new_master(Network::Bitcoin, &seed).unwrap();
    let account = master
        .derive_priv(&secp, &DerivationPath::from_str(path).unwrap())
        .unwrap();
    Xpub::from_priv(&secp, &account)
}

/// `count` distinct mainnet addresses for plain-address tests
pub fn sample_addresses(count: u32) -> Vec<String> {
    let deriver = AddressDeriver::from_descriptor(&format!("wpkh({}/7/*)", xpub_from_seed(42))).unwrap();
    deriver
        .derive(0, count, 0)
        .unwrap()
        .into_iter()
        .map(|d| d.address.to_string())
        .collect()
}

pub const ABANDON_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

// ============================================================================
// Esplora mock
// ============================================================================

#[derive(Default)]
pub struct MockEsploraState {
    balances: Mutex<HashMap<String, Balances>>,
    /// Remaining 429 responses per address
    rate_limits: Mutex<HashMap<String, u32>>,
    /// Addresses answered with a 500
    broken: Mutex<Vec<String>>,
    requests: Mutex<Vec<String>>,
}

/// Esplora `GET /address/:address` served from memory on a random port
pub struct MockEsplora {
    pub url: String,
    state: Arc<MockEsploraState>,
    task: JoinHandle<()>,
}

impl MockEsplora {
    pub async fn start() -> Self {
        let state = Arc::new(MockEsploraState::default());
        let app = Router::new()
            .route("/address/:address", get(address_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        log::info!("🧪 Esplora mock listening on {}", url);

        Self { url, state, task }
    }

    pub fn set_balance(&self, address: &str, balances: Balances) {
        self.state
            .balances
            .lock()
            .unwrap()
            .insert(address.to_string(), balances);
    }

    /// Answer the next `times` requests for `address` with HTTP 429
    pub fn rate_limit(&self, address: &str, times: u32) {
        self.state
            .rate_limits
            .lock()
            .unwrap()
            .insert(address.to_string(), times);
    }

    pub fn break_address(&self, address: &str) {
        self.state.broken.lock().unwrap().push(address.to_string());
    }

    pub fn request_count(&self, address: &str) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.as_str() == address)
            .count()
    }
}

impl Drop for MockEsplora {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn address_handler(State(state): State<Arc<MockEsploraState>>, Path(address): Path<String>) -> Response {
    state.requests.lock().unwrap().push(address.clone());

    {
        let mut limits = state.rate_limits.lock().unwrap();
        if let Some(remaining) = limits.get_mut(&address) {
            if *remaining > 0 {
                *remaining -= 1;
                return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
            }
        }
    }

    if state.broken.lock().unwrap().contains(&address) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream unavailable").into_response();
    }

    let balances = state
        .balances
        .lock()
        .unwrap()
        .get(&address)
        .copied()
        .unwrap_or_default();

    Json(AddressStats {
        address: Some(address),
        chain_stats: TxoStats {
            funded_txo_sum: balances.chain_in,
            spent_txo_sum: balances.chain_out,
            ..TxoStats::default()
        },
        mempool_stats: TxoStats {
            funded_txo_sum: balances.mempool_in,
            spent_txo_sum: balances.mempool_out,
            ..TxoStats::default()
        },
    })
    .into_response()
}

// ============================================================================
// In-memory balance source
// ============================================================================

/// Balance source answering from a map, recording when each fetch started
#[derive(Default)]
pub struct ScriptedSource {
    balances: Mutex<HashMap<String, Balances>>,
    failures: Mutex<HashMap<String, FetchError>>,
    calls: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl ScriptedSource {
    pub fn set_balance(&self, address: &str, balances: Balances) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), balances);
    }

    pub fn fail_with(&self, address: &str, error: FetchError) {
        self.failures
            .lock()
            .unwrap()
            .insert(address.to_string(), error);
    }

    pub fn clear_failure(&self, address: &str) {
        self.failures.lock().unwrap().remove(address);
    }

    pub fn calls(&self) -> Vec<(String, tokio::time::Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, address: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .count()
    }
}

impl BalanceSource for ScriptedSource {
    fn fetch<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Balances, FetchError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((address.to_string(), tokio::time::Instant::now()));
            if let Some(error) = self.failures.lock().unwrap().get(address) {
                return Err(error.clone());
            }
            Ok(self
                .balances
                .lock()
                .unwrap()
                .get(address)
                .copied()
                .unwrap_or_default())
        })
    }
}

// ============================================================================
// Notifier
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl Notifier for RecordingNotifier {
    fn deliver<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            self.messages.lock().unwrap().push(text.to_string());
            Ok(())
        })
    }
}

// ============================================================================
// Monitor fixtures
// ============================================================================

pub struct TestMonitor {
    pub monitor: Arc<Monitor>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn test_monitor(source: Arc<dyn BalanceSource>, api_delay: Duration, parallel_limit: usize) -> TestMonitor {
    init_logger();
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = Monitor::new(
        MonitorSettings {
            api_delay,
            parallel_limit,
        },
        source,
        store.clone(),
        notifier.clone(),
    )
    .unwrap();

    TestMonitor {
        monitor: Arc::new(monitor),
        store,
        notifier,
    }
}

/// Run rounds until the queue is empty
pub async fn drain(monitor: &Monitor) -> usize {
    let mut rounds = 0;
    while monitor.queue_len().await > 0 {
        monitor.run_round().await;
        rounds += 1;
        assert!(rounds < 1000, "queue never drained");
    }
    rounds
}

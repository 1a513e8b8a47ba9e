//! Balance API access

pub mod esplora;

use futures::future::BoxFuture;

use crate::error::FetchError;
use crate::storage::Balances;

pub use esplora::{AddressStats, EsploraClient, TxoStats};

/// Anything that can report cumulative funded/spent totals for an address.
pub trait BalanceSource: Send + Sync {
    fn fetch<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Balances, FetchError>>;
}

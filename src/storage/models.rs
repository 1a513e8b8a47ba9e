//! Data models for the persisted collection document
//!
//! Every field except an address's `address` and `name` defaults when it is
//! missing, so documents written by older versions still load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// All collections, keyed by collection name.
pub type CollectionMap = BTreeMap<String, Collection>;

/// One of the four tracked balance flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    ChainIn,
    ChainOut,
    MempoolIn,
    MempoolOut,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::ChainIn,
        Field::ChainOut,
        Field::MempoolIn,
        Field::MempoolOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::ChainIn => "chain_in",
            Field::ChainOut => "chain_out",
            Field::MempoolIn => "mempool_in",
            Field::MempoolOut => "mempool_out",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative funded (`_in`) and spent (`_out`) satoshi totals of an address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Balances {
    pub chain_in: u64,
    pub chain_out: u64,
    pub mempool_in: u64,
    pub mempool_out: u64,
}

impl Balances {
    pub fn get(&self, field: Field) -> u64 {
        match field {
            Field::ChainIn => self.chain_in,
            Field::ChainOut => self.chain_out,
            Field::MempoolIn => self.mempool_in,
            Field::MempoolOut => self.mempool_out,
        }
    }

    pub fn set(&mut self, field: Field, value: u64) {
        match field {
            Field::ChainIn => self.chain_in = value,
            Field::ChainOut => self.chain_out = value,
            Field::MempoolIn => self.mempool_in = value,
            Field::MempoolOut => self.mempool_out = value,
        }
    }

    /// True once anything was ever received or spent, confirmed or not.
    pub fn has_activity(&self) -> bool {
        Field::ALL.iter().any(|field| self.get(*field) > 0)
    }

    /// Confirmed balance (funded minus spent)
    pub fn confirmed_balance(&self) -> u64 {
        self.chain_in.saturating_sub(self.chain_out)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    #[default]
    Alert,
    AutoAccept,
}

/// Per-field alert/auto-accept policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorPolicy {
    pub chain_in: Policy,
    pub chain_out: Policy,
    pub mempool_in: Policy,
    pub mempool_out: Policy,
}

impl MonitorPolicy {
    pub fn uniform(policy: Policy) -> Self {
        Self {
            chain_in: policy,
            chain_out: policy,
            mempool_in: policy,
            mempool_out: policy,
        }
    }

    pub fn get(&self, field: Field) -> Policy {
        match field {
            Field::ChainIn => self.chain_in,
            Field::ChainOut => self.chain_out,
            Field::MempoolIn => self.mempool_in,
            Field::MempoolOut => self.mempool_out,
        }
    }

    pub fn set(&mut self, field: Field, policy: Policy) {
        match field {
            Field::ChainIn => self.chain_in = policy,
            Field::ChainOut => self.chain_out = policy,
            Field::MempoolIn => self.mempool_in = policy,
            Field::MempoolOut => self.mempool_out = policy,
        }
    }
}

/// Outstanding, unacknowledged alerts per field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertFlags {
    pub chain_in: bool,
    pub chain_out: bool,
    pub mempool_in: bool,
    pub mempool_out: bool,
}

impl AlertFlags {
    pub fn get(&self, field: Field) -> bool {
        match field {
            Field::ChainIn => self.chain_in,
            Field::ChainOut => self.chain_out,
            Field::MempoolIn => self.mempool_in,
            Field::MempoolOut => self.mempool_out,
        }
    }

    pub fn set(&mut self, field: Field, alerted: bool) {
        match field {
            Field::ChainIn => self.chain_in = alerted,
            Field::ChainOut => self.chain_out = alerted,
            Field::MempoolIn => self.mempool_in = alerted,
            Field::MempoolOut => self.mempool_out = alerted,
        }
    }

    pub fn any(&self) -> bool {
        Field::ALL.iter().any(|field| self.get(*field))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub address: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default)]
    pub expect: Balances,
    #[serde(default)]
    pub actual: Option<Balances>,
    #[serde(default)]
    pub monitor: MonitorPolicy,
    #[serde(default)]
    pub alerted: AlertFlags,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub track_websocket: bool,
}

impl AddressRecord {
    pub fn new(address: impl Into<String>, name: impl Into<String>, monitor: MonitorPolicy) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            index: None,
            expect: Balances::default(),
            actual: None,
            monitor,
            alerted: AlertFlags::default(),
            error: false,
            error_message: None,
            queued: false,
            track_websocket: false,
        }
    }

    pub fn derived(address: impl Into<String>, name: impl Into<String>, index: u32, monitor: MonitorPolicy) -> Self {
        Self {
            index: Some(index),
            ..Self::new(address, name, monitor)
        }
    }

    pub fn has_activity(&self) -> bool {
        self.actual.map(|actual| actual.has_activity()).unwrap_or(false)
    }
}

fn default_gap_limit() -> u32 {
    20
}

fn default_initial_addresses() -> u32 {
    10
}

/// An extended key or descriptor together with the addresses derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_initial_addresses")]
    pub initial_addresses: u32,
    #[serde(default)]
    pub monitor: MonitorPolicy,
    #[serde(default)]
    pub addresses: Vec<AddressRecord>,
}

impl Source {
    /// Extended-key source with default gap settings and no addresses yet.
    pub fn extended_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::empty(name)
        }
    }

    /// Descriptor source with default gap settings and no addresses yet.
    pub fn descriptor(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: Some(descriptor.into()),
            ..Self::empty(name)
        }
    }

    fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            descriptor: None,
            derivation_path: None,
            gap_limit: default_gap_limit(),
            skip: 0,
            initial_addresses: default_initial_addresses(),
            monitor: MonitorPolicy::default(),
            addresses: Vec::new(),
        }
    }

    /// Next unused logical index.
    pub fn next_index(&self) -> u32 {
        self.addresses
            .iter()
            .filter_map(|record| record.index)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }

    /// True when the derivation inputs of `other` differ from ours.
    pub fn derivation_differs(&self, other: &Source) -> bool {
        self.key != other.key
            || self.descriptor != other.descriptor
            || self.derivation_path != other.derivation_path
            || self.skip != other.skip
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(default)]
    pub addresses: Vec<AddressRecord>,
    #[serde(default)]
    pub extended_keys: Vec<Source>,
    #[serde(default)]
    pub descriptors: Vec<Source>,
}

impl Collection {
    pub fn address_count(&self) -> usize {
        self.addresses.len()
            + self
                .extended_keys
                .iter()
                .chain(self.descriptors.iter())
                .map(|source| source.addresses.len())
                .sum::<usize>()
    }
}

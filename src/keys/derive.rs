use bitcoin::bip32::ChildNumber;
use bitcoin::key::CompressedPublicKey;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, ScriptBuf};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, Network, PublicKey};

use super::descriptor::{parse_descriptor, KeyExpr, KeySource, Leaf, Wrapper};
use super::normalize::{parse_path, split_key_path, PathStep, ScriptKind};
use crate::error::DeriveError;
use crate::storage::Source;

/// Most addresses one `derive` call will produce. Also bounds a source's
/// initial batch and gap limit.
pub const MAX_DERIVE_COUNT: u32 = 10_000;

/// A multisig leaf ready for script construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multisig {
    pub sorted: bool,
    pub threshold: usize,
    pub keys: Vec<KeyExpr>,
}

/// Every payment shape the deriver can build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptTemplate {
    Pkh(KeyExpr),
    Wpkh(KeyExpr),
    ShWpkh(KeyExpr),
    Sh(Multisig),
    Wsh(Multisig),
    ShWsh(Multisig),
}

impl ScriptTemplate {
    fn single(kind: ScriptKind, key: KeyExpr) -> Self {
        match kind {
            ScriptKind::Legacy => ScriptTemplate::Pkh(key),
            ScriptKind::P2shSegwit => ScriptTemplate::ShWpkh(key),
            ScriptKind::NativeSegwit => ScriptTemplate::Wpkh(key),
        }
    }

    fn keys(&self) -> &[KeyExpr] {
        match self {
            ScriptTemplate::Pkh(key) | ScriptTemplate::Wpkh(key) | ScriptTemplate::ShWpkh(key) => {
                std::slice::from_ref(key)
            }
            ScriptTemplate::Sh(multi) | ScriptTemplate::Wsh(multi) | ScriptTemplate::ShWsh(multi) => &multi.keys,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    /// Logical position inside the source (not including `skip`)
    pub index: u32,
    pub address: Address,
}

/// Derives addresses from one extended key or descriptor.
///
/// Construction does all parsing and validation, so `derive` only does the
/// per-index EC work.
pub struct AddressDeriver {
    template: ScriptTemplate,
    network: Network,
    secp: Secp256k1<VerifyOnly>,
}

impl AddressDeriver {
    /// Extended key, optionally carrying a `/path` suffix, plus an optional
    /// extra derivation path. The address type follows the key prefix.
    pub fn from_extended_key(key: &str, derivation_path: Option<&str>) -> Result<Self, DeriveError> {
        let (normalized, mut path) = split_key_path(key, false)?;
        if let Some(extra) = derivation_path {
            path.extend(parse_path(extra, false)?);
        }
        path.push(PathStep::Wildcard);

        let kind = normalized.script_kind();
        let key = KeyExpr {
            origin: None,
            source: KeySource::Extended(normalized),
            path,
        };
        Self::new(ScriptTemplate::single(kind, key))
    }

    /// Descriptor string. A bare extended key is accepted and wrapped by its
    /// prefix, with `/*` implied when no wildcard is present.
    pub fn from_descriptor(descriptor: &str) -> Result<Self, DeriveError> {
        let parsed = parse_descriptor(descriptor)?;
        let template = match (parsed.wrappers.as_slice(), parsed.leaf) {
            ([], Leaf::Key(mut key)) => {
                let kind = match &key.source {
                    KeySource::Extended(normalized) => normalized.script_kind(),
                    KeySource::Single(_) => {
                        return Err(DeriveError::UnsupportedDescriptorType(
                            "bare public key without a script wrapper".to_string(),
                        ))
                    }
                };
                if !key.has_wildcard() {
                    key.path.push(PathStep::Wildcard);
                }
                ScriptTemplate::single(kind, key)
            }
            ([Wrapper::Pkh], Leaf::Key(key)) => ScriptTemplate::Pkh(key),
            ([Wrapper::Wpkh], Leaf::Key(key)) => ScriptTemplate::Wpkh(key),
            ([Wrapper::Sh, Wrapper::Wpkh], Leaf::Key(key)) => ScriptTemplate::ShWpkh(key),
            ([Wrapper::Sh], Leaf::Multi { sorted, threshold, keys }) => {
                ScriptTemplate::Sh(Multisig { sorted, threshold, keys })
            }
            ([Wrapper::Wsh], Leaf::Multi { sorted, threshold, keys }) => {
                ScriptTemplate::Wsh(Multisig { sorted, threshold, keys })
            }
            ([Wrapper::Sh, Wrapper::Wsh], Leaf::Multi { sorted, threshold, keys }) => {
                ScriptTemplate::ShWsh(Multisig { sorted, threshold, keys })
            }
            (wrappers, leaf) => {
                let mut shape: String = wrappers.iter().map(|w| format!("{}(", w)).collect();
                shape.push_str(match leaf {
                    Leaf::Key(_) => "KEY",
                    Leaf::Multi { sorted: true, .. } => "sortedmulti(...)",
                    Leaf::Multi { sorted: false, .. } => "multi(...)",
                });
                shape.push_str(&")".repeat(wrappers.len()));
                return Err(DeriveError::UnsupportedDescriptorType(shape));
            }
        };
        Self::new(template)
    }

    /// Pick the right constructor for a stored source.
    pub fn from_source(source: &Source) -> Result<Self, DeriveError> {
        match (&source.descriptor, &source.key) {
            (Some(descriptor), _) => Self::from_descriptor(descriptor),
            (None, Some(key)) => Self::from_extended_key(key, source.derivation_path.as_deref()),
            (None, None) => Err(DeriveError::InvalidKeyFormat(format!(
                "source '{}' has neither key nor descriptor",
                source.name
            ))),
        }
    }

    fn new(template: ScriptTemplate) -> Result<Self, DeriveError> {
        let mut networks = template.keys().iter().filter_map(|key| match &key.source {
            KeySource::Extended(normalized) => Some(normalized.network()),
            KeySource::Single(_) => None,
        });
        let network = networks.next().unwrap_or(Network::Bitcoin);
        if networks.any(|other| other != network) {
            return Err(DeriveError::InvalidKeyFormat(
                "keys from different networks in one descriptor".to_string(),
            ));
        }

        Ok(Self {
            template,
            network,
            secp: Secp256k1::verification_only(),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// False when no key carries a `*` step, so every index maps to the same
    /// address.
    pub fn is_ranged(&self) -> bool {
        self.template.keys().iter().any(KeyExpr::has_wildcard)
    }

    /// Derive `count` addresses at logical indices `start..start + count`,
    /// using child number `index + skip` for each. All or nothing.
    pub fn derive(&self, start: u32, count: u32, skip: u32) -> Result<Vec<DerivedAddress>, DeriveError> {
        if count > MAX_DERIVE_COUNT {
            return Err(DeriveError::DerivationFailed(format!(
                "{} addresses requested, at most {} per batch",
                count, MAX_DERIVE_COUNT
            )));
        }
        let mut addresses = Vec::with_capacity(count as usize);

        for i in 0..count {
            let index = start
                .checked_add(i)
                .ok_or_else(|| DeriveError::DerivationFailed("index overflow".to_string()))?;
            let child = index
                .checked_add(skip)
                .ok_or_else(|| DeriveError::DerivationFailed("index overflow".to_string()))?;
            let address = self.address_at(child)?;
            addresses.push(DerivedAddress { index, address });
        }

        Ok(addresses)
    }

    /// Address for one child number
    pub fn address_at(&self, child: u32) -> Result<Address, DeriveError> {
        let address = match &self.template {
            ScriptTemplate::Pkh(key) => Address::p2pkh(self.derive_key(key, child)?.pubkey_hash(), self.network),
            ScriptTemplate::Wpkh(key) => Address::p2wpkh(&self.derive_key(key, child)?, self.network),
            ScriptTemplate::ShWpkh(key) => Address::p2shwpkh(&self.derive_key(key, child)?, self.network),
            ScriptTemplate::Sh(multi) => Address::p2sh(&self.multisig_script(multi, child)?, self.network)
                .map_err(|e| DeriveError::DerivationFailed(e.to_string()))?,
            ScriptTemplate::Wsh(multi) => Address::p2wsh(&self.multisig_script(multi, child)?, self.network),
            ScriptTemplate::ShWsh(multi) => Address::p2shwsh(&self.multisig_script(multi, child)?, self.network),
        };
        Ok(address)
    }

    /// Bare multisig script at a child number, `None` for single-key templates.
    pub fn witness_script_at(&self, child: u32) -> Result<Option<ScriptBuf>, DeriveError> {
        match &self.template {
            ScriptTemplate::Sh(multi) | ScriptTemplate::Wsh(multi) | ScriptTemplate::ShWsh(multi) => {
                self.multisig_script(multi, child).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn multisig_script(&self, multi: &Multisig, child: u32) -> Result<ScriptBuf, DeriveError> {
        let mut keys = multi
            .keys
            .iter()
            .map(|key| self.derive_key(key, child).map(PublicKey::from))
            .collect::<Result<Vec<_>, _>>()?;

        // BIP67: lexicographic order of the compressed encodings
        if multi.sorted {
            keys.sort_by_key(|key| key.to_bytes());
        }

        let mut builder = Builder::new().push_int(multi.threshold as i64);
        for key in &keys {
            builder = builder.push_key(key);
        }
        Ok(builder
            .push_int(keys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script())
    }

    fn derive_key(&self, key: &KeyExpr, child: u32) -> Result<CompressedPublicKey, DeriveError> {
        let pubkey = match &key.source {
            KeySource::Single(pk) => *pk,
            KeySource::Extended(normalized) => {
                let path = key
                    .path
                    .iter()
                    .map(|step| match step {
                        PathStep::Normal(index) => ChildNumber::from_normal_idx(*index),
                        PathStep::Wildcard => ChildNumber::from_normal_idx(child),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| DeriveError::DerivationFailed(e.to_string()))?;

                let derived = normalized
                    .xpub
                    .derive_pub(&self.secp, &path)
                    .map_err(|e| DeriveError::DerivationFailed(e.to_string()))?;
                PublicKey::new(derived.public_key)
            }
        };

        CompressedPublicKey::try_from(pubkey).map_err(|e| DeriveError::DerivationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::bip32::{Xpriv, Xpub};

    fn xpub(seed: u8) -> String {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Bitcoin, &[seed; 32]).unwrap();
        Xpub::from_priv(&secp, &master).to_string()
    }

    #[test]
    fn test_skip_offsets_child_not_index() {
        let key = xpub(9);
        let deriver = AddressDeriver::from_extended_key(&key, Some("0")).unwrap();

        let plain = deriver.derive(0, 5, 0).unwrap();
        let skipped = deriver.derive(0, 3, 2).unwrap();

        assert_eq!(skipped.iter().map(|d| d.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(skipped[0].address, plain[2].address);
        assert_eq!(skipped[2].address, plain[4].address);
    }

    #[test]
    fn test_key_suffix_and_derivation_path_compose() {
        let key = xpub(9);
        let from_suffix = AddressDeriver::from_extended_key(&format!("{}/0", key), None).unwrap();
        let from_path = AddressDeriver::from_extended_key(&key, Some("m/0")).unwrap();
        let from_descriptor = AddressDeriver::from_descriptor(&format!("pkh({}/0/*)", key)).unwrap();

        let a = from_suffix.derive(0, 2, 0).unwrap();
        assert_eq!(a, from_path.derive(0, 2, 0).unwrap());
        assert_eq!(a, from_descriptor.derive(0, 2, 0).unwrap());
    }

    #[test]
    fn test_hardened_derivation_path_rejected() {
        let key = xpub(9);
        assert!(matches!(
            AddressDeriver::from_extended_key(&key, Some("m/84'/0")),
            Err(DeriveError::HardenedDerivationUnsupported(_))
        ));
    }

    #[test]
    fn test_unsupported_combinations() {
        let key = xpub(9);
        for descriptor in [
            format!("wsh(pkh({}/*))", key),
            format!("pkh(multi(1,{}/*))", key),
            format!("multi(1,{}/*)", key),
            format!("wsh(wpkh({}/*))", key),
            format!("sh(sh(multi(1,{}/*)))", key),
        ] {
            assert!(
                matches!(
                    AddressDeriver::from_descriptor(&descriptor),
                    Err(DeriveError::UnsupportedDescriptorType(_))
                ),
                "{} should be unsupported",
                descriptor
            );
        }
    }

    #[test]
    fn test_mixed_networks_rejected() {
        let secp = Secp256k1::new();
        let test_master = Xpriv::new_master(Network::Testnet, &[1u8; 32]).unwrap();
        let tpub = Xpub::from_priv(&secp, &test_master).to_string();
        let descriptor = format!("wsh(multi(1,{}/*,{}/*))", xpub(2), tpub);
        assert!(matches!(
            AddressDeriver::from_descriptor(&descriptor),
            Err(DeriveError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn test_testnet_key_renders_testnet_addresses() {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Testnet, &[1u8; 32]).unwrap();
        let tpub = Xpub::from_priv(&secp, &master).to_string();
        let deriver = AddressDeriver::from_descriptor(&format!("wpkh({}/0/*)", tpub)).unwrap();
        let address = deriver.address_at(0).unwrap().to_string();
        assert!(address.starts_with("tb1q"), "{}", address);
    }

    #[test]
    fn test_witness_script_only_for_multisig() {
        let key = xpub(3);
        let single = AddressDeriver::from_descriptor(&format!("wpkh({}/*)", key)).unwrap();
        assert!(single.witness_script_at(0).unwrap().is_none());

        let multi = AddressDeriver::from_descriptor(&format!("wsh(multi(1,{}/*))", key)).unwrap();
        let script = multi.witness_script_at(0).unwrap().unwrap();
        // OP_1 <33-byte key> OP_1 OP_CHECKMULTISIG
        assert_eq!(script.len(), 1 + 34 + 1 + 1);
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let deriver = AddressDeriver::from_descriptor(&format!("wpkh({}/0/*)", xpub(4))).unwrap();
        assert!(matches!(
            deriver.derive(0, MAX_DERIVE_COUNT + 1, 0),
            Err(DeriveError::DerivationFailed(_))
        ));
        assert!(matches!(
            deriver.derive(0, u32::MAX, 0),
            Err(DeriveError::DerivationFailed(_))
        ));
        assert_eq!(deriver.derive(0, 3, 0).unwrap().len(), 3);
    }

    #[test]
    fn test_fixed_path_is_not_ranged() {
        let key = xpub(4);
        assert!(AddressDeriver::from_descriptor(&format!("wpkh({}/0/*)", key)).unwrap().is_ranged());
        assert!(AddressDeriver::from_extended_key(&key, None).unwrap().is_ranged());
        // Bare keys get an implied wildcard
        assert!(AddressDeriver::from_descriptor(&key).unwrap().is_ranged());

        let fixed = AddressDeriver::from_descriptor(&format!("wpkh({}/0/5)", key)).unwrap();
        assert!(!fixed.is_ranged());
        let derived = fixed.derive(0, 2, 0).unwrap();
        assert_eq!(derived[0].address, derived[1].address);

        let mixed = AddressDeriver::from_descriptor(&format!("wsh(multi(1,{}/0/5,{}/*))", key, xpub(5))).unwrap();
        assert!(mixed.is_ranged());
    }
}

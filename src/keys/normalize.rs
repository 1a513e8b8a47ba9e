//! Extended key normalization
//!
//! SLIP-132 style prefixes (`ypub`, `zpub`, `Vpub`, ...) only differ from
//! `xpub`/`tpub` in their version bytes. Keys are re-encoded with the
//! canonical version so the bip32 decoder accepts them, while the prefix
//! family is resolved once into a [`ScriptKind`] and carried alongside.

use bitcoin::base58;
use bitcoin::bip32::Xpub;
use bitcoin::Network;

use crate::error::DeriveError;

const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const TPUB_VERSION: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];

/// Serialized extended key length (version + depth + fingerprint + child + chain code + key)
const EXTENDED_KEY_LEN: usize = 78;

/// Output script family selected by a key prefix or descriptor wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// P2PKH
    Legacy,
    /// P2SH-P2WPKH
    P2shSegwit,
    /// P2WPKH
    NativeSegwit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPrefix {
    pub name: &'static str,
    pub version: [u8; 4],
    pub script_kind: ScriptKind,
    pub mainnet: bool,
}

impl KeyPrefix {
    pub fn network(&self) -> Network {
        if self.mainnet {
            Network::Bitcoin
        } else {
            Network::Testnet
        }
    }

    fn canonical_version(&self) -> [u8; 4] {
        if self.mainnet {
            XPUB_VERSION
        } else {
            TPUB_VERSION
        }
    }
}

pub const PREFIXES: [KeyPrefix; 10] = [
    KeyPrefix { name: "xpub", version: XPUB_VERSION, script_kind: ScriptKind::Legacy, mainnet: true },
    KeyPrefix { name: "ypub", version: [0x04, 0x9d, 0x7c, 0xb2], script_kind: ScriptKind::P2shSegwit, mainnet: true },
    KeyPrefix { name: "zpub", version: [0x04, 0xb2, 0x47, 0x46], script_kind: ScriptKind::NativeSegwit, mainnet: true },
    KeyPrefix { name: "Ypub", version: [0x02, 0x95, 0xb4, 0x3f], script_kind: ScriptKind::P2shSegwit, mainnet: true },
    KeyPrefix { name: "Zpub", version: [0x02, 0xaa, 0x7e, 0xd3], script_kind: ScriptKind::NativeSegwit, mainnet: true },
    KeyPrefix { name: "tpub", version: TPUB_VERSION, script_kind: ScriptKind::Legacy, mainnet: false },
    KeyPrefix { name: "upub", version: [0x04, 0x4a, 0x52, 0x62], script_kind: ScriptKind::P2shSegwit, mainnet: false },
    KeyPrefix { name: "vpub", version: [0x04, 0x5f, 0x1c, 0xf6], script_kind: ScriptKind::NativeSegwit, mainnet: false },
    KeyPrefix { name: "Upub", version: [0x02, 0x42, 0x89, 0xef], script_kind: ScriptKind::P2shSegwit, mainnet: false },
    KeyPrefix { name: "Vpub", version: [0x02, 0x57, 0x54, 0x83], script_kind: ScriptKind::NativeSegwit, mainnet: false },
];

pub fn prefix_for_name(key: &str) -> Option<&'static KeyPrefix> {
    PREFIXES.iter().find(|prefix| key.starts_with(prefix.name))
}

pub fn prefix_for_version(version: &[u8]) -> Option<&'static KeyPrefix> {
    PREFIXES.iter().find(|prefix| prefix.version.as_slice() == version)
}

/// One segment of a non-hardened derivation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStep {
    Normal(u32),
    /// `*`, replaced by the requested index
    Wildcard,
}

/// Parse `0/1/*` style paths. A leading `m` is tolerated, hardened markers
/// (`'`, `h`, `H`) are rejected.
pub fn parse_path(path: &str, allow_wildcard: bool) -> Result<Vec<PathStep>, DeriveError> {
    let trimmed = path.trim().trim_start_matches('/');
    let trimmed = trimmed
        .strip_prefix("m/")
        .or_else(|| if trimmed == "m" { Some("") } else { None })
        .unwrap_or(trimmed);

    let mut steps = Vec::new();
    for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
        if segment.ends_with(['\'', 'h', 'H']) {
            return Err(DeriveError::HardenedDerivationUnsupported(format!(
                "segment '{}' in path '{}'",
                segment, path
            )));
        }
        if segment == "*" {
            if !allow_wildcard {
                return Err(DeriveError::InvalidKeyFormat(format!(
                    "wildcard not allowed in path '{}'",
                    path
                )));
            }
            steps.push(PathStep::Wildcard);
            continue;
        }
        let index: u32 = segment.parse().map_err(|_| {
            DeriveError::InvalidKeyFormat(format!("invalid path segment '{}' in '{}'", segment, path))
        })?;
        if index >= 1 << 31 {
            return Err(DeriveError::HardenedDerivationUnsupported(format!(
                "index {} is in the hardened range",
                index
            )));
        }
        steps.push(PathStep::Normal(index));
    }
    Ok(steps)
}

/// Re-encode an extended key with the canonical `xpub`/`tpub` version bytes,
/// keeping any trailing `/path` suffix verbatim.
pub fn convert_extended_key(raw: &str) -> Result<String, DeriveError> {
    let raw = raw.trim();
    let (key, suffix) = match raw.find('/') {
        Some(pos) => (&raw[..pos], &raw[pos..]),
        None => (raw, ""),
    };
    let (_, payload) = decode_payload(key)?;
    Ok(format!("{}{}", base58::encode_check(&payload), suffix))
}

/// A decoded extended public key plus the facts derived from its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedKey {
    pub xpub: Xpub,
    pub prefix: &'static KeyPrefix,
    /// Canonical `xpub`/`tpub` encoding, without path suffix
    pub canonical: String,
}

impl NormalizedKey {
    pub fn script_kind(&self) -> ScriptKind {
        self.prefix.script_kind
    }

    pub fn network(&self) -> Network {
        self.prefix.network()
    }
}

/// Decode a bare extended key (no path suffix).
pub fn normalize_extended_key(key: &str) -> Result<NormalizedKey, DeriveError> {
    let key = key.trim();
    let (prefix, payload) = decode_payload(key)?;
    let xpub = Xpub::decode(&payload)
        .map_err(|e| DeriveError::InvalidKeyFormat(format!("{}: {}", short(key), e)))?;
    Ok(NormalizedKey {
        xpub,
        prefix,
        canonical: base58::encode_check(&payload),
    })
}

/// Split `key/0/1` into the normalized key and its path steps.
pub fn split_key_path(raw: &str, allow_wildcard: bool) -> Result<(NormalizedKey, Vec<PathStep>), DeriveError> {
    let raw = raw.trim();
    match raw.find('/') {
        Some(pos) => Ok((
            normalize_extended_key(&raw[..pos])?,
            parse_path(&raw[pos + 1..], allow_wildcard)?,
        )),
        None => Ok((normalize_extended_key(raw)?, Vec::new())),
    }
}

/// Returns the prefix and the payload re-versioned to `xpub`/`tpub`.
fn decode_payload(key: &str) -> Result<(&'static KeyPrefix, Vec<u8>), DeriveError> {
    let by_name = prefix_for_name(key)
        .ok_or_else(|| DeriveError::InvalidKeyFormat(format!("unsupported key prefix: {}", short(key))))?;

    let mut payload = base58::decode_check(key)
        .map_err(|e| DeriveError::InvalidKeyFormat(format!("{}: {}", short(key), e)))?;
    if payload.len() != EXTENDED_KEY_LEN {
        return Err(DeriveError::InvalidKeyFormat(format!(
            "{}: expected {} bytes, got {}",
            short(key),
            EXTENDED_KEY_LEN,
            payload.len()
        )));
    }

    let prefix = prefix_for_version(&payload[..4]).ok_or_else(|| {
        DeriveError::InvalidKeyFormat(format!("unknown version bytes {}", hex::encode(&payload[..4])))
    })?;
    if prefix != by_name {
        return Err(DeriveError::InvalidKeyFormat(format!(
            "{}: prefix does not match version bytes",
            short(key)
        )));
    }

    payload[..4].copy_from_slice(&prefix.canonical_version());
    Ok((prefix, payload))
}

fn short(key: &str) -> String {
    if key.chars().count() > 16 {
        format!("{}…", key.chars().take(12).collect::<String>())
    } else {
        key.to_string()
    }
}

/// Re-encode a canonical key under another prefix. Mostly useful for tests
/// and for displaying keys back in the operator's preferred form.
pub fn encode_with_prefix(canonical: &str, prefix: &KeyPrefix) -> Result<String, DeriveError> {
    let mut payload = base58::decode_check(canonical)
        .map_err(|e| DeriveError::InvalidKeyFormat(e.to_string()))?;
    if payload.len() != EXTENDED_KEY_LEN {
        return Err(DeriveError::InvalidKeyFormat(format!(
            "expected {} bytes, got {}",
            EXTENDED_KEY_LEN,
            payload.len()
        )));
    }
    payload[..4].copy_from_slice(&prefix.version);
    Ok(base58::encode_check(&payload))
}

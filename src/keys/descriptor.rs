//! Output descriptor parser
//!
//! Recursive descent over the small subset of descriptor syntax the monitor
//! understands. The result is the stack of script wrappers (outermost first)
//! and the leaf: either one key expression or a `multi`/`sortedmulti` key
//! list. Whether a given wrapper/leaf combination makes sense is decided by
//! the deriver, not here.

use bitcoin::PublicKey;
use std::fmt;
use std::str::FromStr;

use super::normalize::{split_key_path, NormalizedKey, PathStep};
use crate::error::DeriveError;

/// Consensus limit on keys in a CHECKMULTISIG
pub const MAX_MULTISIG_KEYS: usize = 20;

const CHECKSUM_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    Pkh,
    Wpkh,
    Sh,
    Wsh,
}

impl fmt::Display for Wrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Wrapper::Pkh => "pkh",
            Wrapper::Wpkh => "wpkh",
            Wrapper::Sh => "sh",
            Wrapper::Wsh => "wsh",
        })
    }
}

/// `[fingerprint/path]` annotation. Kept for display only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOrigin {
    pub fingerprint: [u8; 4],
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Extended(NormalizedKey),
    Single(PublicKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExpr {
    pub origin: Option<KeyOrigin>,
    pub source: KeySource,
    pub path: Vec<PathStep>,
}

impl KeyExpr {
    pub fn has_wildcard(&self) -> bool {
        self.path.contains(&PathStep::Wildcard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leaf {
    Key(KeyExpr),
    Multi {
        sorted: bool,
        threshold: usize,
        keys: Vec<KeyExpr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Outermost wrapper first
    pub wrappers: Vec<Wrapper>,
    pub leaf: Leaf,
}

pub fn parse_descriptor(input: &str) -> Result<Descriptor, DeriveError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DeriveError::invalid_descriptor(0, "empty descriptor"));
    }
    let body = strip_checksum(input)?;

    let mut parser = Parser { input: body, pos: 0 };
    let mut wrappers = Vec::new();
    let leaf = parser.expression(&mut wrappers)?;
    if parser.pos != body.len() {
        return Err(DeriveError::invalid_descriptor(
            parser.pos,
            format!("unexpected trailing input '{}'", &body[parser.pos..]),
        ));
    }
    Ok(Descriptor { wrappers, leaf })
}

fn strip_checksum(input: &str) -> Result<&str, DeriveError> {
    match input.find('#') {
        None => Ok(input),
        Some(pos) => {
            let checksum = &input[pos + 1..];
            if checksum.len() != 8 || !checksum.chars().all(|c| CHECKSUM_CHARSET.contains(c)) {
                return Err(DeriveError::invalid_descriptor(pos, "malformed checksum"));
            }
            Ok(&input[..pos])
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, expected: char) -> Result<(), DeriveError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(c) => Err(DeriveError::invalid_descriptor(
                self.pos,
                format!("expected '{}', found '{}'", expected, c),
            )),
            None => Err(DeriveError::invalid_descriptor(
                self.pos,
                format!("expected '{}', found end of input", expected),
            )),
        }
    }

    /// Lowercase function name immediately followed by `(`, if any.
    fn function_name(&mut self) -> Option<&'a str> {
        let rest = &self.input[self.pos..];
        let len = rest.chars().take_while(|c| c.is_ascii_lowercase()).count();
        if len > 0 && rest[len..].starts_with('(') {
            self.pos += len + 1;
            Some(&rest[..len])
        } else {
            None
        }
    }

    fn expression(&mut self, wrappers: &mut Vec<Wrapper>) -> Result<Leaf, DeriveError> {
        let start = self.pos;
        let leaf = match self.function_name() {
            Some(name) => {
                let leaf = match name {
                    "pkh" => self.wrapped(Wrapper::Pkh, wrappers)?,
                    "wpkh" => self.wrapped(Wrapper::Wpkh, wrappers)?,
                    "sh" => self.wrapped(Wrapper::Sh, wrappers)?,
                    "wsh" => self.wrapped(Wrapper::Wsh, wrappers)?,
                    "multi" => self.multi(false)?,
                    "sortedmulti" => self.multi(true)?,
                    other => {
                        return Err(DeriveError::invalid_descriptor(
                            start,
                            format!("unrecognized function '{}'", other),
                        ))
                    }
                };
                self.expect(')')?;
                leaf
            }
            None => Leaf::Key(self.key_expr()?),
        };
        Ok(leaf)
    }

    fn wrapped(&mut self, wrapper: Wrapper, wrappers: &mut Vec<Wrapper>) -> Result<Leaf, DeriveError> {
        wrappers.push(wrapper);
        self.expression(wrappers)
    }

    fn multi(&mut self, sorted: bool) -> Result<Leaf, DeriveError> {
        let start = self.pos;
        let rest = &self.input[self.pos..];
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let threshold: usize = rest[..digits]
            .parse()
            .map_err(|_| DeriveError::invalid_descriptor(start, "expected multisig threshold"))?;
        self.pos += digits;

        let mut keys = Vec::new();
        while self.peek() == Some(',') {
            self.pos += 1;
            keys.push(self.key_expr()?);
        }

        if keys.is_empty() || keys.len() > MAX_MULTISIG_KEYS {
            return Err(DeriveError::invalid_descriptor(
                start,
                format!("multisig needs 1 to {} keys, got {}", MAX_MULTISIG_KEYS, keys.len()),
            ));
        }
        if threshold == 0 || threshold > keys.len() {
            return Err(DeriveError::invalid_descriptor(
                start,
                format!("threshold {} out of range for {} keys", threshold, keys.len()),
            ));
        }
        Ok(Leaf::Multi {
            sorted,
            threshold,
            keys,
        })
    }

    fn key_expr(&mut self) -> Result<KeyExpr, DeriveError> {
        let start = self.pos;
        let origin = if self.peek() == Some('[') {
            Some(self.origin()?)
        } else {
            None
        };

        let key_start = self.pos;
        let rest = &self.input[self.pos..];
        let len = rest.find([',', ')', '(', '[', ']']).unwrap_or(rest.len());
        let token = &rest[..len];
        if token.is_empty() {
            return Err(DeriveError::invalid_descriptor(start, "expected key expression"));
        }
        self.pos += len;

        let (key, path) = match token.find('/') {
            Some(pos) => (&token[..pos], &token[pos..]),
            None => (token, ""),
        };

        if key.len() == 66 && key.chars().all(|c| c.is_ascii_hexdigit()) {
            if !path.is_empty() {
                return Err(DeriveError::invalid_descriptor(
                    key_start + key.len(),
                    "plain public keys cannot carry a derivation path",
                ));
            }
            let pk = PublicKey::from_str(key)
                .map_err(|e| DeriveError::invalid_descriptor(key_start, format!("invalid public key: {}", e)))?;
            return Ok(KeyExpr {
                origin,
                source: KeySource::Single(pk),
                path: Vec::new(),
            });
        }

        let (extended, path) = split_key_path(token, true)?;
        Ok(KeyExpr {
            origin,
            source: KeySource::Extended(extended),
            path,
        })
    }

    fn origin(&mut self) -> Result<KeyOrigin, DeriveError> {
        let start = self.pos;
        self.expect('[')?;
        let rest = &self.input[self.pos..];
        let close = rest
            .find(']')
            .ok_or_else(|| DeriveError::invalid_descriptor(start, "unterminated key origin"))?;
        let inner = &rest[..close];
        let (fingerprint_hex, path) = match inner.find('/') {
            Some(pos) => (&inner[..pos], &inner[pos + 1..]),
            None => (inner, ""),
        };

        let mut fingerprint = [0u8; 4];
        hex::decode_to_slice(fingerprint_hex, &mut fingerprint).map_err(|_| {
            DeriveError::invalid_descriptor(start + 1, format!("invalid fingerprint '{}'", fingerprint_hex))
        })?;

        self.pos += close + 1;
        Ok(KeyOrigin {
            fingerprint,
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::bip32::{Xpriv, Xpub};
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::Network;

    fn xpub(seed: u8) -> String {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Bitcoin, &[seed; 32]).unwrap();
        Xpub::from_priv(&secp, &master).to_string()
    }

    fn position(err: DeriveError) -> usize {
        match err {
            DeriveError::InvalidDescriptorFormat { position, .. } => position,
            other => panic!("expected InvalidDescriptorFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_wrappers() {
        let k = xpub(1);
        let parsed = parse_descriptor(&format!("sh(wpkh([d34db33f/49h/0h/0h]{}/0/*))", k)).unwrap();
        assert_eq!(parsed.wrappers, vec![Wrapper::Sh, Wrapper::Wpkh]);
        match parsed.leaf {
            Leaf::Key(key) => {
                assert_eq!(key.origin.unwrap().fingerprint, [0xd3, 0x4d, 0xb3, 0x3f]);
                assert_eq!(key.path, vec![PathStep::Normal(0), PathStep::Wildcard]);
            }
            other => panic!("unexpected leaf {:?}", other),
        }
    }

    #[test]
    fn test_multisig_body() {
        let (a, b) = (xpub(1), xpub(2));
        let parsed = parse_descriptor(&format!("sh(wsh(sortedmulti(2,{}/0/*,{}/0/*)))", a, b)).unwrap();
        assert_eq!(parsed.wrappers, vec![Wrapper::Sh, Wrapper::Wsh]);
        match parsed.leaf {
            Leaf::Multi { sorted, threshold, keys } => {
                assert!(sorted);
                assert_eq!(threshold, 2);
                assert_eq!(keys.len(), 2);
            }
            other => panic!("unexpected leaf {:?}", other),
        }
    }

    #[test]
    fn test_checksum_is_stripped() {
        let k = xpub(3);
        assert!(parse_descriptor(&format!("wpkh({}/0/*)#qwer7yu8", k)).is_ok());
        let bad = format!("wpkh({}/0/*)#nope", k);
        assert_eq!(position(parse_descriptor(&bad).unwrap_err()), bad.find('#').unwrap());
    }

    #[test]
    fn test_error_positions() {
        let k = xpub(4);

        let unknown = format!("wpkh(tr({}))", k);
        assert_eq!(position(parse_descriptor(&unknown).unwrap_err()), 5);

        let unclosed = format!("wpkh({}/0/*", k);
        assert_eq!(position(parse_descriptor(&unclosed).unwrap_err()), unclosed.len());

        let trailing = format!("wpkh({}/0/*)x", k);
        assert_eq!(position(parse_descriptor(&trailing).unwrap_err()), trailing.len() - 1);

        let threshold = format!("wsh(multi(3,{},{}))", k, k);
        assert_eq!(position(parse_descriptor(&threshold).unwrap_err()), 10);
    }

    #[test]
    fn test_hardened_key_path_rejected() {
        let k = xpub(5);
        assert!(matches!(
            parse_descriptor(&format!("wpkh({}/0h/*)", k)),
            Err(DeriveError::HardenedDerivationUnsupported(_))
        ));
        // Hardened steps in the origin are informational and fine
        assert!(parse_descriptor(&format!("wpkh([00000000/84'/0'/0']{}/0/*)", k)).is_ok());
    }

    #[test]
    fn test_plain_public_key() {
        let parsed = parse_descriptor(
            "pkh(02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5)",
        )
        .unwrap();
        assert!(matches!(parsed.leaf, Leaf::Key(KeyExpr { source: KeySource::Single(_), .. })));
    }
}

//! Key handling and address derivation
//!
//! - Extended key prefix normalization
//! - Descriptor parsing
//! - Deterministic address derivation (single key and multisig)

pub mod derive;
pub mod descriptor;
pub mod normalize;

pub use derive::{AddressDeriver, DerivedAddress, ScriptTemplate};
pub use descriptor::{parse_descriptor, Descriptor, Leaf, Wrapper};
pub use normalize::{convert_extended_key, normalize_extended_key, NormalizedKey, ScriptKind};

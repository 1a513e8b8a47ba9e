//! Gap-limit maintenance
//!
//! A source keeps `gap_limit` unused addresses after the last one that has
//! seen activity. New addresses are derived lazily, only once activity shows
//! up, instead of pre-deriving a large fixed range.

use crate::error::DeriveError;
use crate::keys::AddressDeriver;
use crate::storage::{AddressRecord, Collection, Source};

/// How many more addresses `source` needs, or `None` when its trailing gap
/// is already wide enough (or nothing has been used yet).
pub fn gap_needed(source: &Source) -> Option<u32> {
    let mut ordered: Vec<&AddressRecord> = source.addresses.iter().collect();
    ordered.sort_by_key(|record| record.index);

    let last_active = ordered.iter().rposition(|record| record.has_activity())?;
    let trailing_empty = ordered[last_active + 1..]
        .iter()
        .filter(|record| !record.has_activity())
        .count() as u32;

    if trailing_empty >= source.gap_limit {
        None
    } else {
        Some(source.gap_limit - trailing_empty)
    }
}

/// Derive `count` fresh records for `source` starting at logical `start`.
/// Each inherits the source's policy and starts from a zero expectation.
/// A source without a wildcard only ever has index 0.
pub fn derive_records(source: &Source, start: u32, count: u32) -> Result<Vec<AddressRecord>, DeriveError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let deriver = AddressDeriver::from_source(source)?;
    // A path without `*` names a single address
    let count = if deriver.is_ranged() {
        count
    } else if start == 0 {
        1
    } else {
        return Ok(Vec::new());
    };
    let derived = deriver.derive(start, count, source.skip)?;

    Ok(derived
        .into_iter()
        .map(|d| {
            AddressRecord::derived(
                d.address.to_string(),
                format!("{} #{}", source.name, d.index),
                d.index,
                source.monitor,
            )
        })
        .collect())
}

/// Initial batch for a newly added or re-keyed source
pub fn initial_records(source: &Source) -> Result<Vec<AddressRecord>, DeriveError> {
    derive_records(source, 0, source.initial_addresses)
}

/// Give sources that were stored without addresses their initial batch.
/// A source that fails to derive is logged and left empty.
pub fn seed_empty_sources(collection_name: &str, collection: &mut Collection) {
    for source in collection
        .extended_keys
        .iter_mut()
        .chain(collection.descriptors.iter_mut())
        .filter(|source| source.addresses.is_empty())
    {
        match initial_records(source) {
            Ok(records) => {
                log::info!(
                    "➕ Derived initial {} address(es) for '{}' in '{}'",
                    records.len(),
                    source.name,
                    collection_name
                );
                source.addresses = records;
            }
            Err(e) => log::error!("Could not derive '{}' in '{}': {}", source.name, collection_name, e),
        }
    }
}

/// Records that would restore the gap, continuing after the highest index.
pub fn expansion(source: &Source) -> Result<Vec<AddressRecord>, DeriveError> {
    match gap_needed(source) {
        Some(needed) => {
            log::debug!(
                "Source '{}' needs {} more address(es) to keep a gap of {}",
                source.name,
                needed,
                source.gap_limit
            );
            derive_records(source, source.next_index(), needed)
        }
        None => Ok(Vec::new()),
    }
}

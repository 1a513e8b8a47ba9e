//! Change detection
//!
//! Compares a fresh cumulative snapshot with an address's expectation one
//! field at a time and decides between "nothing to do", "silently accept"
//! and "alert".

use serde::Serialize;

use crate::storage::{AddressRecord, AlertFlags, Balances, Field, Policy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: Field,
    pub expected: u64,
    /// Value seen on the previous poll, if there was one
    pub previous: Option<u64>,
    pub observed: u64,
}

/// Fields that need operator attention after one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn fields(&self) -> Vec<Field> {
        self.changes.iter().map(|change| change.field).collect()
    }
}

/// Reconcile one successful fetch into `record`.
///
/// `expect` only moves for auto-accepted fields. Alert fields are reported
/// when the observed value moved since the previous poll; an unchanged value
/// that still differs from the expectation stays silent. `actual` always
/// ends up as `snapshot`.
pub fn reconcile(record: &mut AddressRecord, snapshot: Balances) -> Option<ChangeSet> {
    let previous = record.actual;
    let mut changes = Vec::new();

    for field in Field::ALL {
        let observed = snapshot.get(field);
        let expected = record.expect.get(field);
        if observed == expected {
            continue;
        }

        match record.monitor.get(field) {
            Policy::AutoAccept => {
                record.expect.set(field, observed);
                record.alerted.set(field, false);
            }
            Policy::Alert => {
                let previous_value = previous.map(|p| p.get(field));
                if previous_value != Some(observed) {
                    record.alerted.set(field, true);
                    changes.push(FieldChange {
                        field,
                        expected,
                        previous: previous_value,
                        observed,
                    });
                }
            }
        }
    }

    record.actual = Some(snapshot);

    if changes.is_empty() {
        None
    } else {
        Some(ChangeSet { changes })
    }
}

/// Operator acknowledgment: the current observation becomes the expectation
/// and every outstanding alert is cleared.
pub fn acknowledge(record: &mut AddressRecord) {
    if let Some(actual) = record.actual {
        record.expect = actual;
    }
    record.alerted = AlertFlags::default();
}

/// Clear outstanding alerts on fields that are now auto-accepted.
pub fn clear_auto_accepted(record: &mut AddressRecord) {
    for field in Field::ALL {
        if record.monitor.get(field) == Policy::AutoAccept {
            record.alerted.set(field, false);
        }
    }
}

//! FIFO of addresses waiting for a balance fetch

use std::collections::VecDeque;

use super::store::{AddressRef, Selector, Store};
use crate::error::MonitorError;

#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<AddressRef>,
}

impl WorkQueue {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, item: &AddressRef) -> bool {
        self.items.contains(item)
    }

    /// Returns false when `item` is already waiting.
    pub fn push(&mut self, item: AddressRef) -> bool {
        if self.contains(&item) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Pop up to `limit` items from the front.
    pub fn take(&mut self, limit: usize) -> Vec<AddressRef> {
        let count = limit.min(self.items.len());
        self.items.drain(..count).collect()
    }

    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&AddressRef) -> bool,
    {
        self.items.retain(keep);
    }
}

/// Queue every address matched by `selector` that is not already queued or
/// in flight, marking each one `queued`. Returns how many were added.
pub fn enqueue(store: &mut Store, queue: &mut WorkQueue, selector: &Selector) -> Result<usize, MonitorError> {
    let mut added = 0;
    for item in store.select(selector)? {
        let record = store.record_mut(&item)?;
        if record.queued {
            continue;
        }
        if queue.push(item) {
            record.queued = true;
            added += 1;
        }
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AddressRecord, MonitorPolicy};

    fn store() -> Store {
        let mut store = Store::default();
        store.add_collection("cold").unwrap();
        for address in ["a", "b", "c"] {
            store
                .add_address("cold", AddressRecord::new(address, address, MonitorPolicy::default()))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_enqueue_skips_queued_records() {
        let mut store = store();
        let mut queue = WorkQueue::default();

        assert_eq!(enqueue(&mut store, &mut queue, &Selector::All).unwrap(), 3);
        assert_eq!(enqueue(&mut store, &mut queue, &Selector::All).unwrap(), 0);
        assert_eq!(queue.len(), 3);

        // In flight: out of the queue but still flagged
        let batch = queue.take(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].address, "a");
        assert_eq!(enqueue(&mut store, &mut queue, &Selector::All).unwrap(), 0);

        store.record_mut(&batch[0]).unwrap().queued = false;
        assert_eq!(enqueue(&mut store, &mut queue, &Selector::All).unwrap(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_take_is_bounded() {
        let mut queue = WorkQueue::default();
        for address in ["a", "b", "c"] {
            assert!(queue.push(AddressRef::plain("cold", address)));
        }
        assert!(!queue.push(AddressRef::plain("cold", "a")));
        assert_eq!(queue.take(10).len(), 3);
        assert!(queue.is_empty());
        assert!(queue.take(1).is_empty());
    }
}

//! Alert delivery
//!
//! The reconciler hands every alert to a [`NotificationDispatcher`], which
//! drops field changes that were already delivered and passes the rest to a
//! [`Notifier`] sink (webhook or log).

pub mod webhook;

use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::NotifyError;
use crate::monitor::detector::FieldChange;
use crate::storage::Field;

pub use webhook::WebhookNotifier;

/// An alert about one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub collection: String,
    /// Address label, or the owning source's name for derived addresses
    pub name: String,
    pub address: String,
    pub changes: Vec<FieldChange>,
}

impl Notification {
    /// Identity of one delivered field value.
    pub fn key(&self, change: &FieldChange) -> String {
        format!(
            "{}/{}/{}/{}:{}",
            self.collection, self.name, self.address, change.field, change.observed
        )
    }

    pub fn message(&self) -> String {
        let mut text = format!(
            "⚠️ Balance change in {}/{}\nAddress: {}",
            self.collection, self.name, self.address
        );
        for change in &self.changes {
            let _ = write!(
                text,
                "\n  {}: expected {} sats, observed {} sats",
                change.field, change.expected, change.observed
            );
        }
        text
    }
}

/// Delivery sink for alert text.
pub trait Notifier: Send + Sync {
    fn deliver<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Sink that only writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            log::warn!("{}", text);
            Ok(())
        })
    }
}

/// Distinct values remembered per field; the oldest is dropped beyond this.
const REMEMBERED_VALUES: usize = 32;

/// Delivered values for one address, by (record name, field).
type DeliveredValues = HashMap<(String, Field), VecDeque<u64>>;

/// De-duplicating front of a [`Notifier`].
///
/// A field value is delivered at most once until the address is
/// acknowledged (see [`NotificationDispatcher::forget_address`]). Only the
/// last `REMEMBERED_VALUES` values per field are kept. Failed deliveries are
/// logged and not retried.
pub struct NotificationDispatcher {
    sink: Arc<dyn Notifier>,
    /// Keyed by (collection, address)
    delivered: Mutex<HashMap<(String, String), DeliveredValues>>,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn Notifier>) -> Self {
        Self {
            sink,
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver the not-yet-delivered part of `notification`. Returns true if
    /// anything was sent.
    pub async fn dispatch(&self, notification: Notification) -> bool {
        let slot = (notification.collection.clone(), notification.address.clone());

        let fresh: Vec<FieldChange> = {
            let delivered = self.delivered.lock().await;
            let seen = delivered.get(&slot);
            notification
                .changes
                .iter()
                .filter(|change| {
                    let duplicate = seen
                        .and_then(|values| values.get(&(notification.name.clone(), change.field)))
                        .map(|values| values.contains(&change.observed))
                        .unwrap_or(false);
                    if duplicate {
                        log::debug!("Suppressed duplicate alert {}", notification.key(change));
                    }
                    !duplicate
                })
                .cloned()
                .collect()
        };

        if fresh.is_empty() {
            return false;
        }

        let outgoing = Notification {
            changes: fresh,
            ..notification
        };

        match self.sink.deliver(&outgoing.message()).await {
            Ok(()) => {
                let mut delivered = self.delivered.lock().await;
                let fields = delivered.entry(slot).or_default();
                for change in &outgoing.changes {
                    let values = fields.entry((outgoing.name.clone(), change.field)).or_default();
                    values.push_back(change.observed);
                    while values.len() > REMEMBERED_VALUES {
                        values.pop_front();
                    }
                }
                log::info!(
                    "🔔 Alert sent for {} in '{}' ({} field(s))",
                    outgoing.address,
                    outgoing.collection,
                    outgoing.changes.len()
                );
                true
            }
            Err(e) => {
                log::error!("Failed to deliver alert for {}: {}", outgoing.address, e);
                false
            }
        }
    }

    /// Allow values for `address` in `collection` to be delivered again.
    pub async fn forget_address(&self, collection: &str, address: &str) {
        self.delivered
            .lock()
            .await
            .remove(&(collection.to_string(), address.to_string()));
    }

    pub async fn forget_collection(&self, collection: &str) {
        self.delivered
            .lock()
            .await
            .retain(|(name, _), _| name != collection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<String>>,
        fail: bool,
    }

    impl Notifier for Recorder {
        fn deliver<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
            Box::pin(async move {
                if self.fail {
                    return Err(NotifyError::Transport("offline".into()));
                }
                self.sent.lock().unwrap().push(text.to_string());
                Ok(())
            })
        }
    }

    fn notification(observed: u64) -> Notification {
        notification_in("cold", "bc1qexample", observed)
    }

    fn notification_in(collection: &str, address: &str, observed: u64) -> Notification {
        Notification {
            collection: collection.into(),
            name: "savings".into(),
            address: address.into(),
            changes: vec![FieldChange {
                field: Field::ChainIn,
                expected: 0,
                previous: None,
                observed,
            }],
        }
    }

    #[tokio::test]
    async fn test_duplicate_values_suppressed_until_forgotten() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = NotificationDispatcher::new(recorder.clone());

        assert!(dispatcher.dispatch(notification(5000)).await);
        assert!(!dispatcher.dispatch(notification(5000)).await);
        assert!(dispatcher.dispatch(notification(6000)).await);
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);

        dispatcher.forget_address("cold", "bc1qexample").await;
        assert!(dispatcher.dispatch(notification(5000)).await);
        assert_eq!(recorder.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_delivery_not_recorded() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let dispatcher = NotificationDispatcher::new(recorder);
        assert!(!dispatcher.dispatch(notification(5000)).await);
        assert!(dispatcher.delivered.lock().await.is_empty());
    }

    #[test]
    fn test_message_lists_fields() {
        let text = notification(5000).message();
        assert!(text.contains("cold/savings"));
        assert!(text.contains("chain_in: expected 0 sats, observed 5000 sats"));
    }

    #[tokio::test]
    async fn test_forget_matches_exact_collection_and_address() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = NotificationDispatcher::new(recorder.clone());

        assert!(dispatcher.dispatch(notification_in("cold/archive", "bc1qexample", 5000)).await);
        assert!(dispatcher.dispatch(notification_in("cold", "bc1qexample", 5000)).await);
        assert!(dispatcher.dispatch(notification_in("cold", "savings", 5000)).await);

        dispatcher.forget_collection("cold").await;
        // Other collections sharing the prefix keep their history
        assert!(!dispatcher.dispatch(notification_in("cold/archive", "bc1qexample", 5000)).await);
        assert!(dispatcher.dispatch(notification_in("cold", "bc1qexample", 5000)).await);

        dispatcher.forget_address("cold/archive", "savings").await;
        assert!(!dispatcher.dispatch(notification_in("cold/archive", "bc1qexample", 5000)).await);
        assert_eq!(recorder.sent.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_remembered_values_bounded() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = NotificationDispatcher::new(recorder.clone());

        for observed in 1..=(REMEMBERED_VALUES as u64 * 3) {
            assert!(dispatcher.dispatch(notification(observed)).await);
        }
        {
            let delivered = dispatcher.delivered.lock().await;
            let fields = &delivered[&("cold".to_string(), "bc1qexample".to_string())];
            assert_eq!(fields.len(), 1);
            assert!(fields.values().all(|values| values.len() == REMEMBERED_VALUES));
        }

        // Recent values are still suppressed
        let latest = REMEMBERED_VALUES as u64 * 3;
        assert!(!dispatcher.dispatch(notification(latest)).await);
        assert!(!dispatcher.dispatch(notification(latest - 1)).await);
    }
}

//! Live tracking
//!
//! Push events carry per-transaction deltas for an address. They are folded
//! into the last cumulative observation and reconciled exactly like a poll,
//! so polling and push updates converge on the same totals.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::manager::Monitor;
use super::store::{AddressRef, Selector};
use crate::error::MonitorError;
use crate::storage::Balances;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Mempool,
    Confirmed,
}

/// Funds an address received and spent in one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub address: String,
    pub status: TxStatus,
    #[serde(default)]
    pub funded: u64,
    #[serde(default)]
    pub spent: u64,
}

impl TrackingEvent {
    /// Cumulative totals after this event. A confirmation moves the amounts
    /// out of the mempool counters and into the chain ones.
    pub fn apply_to(&self, base: Balances) -> Balances {
        match self.status {
            TxStatus::Mempool => Balances {
                mempool_in: base.mempool_in.saturating_add(self.funded),
                mempool_out: base.mempool_out.saturating_add(self.spent),
                ..base
            },
            TxStatus::Confirmed => Balances {
                chain_in: base.chain_in.saturating_add(self.funded),
                chain_out: base.chain_out.saturating_add(self.spent),
                mempool_in: base.mempool_in.saturating_sub(self.funded),
                mempool_out: base.mempool_out.saturating_sub(self.spent),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingOutcome {
    /// Records reconciled from the event
    pub applied: usize,
    /// Records never polled, queued for a fetch instead
    pub queued: usize,
}

impl Monitor {
    /// Apply one push event to every tracked record of its address.
    pub async fn apply_tracking_event(&self, event: &TrackingEvent) -> Result<TrackingOutcome, MonitorError> {
        let mut outcome = TrackingOutcome::default();

        let notifications = {
            let mut state = self.state.lock().await;
            let targets: Vec<AddressRef> = state
                .store
                .locate(&event.address)
                .into_iter()
                .filter(|item| {
                    state
                        .store
                        .record(item)
                        .map(|record| record.track_websocket)
                        .unwrap_or(false)
                })
                .collect();

            if targets.is_empty() {
                log::debug!("Ignoring event for untracked address {}", event.address);
                return Ok(outcome);
            }

            let mut notifications = Vec::new();
            for item in targets {
                let actual = state.store.record(&item)?.actual;
                match actual {
                    Some(base) => {
                        if let Some(notification) = state.reconcile(&item, event.apply_to(base))? {
                            notifications.push(notification);
                        }
                        outcome.applied += 1;
                    }
                    None => outcome.queued += state.enqueue(&Selector::Address(item))?,
                }
            }
            self.commit(&state)?;
            notifications
        };

        for notification in notifications {
            self.notifications.dispatch(notification).await;
        }
        if outcome.queued > 0 {
            self.wake.notify_one();
        }
        log::debug!(
            "Tracking event for {}: {} applied, {} queued",
            event.address,
            outcome.applied,
            outcome.queued
        );
        Ok(outcome)
    }

    /// Addresses that want push updates, for the subscriber side.
    pub async fn tracked_addresses(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut addresses: Vec<String> = state
            .store
            .select(&Selector::All)
            .unwrap_or_default()
            .into_iter()
            .filter(|item| {
                state
                    .store
                    .record(item)
                    .map(|record| record.track_websocket)
                    .unwrap_or(false)
            })
            .map(|item| item.address)
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// Consume events from a push subscriber until the channel closes.
    pub fn spawn_tracking(self: &Arc<Self>, mut events: mpsc::Receiver<TrackingEvent>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = monitor.apply_tracking_event(&event).await {
                    log::warn!("Dropped tracking event for {}: {}", event.address, e);
                }
            }
            log::info!("Tracking channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mempool_then_confirmation() {
        let base = Balances {
            chain_in: 1000,
            ..Balances::default()
        };
        let seen = TrackingEvent {
            address: "bc1qexample".into(),
            status: TxStatus::Mempool,
            funded: 3000,
            spent: 0,
        };
        let pending = seen.apply_to(base);
        assert_eq!(pending.mempool_in, 3000);
        assert_eq!(pending.chain_in, 1000);

        let confirmed = TrackingEvent {
            status: TxStatus::Confirmed,
            ..seen
        }
        .apply_to(pending);
        assert_eq!(confirmed.chain_in, 4000);
        assert_eq!(confirmed.mempool_in, 0);
    }

    #[test]
    fn test_confirmation_without_mempool_sighting() {
        let event = TrackingEvent {
            address: "bc1qexample".into(),
            status: TxStatus::Confirmed,
            funded: 0,
            spent: 500,
        };
        let after = event.apply_to(Balances::default());
        assert_eq!(after.chain_out, 500);
        assert_eq!(after.mempool_out, 0);
    }

    #[test]
    fn test_event_json() {
        let event: TrackingEvent =
            serde_json::from_str(r#"{"address":"bc1qexample","status":"mempool","funded":700}"#).unwrap();
        assert_eq!(event.status, TxStatus::Mempool);
        assert_eq!(event.spent, 0);
    }
}

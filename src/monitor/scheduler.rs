//! Reconciliation loop
//!
//! Each round takes up to `parallel_limit` queued addresses and fetches them
//! concurrently. Dispatches are paced `api_delay` apart across rounds. When
//! the queue runs dry the loop sleeps `api_delay` and re-queues everything.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::manager::{ApiState, Monitor, SystemStatus};
use super::store::{AddressRef, Selector};
use crate::error::{FetchError, MonitorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded { alerted: bool },
    Failed,
    RateLimited,
}

/// What one round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub alerts: usize,
    pub last_error: Option<String>,
}

impl RoundReport {
    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Succeeded { alerted } => {
                self.succeeded += 1;
                if alerted {
                    self.alerts += 1;
                }
            }
            Outcome::Failed => self.failed += 1,
            Outcome::RateLimited => self.rate_limited += 1,
        }
    }

    /// Rate limiting wins over other errors; a clean round is OK.
    fn status(&self) -> SystemStatus {
        let (state, message) = if self.rate_limited > 0 {
            (
                ApiState::Backoff,
                Some(format!("{} request(s) rate limited", self.rate_limited)),
            )
        } else if self.failed > 0 {
            (ApiState::Error, self.last_error.clone())
        } else {
            (ApiState::Ok, None)
        };
        SystemStatus {
            state,
            message,
            last_round: Some(Utc::now()),
        }
    }
}

/// Running scheduler task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the current round and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::error!("Scheduler task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Monitor {
    /// Start the perpetual loop on the tokio runtime.
    pub fn spawn_scheduler(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move { monitor.run(receiver).await });
        SchedulerHandle { shutdown, task }
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!("🔄 Reconciliation scheduler started");
        self.requeue_all().await;

        // Set when the queue first drains; wake-ups do not push it back
        let mut requeue_at: Option<Instant> = None;

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            if self.queue_len().await > 0 {
                self.run_round().await;
                requeue_at = None;
                continue;
            }

            let deadline = *requeue_at.get_or_insert_with(|| Instant::now() + self.settings.api_delay);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    requeue_at = None;
                    self.requeue_all().await;
                }
            }
        }

        log::info!("Reconciliation scheduler stopped");
    }

    async fn requeue_all(&self) {
        if let Err(e) = self.refresh(&Selector::All).await {
            log::error!("Failed to queue addresses: {}", e);
        }
    }

    /// Process one batch from the front of the queue.
    pub async fn run_round(&self) -> RoundReport {
        let batch = {
            let mut state = self.state.lock().await;
            state.queue.take(self.settings.parallel_limit)
        };
        if batch.is_empty() {
            return RoundReport::default();
        }
        log::debug!("Round of {} address(es)", batch.len());

        let outcomes = join_all(batch.into_iter().map(|item| self.process(item))).await;

        let mut report = RoundReport::default();
        for (outcome, error) in outcomes {
            report.record(outcome);
            if error.is_some() {
                report.last_error = error;
            }
        }

        let mut state = self.state.lock().await;
        state.status = report.status();
        let _ = self.commit(&state);
        report
    }

    async fn process(&self, item: AddressRef) -> (Outcome, Option<String>) {
        self.pace().await;
        let result = self.balances.fetch(&item.address).await;

        let outcome = match &result {
            Ok(_) => Outcome::Succeeded { alerted: false },
            Err(FetchError::RateLimited { .. }) => Outcome::RateLimited,
            Err(_) => Outcome::Failed,
        };
        let error = result.as_ref().err().map(|e| {
            log::warn!("Balance fetch failed for {}: {}", item.address, e);
            e.to_string()
        });

        let notification = {
            let mut state = self.state.lock().await;
            match state.complete_fetch(&item, &result) {
                Ok(notification) => {
                    let _ = self.commit(&state);
                    notification
                }
                Err(MonitorError::NotFound(_)) => {
                    log::debug!("{} was removed while its fetch was in flight", item.address);
                    None
                }
                Err(e) => {
                    log::error!("Failed to apply balance for {}: {}", item.address, e);
                    None
                }
            }
        };

        let outcome = match (outcome, notification) {
            (Outcome::Succeeded { .. }, Some(notification)) => Outcome::Succeeded {
                alerted: self.notifications.dispatch(notification).await,
            },
            (outcome, _) => outcome,
        };
        (outcome, error)
    }

    /// Wait until `api_delay` has passed since the previous dispatch.
    async fn pace(&self) {
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.settings.api_delay).await;
        }
        *last = Some(Instant::now());
    }
}

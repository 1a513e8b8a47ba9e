//! Balance reconciliation engine
//!
//! - `store`: owned collection document
//! - `queue` / `scheduler`: paced, bounded fetch loop
//! - `detector`: accept/alert decisions
//! - `gap`: gap-limit address expansion
//! - `tracking`: push-event reconciliation
//! - `manager`: the [`Monitor`] tying them together

pub mod detector;
pub mod gap;
pub mod manager;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod tracking;

pub use detector::{ChangeSet, FieldChange};
pub use manager::{
    AddressUpdate, ApiState, Monitor, MonitorSettings, NewAddress, SourceSpec, StateSnapshot, SystemStatus,
};
pub use scheduler::{RoundReport, SchedulerHandle};
pub use store::{AddressRef, Selector, SourceKind};
pub use tracking::{TrackingEvent, TrackingOutcome, TxStatus};

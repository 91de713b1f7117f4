//! Cross-device synchronization engine.
//!
//! Keeps one owner's bookmark data consistent across concurrently connected
//! clients. Conflict policy is last-write-wins by wall-clock timestamp
//! comparison; there is no CRDT or vector-clock causal history.
//!
//! # Flow
//!
//! Reads go one way: store -> [`DeltaCollector`] -> caller. Writes go one
//! way: caller -> [`ChangeApplier`] -> store -> [`SyncHub`] -> other
//! subscribers. [`OfflineReconciler`] composes the two into the pull-then-
//! push exchange used when a device reconnects.

mod apply;
mod broadcast;
mod delta;
mod error;
mod offline;

pub use apply::{ApplyOutcome, ChangeApplier};
pub use broadcast::{ChangeNotice, Subscription, SyncHub};
pub use delta::{DeltaCollector, DeltaResponse};
pub use error::SyncError;
pub use offline::{OfflineReconciler, OfflineSyncResponse};

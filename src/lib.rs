//! Linkmark Sync Library
//!
//! Shared sync engine for Linkmark: delta collection, last-write-wins
//! conflict resolution, realtime fan-out, and offline reconciliation.

pub mod db;
pub mod models;
pub mod sync;

pub use db::{init_db, EntityRow, EntityStore, StoreError, StoredEntity};
pub use models::{
    ApplyFailure, ConflictResolution, EntityType, Resolution, SyncAction, SyncEntity,
};
pub use sync::{
    ApplyOutcome, ChangeApplier, ChangeNotice, DeltaCollector, DeltaResponse, OfflineReconciler,
    OfflineSyncResponse, Subscription, SyncError, SyncHub,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}

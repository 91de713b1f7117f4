//! Conflict resolution and change application.
//!
//! Applies a batch of client-originated changes against the canonical
//! store using optimistic, timestamp-based last-write-wins: no locks, no
//! compare-and-swap at the storage layer. Changes are processed strictly in
//! submission order and the batch is not atomic; one bad change must not
//! block the rest of a device's offline queue from syncing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{EntityStore, StoreError};
use crate::models::{ApplyFailure, ConflictResolution, Resolution, SyncAction, SyncEntity};
use crate::sync::SyncHub;

/// Result of applying one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    /// Updates rejected by last-write-wins. Not errors.
    pub conflicts: Vec<ConflictResolution>,
    /// Changes whose application failed outright; the rest of the batch
    /// was still processed.
    pub failures: Vec<ApplyFailure>,
}

enum ChangeOutcome {
    Applied,
    Conflict(ConflictResolution),
}

/// Applies client changes and fans accepted ones out to other sessions.
#[derive(Clone)]
pub struct ChangeApplier {
    store: EntityStore,
    hub: Arc<SyncHub>,
}

impl ChangeApplier {
    pub fn new(store: EntityStore, hub: Arc<SyncHub>) -> Self {
        Self { store, hub }
    }

    /// Applies `changes` in submission order on behalf of `device_id`.
    ///
    /// Each accepted change is broadcast exactly once with `device_id` as
    /// the exclusion marker. A rejected update produces a conflict and no
    /// broadcast. A change that errors is logged, reported as a failure,
    /// and does not stop the remaining changes.
    pub async fn apply_changes(
        &self,
        owner_id: &str,
        changes: &[SyncEntity],
        device_id: &str,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        for change in changes {
            match self.apply_one(owner_id, change).await {
                Ok(ChangeOutcome::Applied) => {
                    self.hub.publish(owner_id, change.clone(), device_id).await;
                }
                Ok(ChangeOutcome::Conflict(conflict)) => {
                    tracing::debug!(
                        owner_id,
                        device_id,
                        entity_id = %change.id,
                        entity_type = %change.entity_type,
                        "update rejected by last-write-wins"
                    );
                    outcome.conflicts.push(conflict);
                }
                Err(e) => {
                    tracing::error!(
                        owner_id,
                        device_id,
                        entity_id = %change.id,
                        entity_type = %change.entity_type,
                        error = %e,
                        "failed to apply change, continuing with batch"
                    );
                    outcome.failures.push(ApplyFailure {
                        entity_id: change.id.clone(),
                        entity_type: change.entity_type,
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome
    }

    async fn apply_one(
        &self,
        owner_id: &str,
        change: &SyncEntity,
    ) -> Result<ChangeOutcome, StoreError> {
        let now = Utc::now();

        match change.action {
            // Idempotent insert: a repeat create for the same id is a no-op
            SyncAction::Create => {
                self.store
                    .create(change.entity_type, &change.id, &change.payload, owner_id, now)
                    .await?;
                Ok(ChangeOutcome::Applied)
            }
            // Terminal and unconditional, never a conflict
            SyncAction::Delete => {
                self.store
                    .delete(change.entity_type, &change.id, owner_id)
                    .await?;
                Ok(ChangeOutcome::Applied)
            }
            SyncAction::Update => {
                let stored = self
                    .store
                    .read_current(change.entity_type, &change.id, owner_id)
                    .await?;

                match stored {
                    Some(stored) if stored.mutation_timestamp > change.timestamp => {
                        Ok(ChangeOutcome::Conflict(ConflictResolution {
                            entity_id: change.id.clone(),
                            entity_type: change.entity_type,
                            local_timestamp: change.timestamp,
                            remote_timestamp: stored.mutation_timestamp,
                            resolution: Resolution::Remote,
                        }))
                    }
                    Some(_) => {
                        // Incoming change is newer or equal: write the
                        // payload, stamping the current server time
                        self.store
                            .update(
                                change.entity_type,
                                &change.id,
                                &change.payload,
                                owner_id,
                                now,
                            )
                            .await?;
                        Ok(ChangeOutcome::Applied)
                    }
                    None => {
                        // Update for an absent (possibly deleted) entity:
                        // a zero-row write, silently discarded rather than
                        // reported as a conflict
                        tracing::debug!(
                            owner_id,
                            entity_id = %change.id,
                            entity_type = %change.entity_type,
                            "update for absent entity is a no-op"
                        );
                        self.store
                            .update(
                                change.entity_type,
                                &change.id,
                                &change.payload,
                                owner_id,
                                now,
                            )
                            .await?;
                        Ok(ChangeOutcome::Applied)
                    }
                }
            }
        }
    }
}

//! Delta change collection.
//!
//! Given an owner and a watermark timestamp, reads every entity type and
//! returns all records mutated strictly after the watermark, merged into
//! one time-ordered replay sequence for that owner. Cross-owner ordering is
//! undefined and irrelevant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::EntityStore;
use crate::models::{EntityType, SyncEntity};
use crate::sync::SyncError;

/// Response to a delta pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    /// Changes mutated strictly after the watermark, ascending by
    /// timestamp.
    pub changes: Vec<SyncEntity>,
    /// Server time at collection. The caller persists this as its next
    /// watermark.
    pub timestamp: DateTime<Utc>,
    /// Always false in the baseline design: very large deltas are returned
    /// in full. Present so a pagination cursor can be added without a wire
    /// change.
    pub has_more: bool,
}

/// Reads per-type deltas from the canonical store and merges them.
#[derive(Debug, Clone)]
pub struct DeltaCollector {
    store: EntityStore,
}

impl DeltaCollector {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Collects every change for `owner_id` with mutation timestamp
    /// strictly greater than `watermark`.
    ///
    /// Rows are reported with the entity type's registered delta action:
    /// `update` for timestamp-bearing types, `create` for append-only types
    /// whenever first observed within the window.
    pub async fn get_delta_changes(
        &self,
        owner_id: &str,
        watermark: Option<DateTime<Utc>>,
        device_id: &str,
    ) -> Result<DeltaResponse, SyncError> {
        let now = Utc::now();
        let mut changes = Vec::new();

        for entity_type in EntityType::ALL {
            let rows = self
                .store
                .list_mutated_since(entity_type, owner_id, watermark)
                .await?;

            changes.extend(rows.into_iter().map(|row| SyncEntity {
                id: row.id,
                entity_type,
                action: entity_type.spec().delta_action,
                payload: row.payload,
                timestamp: row.mutation_timestamp,
                owner_id: owner_id.to_string(),
            }));
        }

        // One globally time-ordered replay sequence for this owner
        changes.sort_by_key(|c| c.timestamp);

        tracing::debug!(
            owner_id,
            device_id,
            count = changes.len(),
            watermark = watermark.map(|w| w.to_rfc3339()).as_deref(),
            "collected delta changes"
        );

        Ok(DeltaResponse {
            changes,
            timestamp: now,
            has_more: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::models::SyncAction;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn setup() -> (DeltaCollector, EntityStore, TempDir) {
        let temp_dir = tempdir().unwrap();
        let pool = init_db(temp_dir.path().join("test.db")).await.unwrap();
        let store = EntityStore::new(pool);
        (DeltaCollector::new(store.clone()), store, temp_dir)
    }

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, secs).unwrap()
    }

    #[tokio::test]
    async fn test_strict_watermark_inclusion_and_exclusion() {
        let (collector, store, _temp) = setup().await;

        store
            .create(EntityType::Bookmark, "b1", &json!({}), "user1", ts(1))
            .await
            .unwrap();
        store
            .create(EntityType::Bookmark, "b2", &json!({}), "user1", ts(2))
            .await
            .unwrap();
        store
            .create(EntityType::Bookmark, "b3", &json!({}), "user1", ts(3))
            .await
            .unwrap();

        // Mutations at t <= watermark are excluded, t > watermark included
        let response = collector
            .get_delta_changes("user1", Some(ts(2)), "device-a")
            .await
            .unwrap();

        let ids: Vec<&str> = response.changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b3"]);
        assert!(!response.has_more);
    }

    #[tokio::test]
    async fn test_no_watermark_returns_full_dataset() {
        let (collector, store, _temp) = setup().await;

        store
            .create(EntityType::Bookmark, "b1", &json!({}), "user1", ts(1))
            .await
            .unwrap();
        store
            .create(EntityType::Tag, "t1", &json!({}), "user1", ts(2))
            .await
            .unwrap();

        let response = collector
            .get_delta_changes("user1", None, "device-a")
            .await
            .unwrap();
        assert_eq!(response.changes.len(), 2);
    }

    #[tokio::test]
    async fn test_merged_sequence_is_globally_time_ordered() {
        let (collector, store, _temp) = setup().await;

        // Interleave mutation times across entity types
        store
            .create(EntityType::Tag, "t1", &json!({}), "user1", ts(2))
            .await
            .unwrap();
        store
            .create(EntityType::Bookmark, "b1", &json!({}), "user1", ts(1))
            .await
            .unwrap();
        store
            .create(EntityType::Reminder, "r1", &json!({}), "user1", ts(4))
            .await
            .unwrap();
        store
            .create(EntityType::Highlight, "h1", &json!({}), "user1", ts(3))
            .await
            .unwrap();

        let response = collector
            .get_delta_changes("user1", None, "device-a")
            .await
            .unwrap();

        let ids: Vec<&str> = response.changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "t1", "h1", "r1"]);

        let timestamps: Vec<_> = response.changes.iter().map(|c| c.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[tokio::test]
    async fn test_action_mapping_per_entity_type() {
        let (collector, store, _temp) = setup().await;

        store
            .create(EntityType::Bookmark, "b1", &json!({}), "user1", ts(1))
            .await
            .unwrap();
        store
            .create(EntityType::Tag, "t1", &json!({}), "user1", ts(2))
            .await
            .unwrap();
        store
            .create(EntityType::Reminder, "r1", &json!({}), "user1", ts(3))
            .await
            .unwrap();

        let response = collector
            .get_delta_changes("user1", None, "device-a")
            .await
            .unwrap();

        for change in &response.changes {
            let expected = match change.entity_type {
                EntityType::Tag | EntityType::Reminder => SyncAction::Create,
                _ => SyncAction::Update,
            };
            assert_eq!(change.action, expected);
        }
    }

    #[tokio::test]
    async fn test_owner_scoping() {
        let (collector, store, _temp) = setup().await;

        store
            .create(EntityType::Bookmark, "theirs", &json!({}), "user2", ts(1))
            .await
            .unwrap();

        let response = collector
            .get_delta_changes("user1", None, "device-a")
            .await
            .unwrap();
        assert!(response.changes.is_empty());
    }

    #[tokio::test]
    async fn test_response_timestamp_is_collection_time() {
        let (collector, _store, _temp) = setup().await;

        let before = Utc::now();
        let response = collector
            .get_delta_changes("user1", None, "device-a")
            .await
            .unwrap();
        let after = Utc::now();

        assert!(response.timestamp >= before && response.timestamp <= after);
    }
}

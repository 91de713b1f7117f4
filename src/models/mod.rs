//! Shared types for the sync engine.
//!
//! A [`SyncEntity`] is one change record: transient, constructed per
//! request/response cycle, never persisted as a row itself. The engine
//! treats payloads as opaque JSON; only the identity, type, action and
//! timestamp fields participate in ordering and conflict arbitration.
//!
//! Wire forms use camelCase field names to match the client protocol.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Entity types the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Bookmark,
    Collection,
    Tag,
    Highlight,
    Reminder,
}

/// Per-type dispatch descriptor.
///
/// Adding a synchronized entity type is a new enum variant plus one
/// `TableSpec` here; the store and collector consult the descriptor instead
/// of switching per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    /// Backing table in the canonical store.
    pub table: &'static str,
    /// Column carrying the mutation timestamp for delta queries.
    pub mutation_column: &'static str,
    /// Action reported for rows observed within a delta window.
    ///
    /// Timestamp-bearing types report `Update`; append-only types (tags,
    /// reminders) lack a meaningful "last modified" and report `Create`
    /// whenever first observed.
    pub delta_action: SyncAction,
}

const BOOKMARKS: TableSpec = TableSpec {
    table: "bookmarks",
    mutation_column: "updated_at",
    delta_action: SyncAction::Update,
};

const COLLECTIONS: TableSpec = TableSpec {
    table: "collections",
    mutation_column: "updated_at",
    delta_action: SyncAction::Update,
};

const TAGS: TableSpec = TableSpec {
    table: "tags",
    mutation_column: "created_at",
    delta_action: SyncAction::Create,
};

const HIGHLIGHTS: TableSpec = TableSpec {
    table: "highlights",
    mutation_column: "updated_at",
    delta_action: SyncAction::Update,
};

const REMINDERS: TableSpec = TableSpec {
    table: "reminders",
    mutation_column: "created_at",
    delta_action: SyncAction::Create,
};

impl EntityType {
    /// All synchronized entity types, in delta collection order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Bookmark,
        EntityType::Collection,
        EntityType::Tag,
        EntityType::Highlight,
        EntityType::Reminder,
    ];

    /// Returns the dispatch descriptor for this type.
    pub fn spec(&self) -> &'static TableSpec {
        match self {
            EntityType::Bookmark => &BOOKMARKS,
            EntityType::Collection => &COLLECTIONS,
            EntityType::Tag => &TAGS,
            EntityType::Highlight => &HIGHLIGHTS,
            EntityType::Reminder => &REMINDERS,
        }
    }

    /// Returns the wire name for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Bookmark => "bookmark",
            EntityType::Collection => "collection",
            EntityType::Tag => "tag",
            EntityType::Highlight => "highlight",
            EntityType::Reminder => "reminder",
        }
    }

    /// Parse from a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bookmark" => Some(EntityType::Bookmark),
            "collection" => Some(EntityType::Collection),
            "tag" => Some(EntityType::Tag),
            "highlight" => Some(EntityType::Highlight),
            "reminder" => Some(EntityType::Reminder),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action carried by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

/// A single change record, client-submitted or collector-manufactured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntity {
    /// Identifier of the affected domain entity. Globally unique, assigned
    /// before first sync and never reassigned, so creates from different
    /// devices never collide.
    pub id: String,
    pub entity_type: EntityType,
    pub action: SyncAction,
    /// Entity-type-specific attribute set, opaque to the engine.
    pub payload: serde_json::Value,
    /// Mutation time used for ordering and conflict comparison.
    pub timestamp: DateTime<Utc>,
    pub owner_id: String,
}

/// Which side won a last-write-wins comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// The incoming change won and was written.
    Local,
    /// The stored value won; the incoming change was discarded.
    Remote,
}

/// Outcome record for an update arbitrated by last-write-wins. Conflicts
/// are not errors; clients use these for UI reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub entity_id: String,
    pub entity_type: EntityType,
    /// Timestamp carried by the rejected incoming change.
    pub local_timestamp: DateTime<Utc>,
    /// Stored value that won.
    pub remote_timestamp: DateTime<Utc>,
    pub resolution: Resolution,
}

/// A change whose application failed outright. Distinct from a conflict:
/// the write was neither accepted nor arbitrated, and the caller should
/// retry or alert rather than reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFailure {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub error: String,
}

/// Formats a timestamp as fixed-width RFC3339 (millisecond precision, `Z`
/// suffix). Lexicographic comparison of these strings in SQL equals
/// chronological comparison.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored timestamp back into UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_entity_type_parse() {
        assert_eq!(EntityType::parse("bookmark"), Some(EntityType::Bookmark));
        assert_eq!(EntityType::parse("BOOKMARK"), Some(EntityType::Bookmark));
        assert_eq!(EntityType::parse("reminder"), Some(EntityType::Reminder));
        assert_eq!(EntityType::parse("invalid"), None);
    }

    #[test]
    fn test_entity_type_roundtrip() {
        for et in EntityType::ALL {
            assert_eq!(EntityType::parse(et.as_str()), Some(et));
        }
    }

    #[test]
    fn test_table_spec_registry() {
        assert_eq!(EntityType::Bookmark.spec().table, "bookmarks");
        assert_eq!(
            EntityType::Bookmark.spec().delta_action,
            SyncAction::Update
        );
        assert_eq!(EntityType::Tag.spec().delta_action, SyncAction::Create);
        assert_eq!(EntityType::Tag.spec().mutation_column, "created_at");
        assert_eq!(
            EntityType::Reminder.spec().delta_action,
            SyncAction::Create
        );
    }

    #[test]
    fn test_timestamp_format_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let s = format_timestamp(a);
        assert_eq!(s, "2024-01-02T03:04:05.000Z");
        assert_eq!(parse_timestamp(&s).unwrap(), a);
    }

    #[test]
    fn test_timestamp_string_order_is_chronological() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 2).unwrap();
        assert!(format_timestamp(early) < format_timestamp(late));
    }

    #[test]
    fn test_sync_entity_wire_field_names() {
        let entity = SyncEntity {
            id: "b1".to_string(),
            entity_type: EntityType::Bookmark,
            action: SyncAction::Update,
            payload: serde_json::json!({"title": "Foo"}),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            owner_id: "user1".to_string(),
        };
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["entityType"], "bookmark");
        assert_eq!(json["action"], "update");
        assert_eq!(json["ownerId"], "user1");
        assert!(json.get("entity_type").is_none());
    }
}

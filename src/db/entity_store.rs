//! Canonical entity store accessor.
//!
//! Scoped reads and writes per entity type against the durable store. Owns
//! the authoritative `created_at`/`updated_at` mutation timestamps; every
//! operation is scoped by `(owner_id, entity_type, id)`. Payloads pass
//! through as opaque JSON.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{format_timestamp, parse_timestamp, EntityType};

/// Errors that can occur during store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying database error.
    Database(sqlx::Error),
    /// Entity id is empty or contains control characters.
    InvalidEntityId(String),
    /// A stored timestamp failed to parse.
    BadTimestamp(String),
    /// Payload could not be serialized or deserialized.
    Payload(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::InvalidEntityId(id) => write!(f, "Invalid entity id: {:?}", id),
            StoreError::BadTimestamp(s) => write!(f, "Malformed stored timestamp: {:?}", s),
            StoreError::Payload(e) => write!(f, "Payload error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Payload(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e)
    }
}

/// Current stored state of one entity.
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub payload: serde_json::Value,
    pub mutation_timestamp: DateTime<Utc>,
}

/// One row returned by a delta query.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: String,
    pub payload: serde_json::Value,
    pub mutation_timestamp: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CurrentRow {
    payload: String,
    mutation_timestamp: String,
}

#[derive(sqlx::FromRow)]
struct MutatedRow {
    id: String,
    payload: String,
    mutation_timestamp: String,
}

/// Scoped accessor over the canonical relational store.
///
/// Table dispatch goes through the [`EntityType`] registry; the SQL below is
/// built from `TableSpec` fields only, never from caller input.
#[derive(Debug, Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validates an entity id before it reaches a query.
    fn validate_entity_id(id: &str) -> Result<(), StoreError> {
        if id.is_empty() || id.chars().any(char::is_control) {
            return Err(StoreError::InvalidEntityId(id.to_string()));
        }
        Ok(())
    }

    /// Reads the current stored state of an entity.
    ///
    /// Returns `Ok(None)` if the entity does not exist for this owner.
    pub async fn read_current(
        &self,
        entity_type: EntityType,
        id: &str,
        owner_id: &str,
    ) -> Result<Option<StoredEntity>, StoreError> {
        Self::validate_entity_id(id)?;

        let spec = entity_type.spec();
        let sql = format!(
            "SELECT payload, {} AS mutation_timestamp FROM {} WHERE id = ? AND owner_id = ?",
            spec.mutation_column, spec.table
        );

        let row: Option<CurrentRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(StoredEntity {
                payload: serde_json::from_str(&row.payload).map_err(StoreError::Payload)?,
                mutation_timestamp: parse_timestamp(&row.mutation_timestamp)
                    .map_err(|_| StoreError::BadTimestamp(row.mutation_timestamp))?,
            })),
            None => Ok(None),
        }
    }

    /// Inserts an entity. Idempotent on duplicate id: a repeat create for
    /// the same id is a no-op, not an error, so retried create messages are
    /// safe to replay.
    pub async fn create(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &serde_json::Value,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Self::validate_entity_id(id)?;

        let spec = entity_type.spec();
        let sql = format!(
            "INSERT OR IGNORE INTO {} (id, owner_id, payload, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
            spec.table
        );
        let ts = format_timestamp(now);

        sqlx::query(&sql)
            .bind(id)
            .bind(owner_id)
            .bind(serde_json::to_string(payload).map_err(StoreError::Payload)?)
            .bind(&ts)
            .bind(&ts)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Overwrites an entity's payload and stamps `updated_at` with the
    /// current server time. A no-op (zero rows) if the entity is absent.
    pub async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &serde_json::Value,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Self::validate_entity_id(id)?;

        let spec = entity_type.spec();
        let sql = format!(
            "UPDATE {} SET payload = ?, updated_at = ? WHERE id = ? AND owner_id = ?",
            spec.table
        );

        sqlx::query(&sql)
            .bind(serde_json::to_string(payload).map_err(StoreError::Payload)?)
            .bind(format_timestamp(now))
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Deletes an entity unconditionally, scoped to this owner.
    pub async fn delete(
        &self,
        entity_type: EntityType,
        id: &str,
        owner_id: &str,
    ) -> Result<(), StoreError> {
        Self::validate_entity_id(id)?;

        let spec = entity_type.spec();
        let sql = format!("DELETE FROM {} WHERE id = ? AND owner_id = ?", spec.table);

        sqlx::query(&sql)
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Lists rows mutated strictly after the watermark, ascending by
    /// mutation timestamp. With no watermark, returns every row for the
    /// owner.
    pub async fn list_mutated_since(
        &self,
        entity_type: EntityType,
        owner_id: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<EntityRow>, StoreError> {
        let spec = entity_type.spec();

        let rows: Vec<MutatedRow> = match watermark {
            Some(watermark) => {
                let sql = format!(
                    "SELECT id, payload, {col} AS mutation_timestamp FROM {table} \
                     WHERE owner_id = ? AND {col} > ? ORDER BY {col} ASC",
                    col = spec.mutation_column,
                    table = spec.table
                );
                sqlx::query_as(&sql)
                    .bind(owner_id)
                    .bind(format_timestamp(watermark))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT id, payload, {col} AS mutation_timestamp FROM {table} \
                     WHERE owner_id = ? ORDER BY {col} ASC",
                    col = spec.mutation_column,
                    table = spec.table
                );
                sqlx::query_as(&sql)
                    .bind(owner_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter()
            .map(|row| {
                Ok(EntityRow {
                    payload: serde_json::from_str(&row.payload).map_err(StoreError::Payload)?,
                    mutation_timestamp: parse_timestamp(&row.mutation_timestamp)
                        .map_err(|_| StoreError::BadTimestamp(row.mutation_timestamp))?,
                    id: row.id,
                })
            })
            .collect()
    }
}

//! SQLite-backed history store.
//!
//! Same contract as the JSONL backend without rotation. Destination ids are
//! Discord snowflakes, which fit in SQLite's signed 64-bit integers.

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    relay_common::{DestChannelId, SourceChannelId, SourceMessageId},
    sqlx::SqlitePool,
};

use crate::{
    Error, Result,
    model::{Checkpoint, FailedForward, Mapping, check_advance},
    store::HistoryStore,
};

#[derive(sqlx::FromRow)]
struct MappingRow {
    source_channel_id: i64,
    source_message_id: i64,
    destination_channel_id: i64,
    destination_message_id: i64,
    created_at: i64,
}

impl From<MappingRow> for Mapping {
    fn from(r: MappingRow) -> Self {
        Self {
            source_channel_id: r.source_channel_id,
            source_message_id: r.source_message_id,
            destination_channel_id: r.destination_channel_id as u64,
            destination_message_id: r.destination_message_id as u64,
            created_at: from_ms(r.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    source_channel_id: i64,
    last_processed_source_message_id: i64,
    last_processed_at: i64,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(r: CheckpointRow) -> Self {
        Self {
            source_channel_id: r.source_channel_id,
            last_processed_source_message_id: r.last_processed_source_message_id,
            last_processed_at: from_ms(r.last_processed_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FailedRow {
    forwarder: String,
    source_channel_id: i64,
    source_message_id: i64,
    destination_channel_id: i64,
    reason: String,
    at: i64,
}

impl From<FailedRow> for FailedForward {
    fn from(r: FailedRow) -> Self {
        Self {
            forwarder: r.forwarder,
            source_channel_id: r.source_channel_id,
            source_message_id: r.source_message_id,
            destination_channel_id: r.destination_channel_id as u64,
            reason: r.reason,
            at: from_ms(r.at),
        }
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` (e.g. `sqlite://relay.db?mode=rwc`) and create the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(url).await?;
        Self::init(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Create tables if they do not exist.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS message_mappings (
                source_channel_id      INTEGER NOT NULL,
                source_message_id      INTEGER NOT NULL,
                destination_channel_id INTEGER NOT NULL,
                destination_message_id INTEGER NOT NULL,
                created_at             INTEGER NOT NULL,
                PRIMARY KEY (source_channel_id, source_message_id, destination_channel_id)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                source_channel_id                INTEGER PRIMARY KEY,
                last_processed_source_message_id INTEGER NOT NULL,
                last_processed_at                INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS failed_forwards (
                id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                forwarder              TEXT    NOT NULL,
                source_channel_id      INTEGER NOT NULL,
                source_message_id      INTEGER NOT NULL,
                destination_channel_id INTEGER NOT NULL,
                reason                 TEXT    NOT NULL,
                at                     INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn record_mapping(&self, mapping: &Mapping) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO message_mappings
                (source_channel_id, source_message_id, destination_channel_id,
                 destination_message_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(mapping.source_channel_id)
        .bind(mapping.source_message_id)
        .bind(mapping.destination_channel_id as i64)
        .bind(mapping.destination_message_id as i64)
        .bind(mapping.created_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(Error::Conflict {
                source_channel_id: mapping.source_channel_id,
                source_message_id: mapping.source_message_id,
                destination_channel_id: mapping.destination_channel_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup_destination(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> Result<Option<Mapping>> {
        let row = sqlx::query_as::<_, MappingRow>(
            "SELECT * FROM message_mappings
             WHERE source_channel_id = ? AND source_message_id = ? AND destination_channel_id = ?",
        )
        .bind(source_channel_id)
        .bind(source_message_id)
        .bind(destination_channel_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn remove_mapping(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> Result<Option<Mapping>> {
        let row = sqlx::query_as::<_, MappingRow>(
            "DELETE FROM message_mappings
             WHERE source_channel_id = ? AND source_message_id = ? AND destination_channel_id = ?
             RETURNING *",
        )
        .bind(source_channel_id)
        .bind(source_message_id)
        .bind(destination_channel_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn mappings_for(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
    ) -> Result<Vec<Mapping>> {
        let rows = sqlx::query_as::<_, MappingRow>(
            "SELECT * FROM message_mappings
             WHERE source_channel_id = ? AND source_message_id = ?
             ORDER BY destination_channel_id",
        )
        .bind(source_channel_id)
        .bind(source_message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_checkpoint(
        &self,
        source_channel_id: SourceChannelId,
    ) -> Result<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE source_channel_id = ?",
        )
        .bind(source_channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn advance_checkpoint(
        &self,
        source_channel_id: SourceChannelId,
        message_id: SourceMessageId,
        at: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE source_channel_id = ?",
        )
        .bind(source_channel_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(Checkpoint::from);
        check_advance(current.as_ref(), source_channel_id, message_id)?;

        sqlx::query(
            "INSERT INTO checkpoints (source_channel_id, last_processed_source_message_id, last_processed_at)
             VALUES (?, ?, ?)
             ON CONFLICT(source_channel_id) DO UPDATE SET
                last_processed_source_message_id = excluded.last_processed_source_message_id,
                last_processed_at = excluded.last_processed_at",
        )
        .bind(source_channel_id)
        .bind(message_id)
        .bind(at.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Checkpoint {
            source_channel_id,
            last_processed_source_message_id: message_id,
            last_processed_at: from_ms(at.timestamp_millis()),
        })
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints ORDER BY source_channel_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn record_failed_forward(&self, failed: &FailedForward) -> Result<()> {
        sqlx::query(
            "INSERT INTO failed_forwards
                (forwarder, source_channel_id, source_message_id, destination_channel_id, reason, at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&failed.forwarder)
        .bind(failed.source_channel_id)
        .bind(failed.source_message_id)
        .bind(failed.destination_channel_id as i64)
        .bind(&failed.reason)
        .bind(failed.at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_failed_forwards(&self, limit: usize) -> Result<Vec<FailedForward>> {
        let rows = sqlx::query_as::<_, FailedRow>(
            "SELECT forwarder, source_channel_id, source_message_id, destination_channel_id, reason, at
             FROM failed_forwards ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

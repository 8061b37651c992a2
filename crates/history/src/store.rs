use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    relay_common::{DestChannelId, SourceChannelId, SourceMessageId},
};

use crate::{
    Result,
    model::{Checkpoint, FailedForward, Mapping},
};

/// Durable source↔destination mappings plus one checkpoint per source channel.
///
/// Every backend enforces the same two invariants: a mapping key is recorded
/// at most once ([`Error::Conflict`](crate::Error::Conflict)) and a
/// checkpoint only moves forward ([`Error::Regression`](crate::Error::Regression)).
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_mapping(&self, mapping: &Mapping) -> Result<()>;

    async fn lookup_destination(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> Result<Option<Mapping>>;

    /// Remove and return a mapping. `None` when it was not present.
    async fn remove_mapping(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> Result<Option<Mapping>>;

    /// All destinations a source message was delivered to.
    async fn mappings_for(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
    ) -> Result<Vec<Mapping>>;

    async fn get_checkpoint(&self, source_channel_id: SourceChannelId)
    -> Result<Option<Checkpoint>>;

    async fn advance_checkpoint(
        &self,
        source_channel_id: SourceChannelId,
        message_id: SourceMessageId,
        at: DateTime<Utc>,
    ) -> Result<Checkpoint>;

    /// Checkpoints of every known channel, ordered by channel id.
    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>>;

    async fn record_failed_forward(&self, failed: &FailedForward) -> Result<()>;

    /// Most recent failed forwards first.
    async fn list_failed_forwards(&self, limit: usize) -> Result<Vec<FailedForward>>;

    /// Archive the current segment now. Returns `false` for backends that do
    /// not rotate.
    async fn rotate(&self) -> Result<bool> {
        Ok(false)
    }
}

use {
    chrono::{DateTime, Utc},
    relay_common::{DestChannelId, DestMessageId, SourceChannelId, SourceMessageId},
    serde::{Deserialize, Serialize},
};

/// Unique key of a [`Mapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingKey {
    pub source_channel_id: SourceChannelId,
    pub source_message_id: SourceMessageId,
    pub destination_channel_id: DestChannelId,
}

impl MappingKey {
    #[must_use]
    pub fn new(
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> Self {
        Self {
            source_channel_id,
            source_message_id,
            destination_channel_id,
        }
    }
}

/// Which sink message a source message was delivered as.
///
/// Written once after a successful forward and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub source_channel_id: SourceChannelId,
    pub source_message_id: SourceMessageId,
    pub destination_channel_id: DestChannelId,
    pub destination_message_id: DestMessageId,
    pub created_at: DateTime<Utc>,
}

impl Mapping {
    #[must_use]
    pub fn key(&self) -> MappingKey {
        MappingKey::new(
            self.source_channel_id,
            self.source_message_id,
            self.destination_channel_id,
        )
    }
}

/// Highest source message id fully processed on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_channel_id: SourceChannelId,
    pub last_processed_source_message_id: SourceMessageId,
    pub last_processed_at: DateTime<Utc>,
}

/// A message that could not be delivered after all retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedForward {
    pub forwarder: String,
    pub source_channel_id: SourceChannelId,
    pub source_message_id: SourceMessageId,
    pub destination_channel_id: DestChannelId,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Fails with [`Error::Regression`](crate::Error::Regression) unless
/// `attempted` is strictly greater than the stored id.
pub(crate) fn check_advance(
    current: Option<&Checkpoint>,
    channel: SourceChannelId,
    attempted: SourceMessageId,
) -> crate::Result<()> {
    match current {
        Some(cp) if attempted <= cp.last_processed_source_message_id => {
            Err(crate::Error::Regression {
                channel,
                stored: cp.last_processed_source_message_id,
                attempted,
            })
        },
        _ => Ok(()),
    }
}

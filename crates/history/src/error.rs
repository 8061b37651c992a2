use {
    relay_common::{DestChannelId, SourceChannelId, SourceMessageId},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
    /// A mapping with the same (source channel, source message, destination
    /// channel) key already exists.
    #[error(
        "mapping already recorded for {source_channel_id}/{source_message_id} -> {destination_channel_id}"
    )]
    Conflict {
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    },

    /// A checkpoint may only move forward.
    #[error("checkpoint regression on channel {channel}: stored {stored}, attempted {attempted}")]
    Regression {
        channel: SourceChannelId,
        stored: SourceMessageId,
        attempted: SourceMessageId,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error("file lock failed: {message}")]
    Lock { message: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn lock_failed(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn is_regression(&self) -> bool {
        matches!(self, Self::Regression { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

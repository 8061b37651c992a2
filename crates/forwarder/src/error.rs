use {
    relay_channels::{SinkError, SourceError},
    relay_common::SourceChannelId,
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    History(#[from] relay_history::Error),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Source(#[from] SourceError),

    /// Shutdown was requested while waiting to retry.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("unknown source channel {channel}")]
    UnknownChannel { channel: SourceChannelId },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// Mapping conflicts and checkpoint regressions mean the channel's view of
    /// its history is inconsistent. The channel loop is restarted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::History(e) if e.is_conflict() || e.is_regression())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use std::{error::Error as StdError, time::Duration};

/// Errors returned by a [`SinkClient`](crate::SinkClient).
///
/// The variant decides what the pipeline does next: transient errors are
/// retried with backoff, permanent ones are reported as failed forwards and
/// `NotFound` means the destination message is already gone.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Rate limits, timeouts, 5xx. Safe to retry.
    #[error("transient sink error: {message}")]
    Transient {
        message: String,
        /// Server-provided hint, used instead of the computed backoff when longer.
        retry_after: Option<Duration>,
    },

    /// Missing permissions, unknown channel, rejected payload.
    #[error("permanent sink error: {message}")]
    Permanent { message: String },

    /// The destination message no longer exists.
    #[error("destination message not found: {message}")]
    NotFound { message: String },
}

impl SinkError {
    #[must_use]
    pub fn transient(message: impl std::fmt::Display) -> Self {
        Self::Transient {
            message: message.to_string(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn rate_limited(message: impl std::fmt::Display, retry_after: Duration) -> Self {
        Self::Transient {
            message: message.to_string(),
            retry_after: Some(retry_after),
        }
    }

    #[must_use]
    pub fn permanent(message: impl std::fmt::Display) -> Self {
        Self::Permanent {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn not_found(message: impl std::fmt::Display) -> Self {
        Self::NotFound {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors returned by a [`SourceClient`](crate::SourceClient).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The connection dropped; the channel loop reconnects.
    #[error("source disconnected")]
    Disconnected,

    /// Operation is currently unavailable (not configured, channel unknown).
    #[error("source operation unavailable: {message}")]
    Unavailable { message: String },

    /// Wrapped error from the platform client.
    #[error("source operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl SourceError {
    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

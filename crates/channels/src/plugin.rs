use std::pin::Pin;

use {
    async_trait::async_trait,
    futures::Stream,
    relay_common::{DestChannelId, DestMessageId, MediaRef, SourceChannelId, SourceMessageId},
    tokio::sync::mpsc,
};

use crate::{
    error::{SinkError, SourceError},
    event::{RawEvent, SourceUpdate},
};

/// Lazily fetched source history.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<RawEvent, SourceError>> + Send + 'a>>;

// ── Source ──────────────────────────────────────────────────────────────────

/// Read side of the relay (Telegram).
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Start receiving live events for `channel`.
    ///
    /// The receiver closing, or yielding [`SourceUpdate::Disconnected`], means
    /// the subscription is gone and must be re-established.
    async fn subscribe(
        &self,
        channel: SourceChannelId,
    ) -> Result<mpsc::Receiver<SourceUpdate>, SourceError>;

    /// Messages of `channel` with an id strictly greater than `after`, in
    /// ascending id order.
    fn fetch_since(&self, channel: SourceChannelId, after: SourceMessageId) -> EventStream<'_>;

    fn is_connected(&self) -> bool;

    /// Download the bytes behind a media reference.
    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, SourceError>;
}

// ── Sink ────────────────────────────────────────────────────────────────────

/// A file attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Fully rendered content for one sink message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Destination message this one replies to.
    pub reply_to: Option<DestMessageId>,
    /// Render as an embed rather than a plain message.
    pub as_embed: bool,
}

impl OutboundMessage {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Write side of the relay (Discord).
#[async_trait]
pub trait SinkClient: Send + Sync {
    async fn create(
        &self,
        channel: DestChannelId,
        message: &OutboundMessage,
    ) -> Result<DestMessageId, SinkError>;

    async fn edit(
        &self,
        channel: DestChannelId,
        message_id: DestMessageId,
        message: &OutboundMessage,
    ) -> Result<(), SinkError>;

    async fn delete(&self, channel: DestChannelId, message_id: DestMessageId)
    -> Result<(), SinkError>;

    /// Map role names to mention strings usable in `channel`.
    ///
    /// Unknown names are left out of the result.
    async fn resolve_mentions(
        &self,
        channel: DestChannelId,
        names: &[String],
    ) -> Result<Vec<String>, SinkError>;
}

//! Raw events as delivered by a source client, before normalization.

use {
    chrono::{DateTime, Utc},
    relay_common::{MediaRef, SourceChannelId, SourceMessageId},
    serde::{Deserialize, Serialize},
};

/// Formatting entity kinds the renderer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Hashtag,
    /// Bare URL written in the text.
    Url,
    /// Text with a hidden link target (`url` is set).
    TextUrl,
    Bold,
    Italic,
    Strike,
    Code,
    Pre,
    /// Anything else (mentions, spoilers, ...). Rendered as plain text.
    Other,
}

/// A formatting span over the message text.
///
/// `offset` and `length` count UTF-16 code units, as Telegram does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TextEntity {
    #[must_use]
    pub fn new(kind: EntityKind, offset: usize, length: usize) -> Self {
        Self {
            kind,
            offset,
            length,
            url: None,
        }
    }

    #[must_use]
    pub fn text_url(offset: usize, length: usize, url: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::TextUrl,
            offset,
            length,
            url: Some(url.into()),
        }
    }
}

/// One message as the source platform reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub channel_id: SourceChannelId,
    pub message_id: SourceMessageId,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entities: Vec<TextEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<SourceMessageId>,
}

impl RawMessage {
    /// Plain text message with no entities.
    #[must_use]
    pub fn text(
        channel_id: SourceChannelId,
        message_id: SourceMessageId,
        date: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel_id,
            message_id,
            date,
            text: text.into(),
            entities: Vec::new(),
            media: None,
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawEvent {
    NewMessage(RawMessage),
    Edited(RawMessage),
    /// Telegram batches deletions; all ids belong to `channel_id`.
    Deleted {
        channel_id: SourceChannelId,
        message_ids: Vec<SourceMessageId>,
    },
}

impl RawEvent {
    #[must_use]
    pub fn channel_id(&self) -> SourceChannelId {
        match self {
            Self::NewMessage(m) | Self::Edited(m) => m.channel_id,
            Self::Deleted { channel_id, .. } => *channel_id,
        }
    }
}

/// What a live subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUpdate {
    Event(RawEvent),
    /// The connection dropped. The subscriber should resubscribe and recover.
    Disconnected,
}

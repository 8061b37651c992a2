//! Platform-neutral message model shared by every pipeline stage.

use std::collections::BTreeSet;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// Identifier of a source channel (Telegram channel ids are signed).
pub type SourceChannelId = i64;
/// Source message ids increase monotonically within a channel.
pub type SourceMessageId = i64;
/// Identifier of a destination channel (Discord snowflake).
pub type DestChannelId = u64;
/// Identifier of a delivered message on the sink.
pub type DestMessageId = u64;

/// What happened to the source message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Edit,
    Delete,
}

/// Whether an event arrived on the live subscription or was replayed after a gap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    #[default]
    Live,
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
    Sticker,
    /// Link preview generated by the source; never downloaded.
    WebPage,
}

/// Reference to a piece of media the source client can fetch on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    /// Opaque handle understood by the source client.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl MediaRef {
    /// File name to use when attaching the media on the sink.
    #[must_use]
    pub fn attachment_name(&self) -> String {
        if let Some(name) = &self.file_name {
            return name.clone();
        }
        let ext = match self.kind {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
            MediaKind::Audio => "ogg",
            MediaKind::Sticker => "webp",
            MediaKind::Document | MediaKind::WebPage => "bin",
        };
        format!("{}.{ext}", self.id)
    }
}

/// A labelled hyperlink lifted out of the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRef {
    pub label: String,
    pub url: String,
    /// Byte offset in [`CanonicalMessage::text`] just past the label.
    pub offset: usize,
}

/// Canonical representation of one source event.
///
/// Built once by the normalizer and then only read. `hashtags` are stored
/// lower-cased with their leading `#`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub source_channel_id: SourceChannelId,
    pub source_message_id: SourceMessageId,
    pub timestamp: DateTime<Utc>,
    /// Markdown-rendered body. Link reference markers and the link footer
    /// are added per destination when rendering.
    pub text: String,
    pub hashtags: BTreeSet<String>,
    #[serde(default)]
    pub links: Vec<LinkRef>,
    #[serde(default)]
    pub media_refs: Vec<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_source_id: Option<SourceMessageId>,
    pub event_kind: EventKind,
    #[serde(default)]
    pub origin: MessageOrigin,
}

impl CanonicalMessage {
    /// Case-insensitive hashtag membership; `tag` must include the `#`.
    #[must_use]
    pub fn has_hashtag(&self, tag: &str) -> bool {
        self.hashtags.contains(&tag.to_lowercase())
    }

    #[must_use]
    pub fn is_recovered(&self) -> bool {
        self.origin == MessageOrigin::Recovered
    }
}

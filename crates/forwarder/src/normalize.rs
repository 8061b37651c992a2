//! Raw source events → [`CanonicalMessage`].
//!
//! Entities arrive with UTF-16 offsets. They are converted to byte offsets
//! once and then rendered into Markdown in a single pass: bold, italic,
//! strike, code and pre become delimiters, text links are lifted into
//! [`LinkRef`]s and hashtag entities feed the hashtag set.

use std::{collections::BTreeSet, sync::Arc};

use {
    relay_channels::{EntityKind, RawEvent, RawMessage, TextEntity},
    relay_common::{CanonicalMessage, EventKind, LinkRef, MessageOrigin, SourceChannelId},
    relay_config::RelayConfig,
    relay_routing::{RuleSet, extract_hashtags},
    serde::Serialize,
    tracing::{debug, warn},
};

/// Why an event produced no message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No forwarder is bound to the channel.
    UnhandledChannel,
    EditsDisabled,
    DeletesDisabled,
    /// No text and no media.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// One message per affected source id (deletes may batch several).
    Messages(Vec<CanonicalMessage>),
    Skip(SkipReason),
}

/// Pure conversion from [`RawEvent`] to [`CanonicalMessage`].
#[derive(Clone)]
pub struct Normalizer {
    rules: Arc<RuleSet>,
    log_unhandled_sources: bool,
    subscribe_to_edits: bool,
    subscribe_to_deletes: bool,
}

impl Normalizer {
    #[must_use]
    pub fn new(rules: Arc<RuleSet>, config: &RelayConfig) -> Self {
        Self {
            rules,
            log_unhandled_sources: config.logging.log_unhandled_sources,
            subscribe_to_edits: config.source.subscribe_to_edits,
            subscribe_to_deletes: config.source.subscribe_to_deletes,
        }
    }

    pub fn normalize(&self, event: &RawEvent, origin: MessageOrigin) -> Normalized {
        let channel = event.channel_id();
        if !self.rules.is_bound(channel) {
            self.log_unhandled(channel);
            return Normalized::Skip(SkipReason::UnhandledChannel);
        }

        match event {
            RawEvent::NewMessage(raw) => self.from_raw(raw, EventKind::Create, origin),
            RawEvent::Edited(raw) => {
                if !self.subscribe_to_edits {
                    return Normalized::Skip(SkipReason::EditsDisabled);
                }
                self.from_raw(raw, EventKind::Edit, origin)
            },
            RawEvent::Deleted {
                channel_id,
                message_ids,
            } => {
                if !self.subscribe_to_deletes {
                    return Normalized::Skip(SkipReason::DeletesDisabled);
                }
                let now = chrono::Utc::now();
                Normalized::Messages(
                    message_ids
                        .iter()
                        .map(|id| CanonicalMessage {
                            source_channel_id: *channel_id,
                            source_message_id: *id,
                            timestamp: now,
                            text: String::new(),
                            hashtags: BTreeSet::new(),
                            links: Vec::new(),
                            media_refs: Vec::new(),
                            reply_to_source_id: None,
                            event_kind: EventKind::Delete,
                            origin,
                        })
                        .collect(),
                )
            },
        }
    }

    fn from_raw(&self, raw: &RawMessage, kind: EventKind, origin: MessageOrigin) -> Normalized {
        if raw.text.trim().is_empty() && raw.media.is_none() {
            debug!(
                source_channel = raw.channel_id,
                message_id = raw.message_id,
                "skipping empty message"
            );
            return Normalized::Skip(SkipReason::Empty);
        }

        let rendered = render_entities(&raw.text, &raw.entities);
        let mut hashtags = extract_hashtags(&raw.text);
        hashtags.extend(rendered.hashtags);

        Normalized::Messages(vec![CanonicalMessage {
            source_channel_id: raw.channel_id,
            source_message_id: raw.message_id,
            timestamp: raw.date,
            text: rendered.text,
            hashtags,
            links: rendered.links,
            media_refs: raw.media.iter().cloned().collect(),
            reply_to_source_id: raw.reply_to,
            event_kind: kind,
            origin,
        }])
    }

    fn log_unhandled(&self, channel: SourceChannelId) {
        if self.log_unhandled_sources {
            warn!(source_channel = channel, "event from channel with no forwarder");
        } else {
            debug!(source_channel = channel, "event from channel with no forwarder");
        }
    }
}

// ── Entity rendering ────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct Rendered {
    text: String,
    links: Vec<LinkRef>,
    hashtags: BTreeSet<String>,
}

fn delimiters(kind: EntityKind) -> Option<(&'static str, &'static str)> {
    match kind {
        EntityKind::Bold => Some(("**", "**")),
        EntityKind::Italic => Some(("*", "*")),
        EntityKind::Strike => Some(("~~", "~~")),
        EntityKind::Code => Some(("`", "`")),
        EntityKind::Pre => Some(("```", "```")),
        _ => None,
    }
}

/// Byte offset for every UTF-16 code unit position in `text`, plus the end.
fn utf16_to_byte_offsets(text: &str) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(text.len() + 1);
    for (byte, ch) in text.char_indices() {
        for _ in 0..ch.len_utf16() {
            offsets.push(byte);
        }
    }
    offsets.push(text.len());
    offsets
}

struct Span<'a> {
    start: usize,
    end: usize,
    entity: &'a TextEntity,
}

fn render_entities(text: &str, entities: &[TextEntity]) -> Rendered {
    if entities.is_empty() {
        return Rendered {
            text: text.to_string(),
            ..Default::default()
        };
    }

    let offsets = utf16_to_byte_offsets(text);
    let to_byte = |unit: usize| offsets.get(unit).copied().unwrap_or(text.len());

    let mut spans: Vec<Span<'_>> = entities
        .iter()
        .filter(|e| e.length > 0)
        .map(|e| Span {
            start: to_byte(e.offset),
            end: to_byte(e.offset.saturating_add(e.length)),
            entity: e,
        })
        .filter(|s| s.start < s.end)
        .collect();
    spans.sort_by_key(|s| (s.start, std::cmp::Reverse(s.end)));

    let mut hashtags = BTreeSet::new();
    for span in spans.iter().filter(|s| s.entity.kind == EntityKind::Hashtag) {
        let tag = &text[span.start..span.end];
        if tag.starts_with('#') {
            hashtags.insert(tag.to_lowercase());
        }
    }

    let mut boundaries: Vec<usize> = spans.iter().flat_map(|s| [s.start, s.end]).collect();
    boundaries.push(text.len());
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut out = String::with_capacity(text.len() + spans.len() * 4);
    let mut links = Vec::new();
    let mut cursor = 0;
    for pos in boundaries {
        out.push_str(&text[cursor..pos]);
        cursor = pos;

        // Close inner spans first: a later start closes earlier.
        for span in spans.iter().rev().filter(|s| s.end == pos) {
            if let Some((_, close)) = delimiters(span.entity.kind) {
                out.push_str(close);
            }
        }
        for span in spans.iter().filter(|s| s.end == pos) {
            if span.entity.kind == EntityKind::TextUrl
                && let Some(url) = &span.entity.url
            {
                links.push(LinkRef {
                    label: text[span.start..span.end].to_string(),
                    url: url.clone(),
                    offset: out.len(),
                });
            }
        }
        // Open outer spans first: sorted by (start, longest first).
        for span in spans.iter().filter(|s| s.start == pos) {
            if let Some((open, _)) = delimiters(span.entity.kind) {
                out.push_str(open);
            }
        }
    }

    links.sort_by_key(|l| l.offset);
    Rendered {
        text: out,
        links,
        hashtags,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        chrono::{DateTime, Utc},
        relay_common::{MediaKind, MediaRef},
        relay_config::ForwarderConfig,
        rstest::rstest,
    };

    fn normalizer(config: RelayConfig) -> Normalizer {
        let rules = Arc::new(RuleSet::from_config(&config));
        Normalizer::new(rules, &config)
    }

    fn bound() -> RelayConfig {
        RelayConfig {
            forwarders: vec![ForwarderConfig::new("news", -1001, 42)],
            ..Default::default()
        }
    }

    fn date() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn one(n: Normalized) -> CanonicalMessage {
        match n {
            Normalized::Messages(mut v) if v.len() == 1 => v.remove(0),
            other => panic!("expected one message, got {other:?}"),
        }
    }

    #[rstest]
    #[case::bold("hello world", vec![TextEntity::new(EntityKind::Bold, 6, 5)], "hello **world**")]
    #[case::nested(
        "abc",
        vec![TextEntity::new(EntityKind::Bold, 0, 3), TextEntity::new(EntityKind::Italic, 1, 1)],
        "**a*b*c**"
    )]
    #[case::same_span(
        "ab",
        vec![TextEntity::new(EntityKind::Bold, 0, 2), TextEntity::new(EntityKind::Strike, 0, 2)],
        "**~~ab~~**"
    )]
    #[case::code("run ls now", vec![TextEntity::new(EntityKind::Code, 4, 2)], "run `ls` now")]
    #[case::pre("x\ny", vec![TextEntity::new(EntityKind::Pre, 0, 3)], "```x\ny```")]
    #[case::other_ignored("hi @bob", vec![TextEntity::new(EntityKind::Other, 3, 4)], "hi @bob")]
    fn renders_markdown(
        #[case] text: &str,
        #[case] entities: Vec<TextEntity>,
        #[case] expected: &str,
    ) {
        assert_eq!(render_entities(text, &entities).text, expected);
    }

    #[test]
    fn utf16_offsets_after_emoji() {
        // "😀" is two UTF-16 units and four bytes.
        let text = "😀 big news";
        let entities = vec![TextEntity::new(EntityKind::Bold, 3, 3)];
        assert_eq!(render_entities(text, &entities).text, "😀 **big** news");
    }

    #[test]
    fn text_links_become_refs_in_reading_order() {
        let text = "see docs and blog";
        let entities = vec![
            TextEntity::text_url(13, 4, "https://blog.example"),
            TextEntity::text_url(4, 4, "https://docs.example"),
        ];
        let r = render_entities(text, &entities);
        assert_eq!(r.text, text);
        assert_eq!(r.links.len(), 2);
        assert_eq!(r.links[0].label, "docs");
        assert_eq!(r.links[0].offset, 8);
        assert_eq!(r.links[1].url, "https://blog.example");
        assert_eq!(r.links[1].offset, 17);
    }

    #[test]
    fn bold_link_marker_goes_after_closing_delimiter() {
        let text = "click here";
        let entities = vec![
            TextEntity::new(EntityKind::Bold, 6, 4),
            TextEntity::text_url(6, 4, "https://x.example"),
        ];
        let r = render_entities(text, &entities);
        assert_eq!(r.text, "click **here**");
        assert_eq!(r.links[0].offset, r.text.len());
    }

    #[test]
    fn hashtags_from_entities_and_text() {
        let raw = RawMessage {
            entities: vec![TextEntity::new(EntityKind::Hashtag, 0, 5)],
            ..RawMessage::text(-1001, 1, date(), "#Deal today #Hot")
        };
        let msg = one(normalizer(bound()).normalize(&RawEvent::NewMessage(raw), MessageOrigin::Live));
        assert_eq!(
            msg.hashtags.into_iter().collect::<Vec<_>>(),
            vec!["#deal".to_string(), "#hot".to_string()]
        );
    }

    #[test]
    fn unbound_channel_is_skipped() {
        let raw = RawMessage::text(-9, 1, date(), "hello");
        assert_eq!(
            normalizer(bound()).normalize(&RawEvent::NewMessage(raw), MessageOrigin::Live),
            Normalized::Skip(SkipReason::UnhandledChannel)
        );
    }

    #[test]
    fn empty_message_is_skipped_unless_media() {
        let n = normalizer(bound());
        let raw = RawMessage::text(-1001, 1, date(), "  ");
        assert_eq!(
            n.normalize(&RawEvent::NewMessage(raw.clone()), MessageOrigin::Live),
            Normalized::Skip(SkipReason::Empty)
        );
        let with_media = RawMessage {
            media: Some(MediaRef {
                kind: MediaKind::Photo,
                id: "p1".into(),
                file_name: None,
                mime_type: None,
                size_bytes: Some(10),
            }),
            ..raw
        };
        let msg = one(n.normalize(&RawEvent::NewMessage(with_media), MessageOrigin::Recovered));
        assert_eq!(msg.media_refs.len(), 1);
        assert!(msg.is_recovered());
    }

    #[test]
    fn edit_and_delete_switches() {
        let mut config = bound();
        config.source.subscribe_to_edits = false;
        config.source.subscribe_to_deletes = false;
        let n = normalizer(config);
        let edit = RawEvent::Edited(RawMessage::text(-1001, 1, date(), "fixed"));
        let delete = RawEvent::Deleted {
            channel_id: -1001,
            message_ids: vec![1],
        };
        assert_eq!(
            n.normalize(&edit, MessageOrigin::Live),
            Normalized::Skip(SkipReason::EditsDisabled)
        );
        assert_eq!(
            n.normalize(&delete, MessageOrigin::Live),
            Normalized::Skip(SkipReason::DeletesDisabled)
        );
    }

    #[test]
    fn batched_delete_yields_one_message_per_id() {
        let delete = RawEvent::Deleted {
            channel_id: -1001,
            message_ids: vec![3, 4],
        };
        let Normalized::Messages(msgs) = normalizer(bound()).normalize(&delete, MessageOrigin::Live)
        else {
            panic!("expected messages");
        };
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.event_kind == EventKind::Delete));
        assert_eq!(msgs[1].source_message_id, 4);
    }

    #[test]
    fn reply_target_is_kept() {
        let raw = RawMessage {
            reply_to: Some(7),
            ..RawMessage::text(-1001, 8, date(), "answer")
        };
        let msg = one(normalizer(bound()).normalize(&RawEvent::Edited(raw), MessageOrigin::Live));
        assert_eq!(msg.reply_to_source_id, Some(7));
        assert_eq!(msg.event_kind, EventKind::Edit);
    }
}

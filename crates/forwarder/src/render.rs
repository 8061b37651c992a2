//! Per-destination rendering of a [`CanonicalMessage`].
//!
//! The canonical text is shared by every forwarder of a channel; what differs
//! per destination is link handling, mentions and whether media is attached.

use std::sync::{Arc, LazyLock};

use {
    regex::Regex,
    relay_channels::{Attachment, OutboundMessage, SinkClient, SourceClient},
    relay_common::{CanonicalMessage, DestChannelId, MediaKind},
    relay_config::{MediaConfig, RelayConfig},
    relay_routing::Mentions,
    tracing::{debug, warn},
};

#[allow(clippy::expect_used)]
static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("url pattern is valid"));

/// Per-destination options taken from a routing decision.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget<'a> {
    pub destination: DestChannelId,
    pub mentions: &'a Mentions,
    pub strip_links: bool,
    pub as_embed: bool,
    /// Edits reuse the original attachments and skip media.
    pub with_media: bool,
}

pub struct Renderer {
    source: Arc<dyn SourceClient>,
    sink: Arc<dyn SinkClient>,
    media: MediaConfig,
    built_in_roles: Vec<String>,
}

impl Renderer {
    #[must_use]
    pub fn new(
        source: Arc<dyn SourceClient>,
        sink: Arc<dyn SinkClient>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            source,
            sink,
            media: config.media.clone(),
            built_in_roles: config
                .mentions
                .built_in_roles
                .iter()
                .map(|r| r.to_lowercase())
                .collect(),
        }
    }

    pub async fn render(&self, msg: &CanonicalMessage, target: RenderTarget<'_>) -> OutboundMessage {
        let roles = self
            .mention_strings(target.destination, &target.mentions.roles)
            .await;
        let (attachments, placeholders) = if target.with_media {
            self.attachments(msg).await
        } else {
            (Vec::new(), Vec::new())
        };

        let mut lines: Vec<String> = Vec::new();
        if !roles.is_empty() {
            lines.push(roles.join(", "));
        }
        let body = render_text(msg, target.strip_links);
        if !body.is_empty() {
            lines.push(body);
        }
        lines.extend(placeholders);
        if target.mentions.everyone {
            lines.push("@everyone".into());
        }

        OutboundMessage {
            text: lines.join("\n"),
            attachments,
            reply_to: None,
            as_embed: target.as_embed,
        }
    }

    /// Mention strings for `roles` in `destination`, in input order.
    ///
    /// Built-in roles render as `@name` without asking the sink. Names the
    /// sink cannot resolve are dropped.
    pub async fn mention_strings(&self, destination: DestChannelId, roles: &[String]) -> Vec<String> {
        let (built_in, custom): (Vec<&String>, Vec<&String>) = roles
            .iter()
            .partition(|r| self.built_in_roles.contains(&r.to_lowercase()));

        let mut out: Vec<String> = built_in
            .into_iter()
            .map(|r| format!("@{}", r.to_lowercase()))
            .collect();
        if custom.is_empty() {
            return out;
        }

        let names: Vec<String> = custom.into_iter().cloned().collect();
        match self.sink.resolve_mentions(destination, &names).await {
            Ok(resolved) => {
                if resolved.len() < names.len() {
                    debug!(
                        destination_channel = destination,
                        requested = names.len(),
                        resolved = resolved.len(),
                        "some mention roles were not found"
                    );
                }
                out.extend(resolved);
            },
            Err(e) => {
                warn!(
                    destination_channel = destination,
                    error = %e,
                    "failed to resolve mention roles"
                );
            },
        }
        out
    }

    /// Downloaded attachments plus placeholder lines for media left out.
    pub async fn attachments(&self, msg: &CanonicalMessage) -> (Vec<Attachment>, Vec<String>) {
        let max = self.media.max_size_bytes;
        let mut attachments = Vec::new();
        let mut placeholders: Vec<String> = Vec::new();
        let oversize = |placeholders: &mut Vec<String>| {
            if let Some(p) = &self.media.oversize_placeholder
                && !placeholders.contains(p)
            {
                placeholders.push(p.clone());
            }
        };

        for media in &msg.media_refs {
            if media.kind == MediaKind::WebPage {
                continue;
            }
            if media.size_bytes.is_some_and(|size| size > max) {
                debug!(
                    message_id = msg.source_message_id,
                    media = %media.id,
                    "media over size limit, not downloading"
                );
                oversize(&mut placeholders);
                continue;
            }
            match self.source.download_media(media).await {
                Ok(bytes) if bytes.len() as u64 > max => oversize(&mut placeholders),
                Ok(bytes) => attachments.push(Attachment {
                    file_name: media.attachment_name(),
                    bytes,
                }),
                Err(e) => {
                    warn!(
                        source_channel = msg.source_channel_id,
                        message_id = msg.source_message_id,
                        media = %media.id,
                        error = %e,
                        "media download failed, forwarding text only"
                    );
                },
            }
        }
        (attachments, placeholders)
    }
}

/// Canonical text with link handling applied.
///
/// Text links get a ` [n]` marker after their label and a `Links:` footer.
/// With `strip_links` the markers and footer are left out and bare URLs are
/// removed from the body.
#[must_use]
pub fn render_text(msg: &CanonicalMessage, strip_links: bool) -> String {
    if strip_links {
        return BARE_URL.replace_all(&msg.text, "").trim().to_string();
    }
    if msg.links.is_empty() {
        return msg.text.clone();
    }

    let text = &msg.text;
    let mut out = String::with_capacity(text.len() + msg.links.len() * 48);
    let mut cursor = 0;
    for (n, link) in msg.links.iter().enumerate() {
        let at = link.offset.clamp(cursor, text.len());
        if text.is_char_boundary(at) {
            out.push_str(&text[cursor..at]);
            cursor = at;
        }
        out.push_str(&format!(" [{}]", n + 1));
    }
    out.push_str(&text[cursor..]);

    out.push_str("\n\nLinks:");
    for (n, link) in msg.links.iter().enumerate() {
        out.push_str(&format!("\n[{}] {}: {}", n + 1, link.label, link.url));
    }
    out
}

//! Near-duplicate suppression per source channel.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use {
    chrono::{DateTime, Utc},
    relay_common::{CanonicalMessage, SourceChannelId},
    relay_config::AntiSpamConfig,
    serde::Serialize,
    sha2::{Digest, Sha256},
    tracing::debug,
};

/// Window statistics for one source channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Fingerprints currently held in the window.
    pub retained: usize,
    pub checked: u64,
    pub suppressed: u64,
}

#[derive(Debug)]
struct Fingerprint {
    digest: [u8; 32],
    normalized: String,
    first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ChannelWindow {
    entries: VecDeque<Fingerprint>,
    checked: u64,
    suppressed: u64,
}

impl ChannelWindow {
    fn evict(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        self.entries
            .retain(|fp| (now - fp.first_seen_at).abs() <= window);
    }
}

/// Remembers recent message texts and flags repeats within a rolling window.
///
/// The message timestamp is the clock, so replayed messages compare against
/// each other the way they did when first posted.
pub struct Deduplicator {
    enabled: bool,
    window: chrono::Duration,
    threshold: f64,
    max_entries: usize,
    channels: Mutex<HashMap<SourceChannelId, ChannelWindow>>,
}

impl Deduplicator {
    #[must_use]
    pub fn new(config: &AntiSpamConfig) -> Self {
        let window = chrono::Duration::from_std(Duration::from_secs(config.window_secs))
            .unwrap_or(chrono::Duration::MAX);
        Self {
            enabled: config.enabled,
            window,
            threshold: config.similarity_threshold.clamp(0.0, 1.0),
            max_entries: config.max_entries_per_channel.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when `msg` repeats a retained message.
    ///
    /// Nothing is retained here: the caller [`remember`](Self::remember)s a
    /// message once it has been delivered, so a message whose delivery failed
    /// is not suppressed when it is replayed.
    pub fn is_duplicate(&self, msg: &CanonicalMessage) -> bool {
        if !self.enabled {
            return false;
        }
        let Some((digest, normalized)) = fingerprint(&msg.text) else {
            return false;
        };

        let mut channels = self.lock();
        let window = channels.entry(msg.source_channel_id).or_default();
        window.evict(msg.timestamp, self.window);
        window.checked += 1;

        let duplicate = window.entries.iter().any(|fp| {
            fp.digest == digest
                || (self.threshold < 1.0 && similar(&fp.normalized, &normalized, self.threshold))
        });
        if duplicate {
            window.suppressed += 1;
            debug!(
                source_channel = msg.source_channel_id,
                message_id = msg.source_message_id,
                "duplicate message suppressed"
            );
        }
        duplicate
    }

    /// Retain `msg` for later checks.
    pub fn remember(&self, msg: &CanonicalMessage) {
        if !self.enabled {
            return;
        }
        let Some((digest, normalized)) = fingerprint(&msg.text) else {
            return;
        };

        let mut channels = self.lock();
        let window = channels.entry(msg.source_channel_id).or_default();
        if window.entries.iter().any(|fp| fp.digest == digest) {
            return;
        }
        window.entries.push_back(Fingerprint {
            digest,
            normalized,
            first_seen_at: msg.timestamp,
        });
        while window.entries.len() > self.max_entries {
            window.entries.pop_front();
        }
    }

    #[must_use]
    pub fn stats(&self) -> BTreeMap<SourceChannelId, DedupStats> {
        self.lock()
            .iter()
            .map(|(channel, w)| {
                (*channel, DedupStats {
                    retained: w.entries.len(),
                    checked: w.checked,
                    suppressed: w.suppressed,
                })
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SourceChannelId, ChannelWindow>> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// `None` for texts with nothing to compare, such as media-only messages.
fn fingerprint(text: &str) -> Option<([u8; 32], String)> {
    let normalized = normalize_text(text);
    if normalized.is_empty() {
        return None;
    }
    let digest = Sha256::digest(normalized.as_bytes()).into();
    Some((digest, normalized))
}

/// Lower-cased with formatting markers dropped and runs of whitespace
/// collapsed to one space.
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| !matches!(c, '*' | '~' | '`'))
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether `1 - levenshtein / longer_len` (over chars) reaches `threshold`.
fn similar(a: &str, b: &str, threshold: f64) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return true;
    }
    // The distance is at least the length difference.
    let shortest = a.len().min(b.len());
    if (shortest as f64) / (longest as f64) < threshold {
        return false;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64 >= threshold
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

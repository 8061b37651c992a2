/// Config schema types (application, anti-spam, delivery, history, forwarders).
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub application: ApplicationConfig,
    pub anti_spam: AntiSpamConfig,
    pub delivery: DeliveryConfig,
    pub history: HistoryConfig,
    pub media: MediaConfig,
    pub mentions: MentionsConfig,
    pub logging: LoggingConfig,
    pub source: SourceConfig,
    pub forwarders: Vec<ForwarderConfig>,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Instance name, used in log lines and metric labels.
    pub name: String,
    /// Pause between replayed messages during recovery, in seconds.
    pub recoverer_delay_secs: f64,
    /// How often a disconnected source is checked again, in seconds.
    pub healthcheck_interval_secs: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "relay".into(),
            recoverer_delay_secs: 60.0,
            healthcheck_interval_secs: 60,
        }
    }
}

impl ApplicationConfig {
    #[must_use]
    pub fn recoverer_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.recoverer_delay_secs).unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn healthcheck_interval(&self) -> Duration {
        Duration::from_secs(self.healthcheck_interval_secs)
    }
}

/// Near-duplicate suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiSpamConfig {
    pub enabled: bool,
    /// Rolling window during which a fingerprint is retained.
    pub window_secs: u64,
    /// 0.0–1.0, where 1.0 only matches identical normalized text.
    pub similarity_threshold: f64,
    /// Upper bound on retained fingerprints per source channel.
    pub max_entries_per_channel: usize,
}

impl Default for AntiSpamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: 60,
            similarity_threshold: 1.0,
            max_entries_per_channel: 256,
        }
    }
}

/// Sink delivery retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Total attempts per sink call, including the first one.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Failed forwards tolerated during one recovery pass before it is abandoned.
    pub recovery_max_failures: u32,
    /// Sink-side message length limit used when splitting long bodies.
    pub max_message_len: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            recovery_max_failures: 3,
            max_message_len: 2000,
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Which history backend stores mappings and checkpoints.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    /// Append-only JSONL file with size-triggered rotation.
    #[default]
    Json,
    /// SQLite database via sqlx.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub backend: HistoryBackend,
    /// Path of the JSONL store. Defaults to `<data_dir>/history.jsonl`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// sqlx connection URL for the SQLite backend. Defaults to `<data_dir>/history.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_url: Option<String>,
    /// Rotate the JSONL store once it grows past this many bytes (0 disables).
    pub file_max_bytes: u64,
    /// Number of archived segments kept next to the live file.
    pub file_backup_count: u32,
    /// Gzip archived segments.
    pub compress_archives: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Json,
            path: None,
            db_url: None,
            file_max_bytes: 10 * 1024 * 1024,
            file_backup_count: 5,
            compress_archives: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Media larger than this is not attached.
    pub max_size_bytes: u64,
    /// Link appended in place of oversize media, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oversize_placeholder: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 1024 * 1024,
            oversize_placeholder: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MentionsConfig {
    /// Role names the sink treats as built-in (`@everyone`, `@here`).
    pub built_in_roles: Vec<String>,
}

impl Default for MentionsConfig {
    fn default() -> Self {
        Self {
            built_in_roles: vec!["everyone".into(), "here".into()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log events from channels no forwarder listens to at `warn` level.
    pub log_unhandled_sources: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub subscribe_to_edits: bool,
    pub subscribe_to_deletes: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            subscribe_to_edits: true,
            subscribe_to_deletes: true,
        }
    }
}

/// A hashtag entry in `forward_hashtags` / `excluded_hashtags`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashtagConfig {
    /// Tag including the leading `#`.
    pub name: String,
    /// When this tag triggers a forward, mention everyone.
    #[serde(default)]
    pub override_mention_everyone: bool,
}

/// Roles to mention when `tag` is present.
///
/// Tags starting with `#` match message hashtags; anything else matches as a
/// case-insensitive substring of the message text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MentionOverrideConfig {
    pub tag: String,
    pub roles: Vec<String>,
}

/// One source channel → destination channel forwarding rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub name: String,
    pub source_channel_id: i64,
    pub destination_channel_id: u64,
    #[serde(default)]
    pub strip_links: bool,
    #[serde(default = "default_true")]
    pub send_as_embed: bool,
    #[serde(default)]
    pub mention_everyone: bool,
    #[serde(default = "default_true")]
    pub forward_everything: bool,
    #[serde(default)]
    pub forward_hashtags: Vec<HashtagConfig>,
    #[serde(default)]
    pub excluded_hashtags: Vec<HashtagConfig>,
    #[serde(default)]
    pub mention_overrides: Vec<MentionOverrideConfig>,
}

impl ForwarderConfig {
    /// Minimal forwarder that forwards everything.
    #[must_use]
    pub fn new(name: impl Into<String>, source_channel_id: i64, destination_channel_id: u64) -> Self {
        Self {
            name: name.into(),
            source_channel_id,
            destination_channel_id,
            strip_links: false,
            send_as_embed: true,
            mention_everyone: false,
            forward_everything: true,
            forward_hashtags: Vec::new(),
            excluded_hashtags: Vec::new(),
            mention_overrides: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

//! Configuration validation.
//!
//! Parsing alone accepts configs that would misbehave at runtime (a tag that
//! is both forwarded and excluded, two forwarders sharing a hashtag on one
//! channel, ...). These checks surface them as diagnostics before start-up.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use crate::{
    loader::{find_config_file, parse_config},
    schema::{ForwarderConfig, RelayConfig},
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "forwarder", "range"
    pub category: &'static str,
    /// Dotted path, e.g. "forwarders[2].forward_hashtags"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn error(category: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warning(category: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Known keys ──────────────────────────────────────────────────────────────

const SECTIONS: &[(&str, &[&str])] = &[
    (
        "application",
        &["name", "recoverer_delay_secs", "healthcheck_interval_secs"],
    ),
    (
        "anti_spam",
        &[
            "enabled",
            "window_secs",
            "similarity_threshold",
            "max_entries_per_channel",
        ],
    ),
    (
        "delivery",
        &[
            "max_attempts",
            "base_backoff_ms",
            "max_backoff_ms",
            "recovery_max_failures",
            "max_message_len",
        ],
    ),
    (
        "history",
        &[
            "backend",
            "path",
            "db_url",
            "file_max_bytes",
            "file_backup_count",
            "compress_archives",
        ],
    ),
    ("media", &["max_size_bytes", "oversize_placeholder"]),
    ("mentions", &["built_in_roles"]),
    ("logging", &["log_unhandled_sources"]),
    ("source", &["subscribe_to_edits", "subscribe_to_deletes"]),
];

const FORWARDER_KEYS: &[&str] = &[
    "name",
    "source_channel_id",
    "destination_channel_id",
    "strip_links",
    "send_as_embed",
    "mention_everyone",
    "forward_everything",
    "forward_hashtags",
    "excluded_hashtags",
    "mention_overrides",
];

/// Compute the Levenshtein edit distance between two strings (by chars).
fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

fn unknown_key(path: String, key: &str, candidates: &[&str]) -> Diagnostic {
    let message = match suggest(key, candidates) {
        Some(hint) => format!("unknown field \"{key}\" (did you mean \"{hint}\"?)"),
        None => format!("unknown field \"{key}\""),
    };
    Diagnostic::warning("unknown-field", path, message)
}

fn check_unknown_fields(value: &serde_json::Value, diagnostics: &mut Vec<Diagnostic>) {
    let Some(root) = value.as_object() else {
        return;
    };
    let mut top_level: Vec<&str> = SECTIONS.iter().map(|(name, _)| *name).collect();
    top_level.push("forwarders");

    for (key, section) in root {
        if key == "forwarders" {
            for (i, fwd) in section.as_array().into_iter().flatten().enumerate() {
                for field in fwd.as_object().into_iter().flat_map(|o| o.keys()) {
                    if !FORWARDER_KEYS.contains(&field.as_str()) {
                        diagnostics.push(unknown_key(
                            format!("forwarders[{i}].{field}"),
                            field,
                            FORWARDER_KEYS,
                        ));
                    }
                }
            }
            continue;
        }
        let Some((_, fields)) = SECTIONS.iter().find(|(name, _)| name == key) else {
            diagnostics.push(unknown_key(key.clone(), key, &top_level));
            continue;
        };
        for field in section.as_object().into_iter().flat_map(|o| o.keys()) {
            if !fields.contains(&field.as_str()) {
                diagnostics.push(unknown_key(format!("{key}.{field}"), field, fields));
            }
        }
    }
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or the discovered default.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path.map(Path::to_path_buf).or_else(find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::error(
                "syntax",
                "",
                "no config file found",
            )],
            config_path: None,
        };
    };

    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(content) => validate_str(&crate::env_subst::substitute_env(&content), &actual_path),
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::error(
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate raw config text; `path` only selects the format by extension.
#[must_use]
pub fn validate_str(raw: &str, path: &Path) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let untyped: Result<serde_json::Value, String> = match ext {
        "toml" => toml::from_str::<toml::Value>(raw)
            .map_err(|e| e.to_string())
            .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| e.to_string()),
        "json" => serde_json::from_str(raw).map_err(|e| e.to_string()),
        other => Err(format!("unsupported config format: .{other}")),
    };
    match untyped {
        Ok(value) => check_unknown_fields(&value, &mut diagnostics),
        Err(e) => {
            diagnostics.push(Diagnostic::error("syntax", "", format!("syntax error: {e}")));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    }

    match parse_config(raw, path) {
        Ok(config) => diagnostics.extend(validate_config(&config)),
        Err(e) => diagnostics.push(Diagnostic::error(
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Semantic checks on an already-parsed config.
#[must_use]
pub fn validate_config(config: &RelayConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    check_ranges(config, &mut diagnostics);

    if config.forwarders.is_empty() {
        diagnostics.push(Diagnostic::warning(
            "forwarder",
            "forwarders",
            "no forwarders configured; nothing will be relayed",
        ));
    }

    let mut names = HashSet::new();
    let mut pairs = HashSet::new();
    for (i, fwd) in config.forwarders.iter().enumerate() {
        let path = format!("forwarders[{i}]");
        if fwd.name.trim().is_empty() {
            diagnostics.push(Diagnostic::error(
                "forwarder",
                format!("{path}.name"),
                "forwarder name must not be empty",
            ));
        } else if !names.insert(fwd.name.as_str()) {
            diagnostics.push(Diagnostic::error(
                "forwarder",
                format!("{path}.name"),
                format!("duplicate forwarder name \"{}\"", fwd.name),
            ));
        }
        if !pairs.insert((fwd.source_channel_id, fwd.destination_channel_id)) {
            diagnostics.push(Diagnostic::error(
                "forwarder",
                path.clone(),
                format!(
                    "forwarder combination ({}, {}) is duplicated",
                    fwd.source_channel_id, fwd.destination_channel_id
                ),
            ));
        }
        check_forwarder(fwd, &path, &mut diagnostics);
    }

    check_shared_hashtags(config, &mut diagnostics);
    diagnostics
}

fn check_ranges(config: &RelayConfig, diagnostics: &mut Vec<Diagnostic>) {
    let threshold = config.anti_spam.similarity_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        diagnostics.push(Diagnostic::error(
            "range",
            "anti_spam.similarity_threshold",
            format!("must be between 0 and 1, got {threshold}"),
        ));
    }
    if config.anti_spam.enabled && config.anti_spam.window_secs == 0 {
        diagnostics.push(Diagnostic::error(
            "range",
            "anti_spam.window_secs",
            "must be > 0 when anti-spam is enabled",
        ));
    }
    let delay = config.application.recoverer_delay_secs;
    if !delay.is_finite() || !(0.0..=3600.0).contains(&delay) {
        diagnostics.push(Diagnostic::error(
            "range",
            "application.recoverer_delay_secs",
            format!("must be between 0 and 3600, got {delay}"),
        ));
    }
    if config.delivery.max_attempts == 0 {
        diagnostics.push(Diagnostic::error(
            "range",
            "delivery.max_attempts",
            "must be at least 1",
        ));
    }
    if config.delivery.base_backoff_ms > config.delivery.max_backoff_ms {
        diagnostics.push(Diagnostic::warning(
            "range",
            "delivery.base_backoff_ms",
            "base backoff exceeds max backoff; every retry waits max_backoff_ms",
        ));
    }
    if config.delivery.max_message_len == 0 {
        diagnostics.push(Diagnostic::error(
            "range",
            "delivery.max_message_len",
            "must be at least 1",
        ));
    }
}

fn check_forwarder(fwd: &ForwarderConfig, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    if !fwd.forward_everything && fwd.forward_hashtags.is_empty() {
        diagnostics.push(Diagnostic::error(
            "forwarder",
            format!("{path}.forward_everything"),
            "forward_everything must be true if forward_hashtags are not set",
        ));
    }

    for (field, tags) in [
        ("forward_hashtags", &fwd.forward_hashtags),
        ("excluded_hashtags", &fwd.excluded_hashtags),
    ] {
        for tag in tags {
            if !tag.name.starts_with('#') {
                diagnostics.push(Diagnostic::error(
                    "forwarder",
                    format!("{path}.{field}"),
                    format!("hashtag \"{}\" must start with #", tag.name),
                ));
            }
        }
    }

    let excluded: HashSet<String> = fwd
        .excluded_hashtags
        .iter()
        .map(|t| t.name.to_lowercase())
        .collect();
    for tag in &fwd.forward_hashtags {
        if excluded.contains(&tag.name.to_lowercase()) {
            diagnostics.push(Diagnostic::error(
                "forwarder",
                format!("{path}.excluded_hashtags"),
                format!(
                    "\"{}\" is both forwarded and excluded; exclusion would always win",
                    tag.name
                ),
            ));
        }
    }

    for (i, ov) in fwd.mention_overrides.iter().enumerate() {
        if ov.tag.trim().is_empty() {
            diagnostics.push(Diagnostic::error(
                "forwarder",
                format!("{path}.mention_overrides[{i}].tag"),
                "mention override tag must not be empty",
            ));
        }
        if ov.roles.is_empty() {
            diagnostics.push(Diagnostic::error(
                "forwarder",
                format!("{path}.mention_overrides[{i}].roles"),
                "mention override roles must not be empty",
            ));
        }
    }
    if fwd.mention_everyone && !fwd.mention_overrides.is_empty() {
        diagnostics.push(Diagnostic::warning(
            "forwarder",
            format!("{path}.mention_overrides"),
            "mention_everyone is ignored for messages matching a mention override",
        ));
    }
}

/// Two forwarders on one source channel must not share a forward hashtag,
/// otherwise the same message is forwarded twice.
fn check_shared_hashtags(config: &RelayConfig, diagnostics: &mut Vec<Diagnostic>) {
    let mut seen: HashMap<(i64, String), &str> = HashMap::new();
    for fwd in &config.forwarders {
        for tag in &fwd.forward_hashtags {
            let key = (fwd.source_channel_id, tag.name.to_lowercase());
            match seen.get(&key) {
                Some(other) if *other != fwd.name => {
                    diagnostics.push(Diagnostic::error(
                        "forwarder",
                        "forwarders",
                        format!(
                            "hashtag \"{}\" is shared by forwarders \"{other}\" and \"{}\" on source channel {}",
                            tag.name, fwd.name, fwd.source_channel_id
                        ),
                    ));
                },
                Some(_) => {},
                None => {
                    seen.insert(key, fwd.name.as_str());
                },
            }
        }
    }
}

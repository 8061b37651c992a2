use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{env_subst::substitute_env, schema::RelayConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["relay.toml", "relay.yaml", "relay.yml", "relay.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./relay.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/relay/relay.{toml,yaml,yml,json}` (user-global)
///
/// Unlike a chat gateway, a relay without forwarders has nothing to do, so a
/// missing file is an error rather than a silent default.
pub fn discover_and_load() -> anyhow::Result<(PathBuf, RelayConfig)> {
    let Some(path) = find_config_file() else {
        anyhow::bail!(
            "no config file found (looked for {} in ./ and {})",
            CONFIG_FILENAMES.join(", "),
            config_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "~/.config/relay".into())
        );
    };
    debug!(path = %path.display(), "loading config");
    let cfg = load_config(&path)?;
    Ok((path, cfg))
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/relay/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "relay").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory holding the history store.
///
/// Falls back to `./relay-data` when no home directory can be resolved.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "relay")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("relay-data"))
}

/// Resolved location of the JSONL history file.
pub fn history_path(config: &RelayConfig) -> PathBuf {
    config
        .history
        .path
        .clone()
        .unwrap_or_else(|| data_dir().join("history.jsonl"))
}

/// Resolved sqlx URL of the SQLite history database.
pub fn history_db_url(config: &RelayConfig) -> String {
    config.history.db_url.clone().unwrap_or_else(|| {
        format!(
            "sqlite://{}?mode=rwc",
            data_dir().join("history.db").display()
        )
    })
}

pub(crate) fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RelayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_yaml_and_toml_equivalently() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("relay.toml");
        std::fs::write(
            &toml_path,
            r#"
[anti_spam]
enabled = true

[[forwarders]]
name = "news"
source_channel_id = -1001
destination_channel_id = 42
"#,
        )
        .unwrap();
        let yaml_path = dir.path().join("relay.yaml");
        std::fs::write(
            &yaml_path,
            "anti_spam:\n  enabled: true\nforwarders:\n  - name: news\n    source_channel_id: -1001\n    destination_channel_id: 42\n",
        )
        .unwrap();

        let a = load_config(&toml_path).unwrap();
        let b = load_config(&yaml_path).unwrap();
        assert!(a.anti_spam.enabled && b.anti_spam.enabled);
        assert_eq!(a.forwarders[0].name, b.forwarders[0].name);
        assert_eq!(b.forwarders[0].source_channel_id, -1001);
    }

    #[test]
    fn unsupported_extension_fails() {
        let err = parse_config("", Path::new("relay.ini")).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn explicit_history_path_wins() {
        let mut cfg = RelayConfig::default();
        cfg.history.path = Some(PathBuf::from("/tmp/h.json"));
        assert_eq!(history_path(&cfg), PathBuf::from("/tmp/h.json"));
    }

    #[test]
    fn default_db_url_creates_file() {
        let cfg = RelayConfig::default();
        let url = history_db_url(&cfg);
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("history.db?mode=rwc"));
    }
}

//! Durable history: which sink message each source message became, and how
//! far each source channel has been processed.
//!
//! Two backends implement [`HistoryStore`]: an append-only JSONL file with
//! size rotation ([`JsonHistoryStore`]) and SQLite ([`SqliteHistoryStore`]).

pub mod error;
pub mod json;
pub mod locks;
pub mod model;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

use {
    relay_config::{HistoryBackend, RelayConfig},
    tracing::info,
};

pub use {
    error::{Error, Result},
    json::{JsonHistoryStore, RotationPolicy},
    locks::ChannelLocks,
    model::{Checkpoint, FailedForward, Mapping, MappingKey},
    sqlite::SqliteHistoryStore,
    store::HistoryStore,
};

/// Open the backend selected by `config.history`.
pub async fn open_store(config: &RelayConfig) -> Result<Arc<dyn HistoryStore>> {
    let history = &config.history;
    match history.backend {
        HistoryBackend::Json => {
            let path = relay_config::history_path(config);
            let policy = RotationPolicy {
                max_bytes: history.file_max_bytes,
                backup_count: history.file_backup_count,
                compress: history.compress_archives,
            };
            info!(path = %path.display(), "opening JSONL history store");
            Ok(Arc::new(JsonHistoryStore::open(path, policy).await?))
        },
        HistoryBackend::Sqlite => {
            let url = relay_config::history_db_url(config);
            info!(url = %url, "opening SQLite history store");
            Ok(Arc::new(SqliteHistoryStore::connect(&url).await?))
        },
    }
}

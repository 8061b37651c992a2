//! Append-only JSONL history file with size-triggered rotation.
//!
//! Every write appends one record (`map`, `unmap`, `checkpoint`, `failed`) to
//! the live segment; opening the store replays the segment into memory. When
//! the segment grows past `max_bytes` it is archived as `<file>.1[.gz]`
//! (older archives shift to `.2`, `.3`, ...) and a fresh segment starts with
//! a snapshot of the current checkpoints. Mappings and failed forwards that
//! lived in archived segments are no longer visible to lookups.
//!
//! All channels share one segment, so writes from different channels are
//! serialized behind a single lock that is held across the file append.
//! Deployments with many busy channels should use the SQLite backend, which
//! keeps no store-wide lock in the process.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    fd_lock::RwLock,
    flate2::{Compression, write::GzEncoder},
    relay_common::{DestChannelId, SourceChannelId, SourceMessageId},
    serde::{Deserialize, Serialize},
    tokio::sync::Mutex,
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use relay_metrics::{counter, history as history_metrics};

use crate::{
    Error, Result,
    model::{Checkpoint, FailedForward, Mapping, MappingKey, check_advance},
    store::HistoryStore,
};

/// When and how the live segment is archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate once the segment would grow past this size. `0` never rotates.
    pub max_bytes: u64,
    /// Archived segments kept; `0` discards the old segment outright.
    pub backup_count: u32,
    pub compress: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            backup_count: 5,
            compress: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Map(Mapping),
    Unmap {
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    },
    Checkpoint(Checkpoint),
    Failed(FailedForward),
}

/// In-memory view of the live segment.
#[derive(Default)]
struct Segment {
    mappings: HashMap<MappingKey, Mapping>,
    checkpoints: BTreeMap<SourceChannelId, Checkpoint>,
    failed: Vec<FailedForward>,
    bytes: u64,
    /// Size of the checkpoint snapshot the segment starts with.
    header_bytes: u64,
}

impl Segment {
    fn apply(&mut self, record: Record) {
        match record {
            Record::Map(m) => {
                self.mappings.insert(m.key(), m);
            },
            Record::Unmap {
                source_channel_id,
                source_message_id,
                destination_channel_id,
            } => {
                self.mappings.remove(&MappingKey::new(
                    source_channel_id,
                    source_message_id,
                    destination_channel_id,
                ));
            },
            Record::Checkpoint(cp) => {
                self.checkpoints.insert(cp.source_channel_id, cp);
            },
            Record::Failed(f) => self.failed.push(f),
        }
    }

    fn header(&self) -> Result<String> {
        let mut out = String::new();
        for cp in self.checkpoints.values() {
            out.push_str(&serde_json::to_string(&Record::Checkpoint(cp.clone()))?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// File-backed [`HistoryStore`].
pub struct JsonHistoryStore {
    path: PathBuf,
    policy: RotationPolicy,
    /// One lock for every channel: appends must not interleave in the file.
    segment: Mutex<Segment>,
}

impl JsonHistoryStore {
    /// Open (or create on first write) the segment at `path`.
    pub async fn open(path: impl Into<PathBuf>, policy: RotationPolicy) -> Result<Self> {
        let path = path.into();
        let load_path = path.clone();
        let segment = tokio::task::spawn_blocking(move || load_segment(&load_path)).await??;
        Ok(Self {
            path,
            policy,
            segment: Mutex::new(segment),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the `n`-th archived segment (1 = newest).
    #[must_use]
    pub fn archive_path(&self, n: u32) -> PathBuf {
        archive_path(&self.path, n, self.policy.compress)
    }

    async fn append(&self, segment: &mut Segment, record: Record) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let len = line.len() as u64;

        if self.policy.max_bytes > 0
            && segment.bytes > segment.header_bytes
            && segment.bytes + len > self.policy.max_bytes
        {
            self.rotate_locked(segment).await?;
        }

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line)).await??;
        segment.bytes += len;
        segment.apply(record);
        Ok(())
    }

    async fn rotate_locked(&self, segment: &mut Segment) -> Result<()> {
        let header = segment.header()?;
        let header_bytes = header.len() as u64;
        let path = self.path.clone();
        let policy = self.policy;
        tokio::task::spawn_blocking(move || rotate_files(&path, &policy, &header)).await??;

        info!(
            path = %self.path.display(),
            archived_mappings = segment.mappings.len(),
            "history segment rotated"
        );
        #[cfg(feature = "metrics")]
        counter!(history_metrics::ROTATIONS_TOTAL).increment(1);

        segment.mappings.clear();
        segment.failed.clear();
        segment.bytes = header_bytes;
        segment.header_bytes = header_bytes;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn record_mapping(&self, mapping: &Mapping) -> Result<()> {
        let mut segment = self.segment.lock().await;
        if segment.mappings.contains_key(&mapping.key()) {
            return Err(Error::Conflict {
                source_channel_id: mapping.source_channel_id,
                source_message_id: mapping.source_message_id,
                destination_channel_id: mapping.destination_channel_id,
            });
        }
        self.append(&mut segment, Record::Map(mapping.clone())).await
    }

    async fn lookup_destination(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> Result<Option<Mapping>> {
        let key = MappingKey::new(source_channel_id, source_message_id, destination_channel_id);
        Ok(self.segment.lock().await.mappings.get(&key).cloned())
    }

    async fn remove_mapping(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> Result<Option<Mapping>> {
        let key = MappingKey::new(source_channel_id, source_message_id, destination_channel_id);
        let mut segment = self.segment.lock().await;
        let Some(existing) = segment.mappings.get(&key).cloned() else {
            return Ok(None);
        };
        self.append(&mut segment, Record::Unmap {
            source_channel_id,
            source_message_id,
            destination_channel_id,
        })
        .await?;
        Ok(Some(existing))
    }

    async fn mappings_for(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
    ) -> Result<Vec<Mapping>> {
        let segment = self.segment.lock().await;
        let mut found: Vec<Mapping> = segment
            .mappings
            .values()
            .filter(|m| {
                m.source_channel_id == source_channel_id && m.source_message_id == source_message_id
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| m.destination_channel_id);
        Ok(found)
    }

    async fn get_checkpoint(
        &self,
        source_channel_id: SourceChannelId,
    ) -> Result<Option<Checkpoint>> {
        Ok(self
            .segment
            .lock()
            .await
            .checkpoints
            .get(&source_channel_id)
            .cloned())
    }

    async fn advance_checkpoint(
        &self,
        source_channel_id: SourceChannelId,
        message_id: SourceMessageId,
        at: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let mut segment = self.segment.lock().await;
        check_advance(
            segment.checkpoints.get(&source_channel_id),
            source_channel_id,
            message_id,
        )?;
        let checkpoint = Checkpoint {
            source_channel_id,
            last_processed_source_message_id: message_id,
            last_processed_at: at,
        };
        self.append(&mut segment, Record::Checkpoint(checkpoint.clone()))
            .await?;
        Ok(checkpoint)
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        Ok(self
            .segment
            .lock()
            .await
            .checkpoints
            .values()
            .cloned()
            .collect())
    }

    async fn record_failed_forward(&self, failed: &FailedForward) -> Result<()> {
        let mut segment = self.segment.lock().await;
        self.append(&mut segment, Record::Failed(failed.clone()))
            .await
    }

    async fn list_failed_forwards(&self, limit: usize) -> Result<Vec<FailedForward>> {
        let segment = self.segment.lock().await;
        Ok(segment.failed.iter().rev().take(limit).cloned().collect())
    }

    async fn rotate(&self) -> Result<bool> {
        let mut segment = self.segment.lock().await;
        self.rotate_locked(&mut segment).await?;
        Ok(true)
    }
}

// ── Blocking file helpers ───────────────────────────────────────────────────

fn archive_path(path: &Path, n: u32, compress: bool) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "history.jsonl".into());
    let suffix = if compress { ".gz" } else { "" };
    path.with_file_name(format!("{name}.{n}{suffix}"))
}

fn load_segment(path: &Path) -> Result<Segment> {
    let mut segment = Segment::default();
    if !path.exists() {
        return Ok(segment);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut in_header = true;
    for line in reader.lines() {
        let line = line?;
        let line_bytes = line.len() as u64 + 1;
        segment.bytes += line_bytes;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(trimmed) {
            Ok(record) => {
                if in_header && matches!(record, Record::Checkpoint(_)) {
                    segment.header_bytes += line_bytes;
                } else {
                    in_header = false;
                }
                segment.apply(record);
            },
            Err(e) => {
                warn!(path = %path.display(), "skipping malformed history line: {e}");
            },
        }
    }
    Ok(segment)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut lock = RwLock::new(file);
    let mut guard = lock
        .write()
        .map_err(|e| Error::lock_failed(e.to_string()))?;
    guard.write_all(line.as_bytes())?;
    guard.flush()?;
    Ok(())
}

fn rotate_files(path: &Path, policy: &RotationPolicy, header: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut lock = RwLock::new(file);
    let _guard = lock
        .write()
        .map_err(|e| Error::lock_failed(e.to_string()))?;

    if policy.backup_count > 0 {
        let oldest = archive_path(path, policy.backup_count, policy.compress);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..policy.backup_count).rev() {
            let from = archive_path(path, n, policy.compress);
            if from.exists() {
                fs::rename(&from, archive_path(path, n + 1, policy.compress))?;
            }
        }
        let target = archive_path(path, 1, policy.compress);
        if policy.compress {
            let mut encoder = GzEncoder::new(File::create(&target)?, Compression::default());
            io::copy(&mut File::open(path)?, &mut encoder)?;
            encoder.finish()?;
        } else {
            fs::copy(path, &target)?;
        }
    }

    let tmp = path.with_extension("rotating");
    fs::write(&tmp, header)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

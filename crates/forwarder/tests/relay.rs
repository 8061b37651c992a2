//! End-to-end scenarios over the in-memory source and sink.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    relay_channels::{
        RawEvent, RawMessage, SinkClient, SinkError, SourceClient,
        testing::{MemorySink, MemorySource},
    },
    relay_common::{DestChannelId, SourceChannelId, SourceMessageId},
    relay_config::{ForwarderConfig, HashtagConfig, RelayConfig},
    relay_forwarder::{Bridge, BridgeHandle, ChannelState, Error},
    relay_history::{
        Checkpoint, FailedForward, HistoryStore, JsonHistoryStore, Mapping, RotationPolicy,
    },
    tempfile::TempDir,
};

const CHANNEL: i64 = -1001;
const DEST: u64 = 42;

// ── Harness ──────────────────────────────────────────────────────────────────

struct Relay {
    source: Arc<MemorySource>,
    sink: Arc<MemorySink>,
    store: Arc<dyn HistoryStore>,
    handle: BridgeHandle,
    _dir: TempDir,
}

fn base_config() -> RelayConfig {
    let mut config = RelayConfig {
        forwarders: vec![ForwarderConfig::new("news", CHANNEL, DEST)],
        ..Default::default()
    };
    config.application.recoverer_delay_secs = 0.0;
    config.application.healthcheck_interval_secs = 1;
    config.delivery.base_backoff_ms = 1;
    config.delivery.max_backoff_ms = 5;
    config
}

async fn open_store(dir: &TempDir) -> Arc<dyn HistoryStore> {
    Arc::new(
        JsonHistoryStore::open(dir.path().join("history.jsonl"), RotationPolicy::default())
            .await
            .unwrap(),
    )
}

async fn start_with(config: RelayConfig, source: Arc<MemorySource>, dir: TempDir) -> Relay {
    let store = open_store(&dir).await;
    launch(config, source, store, dir).await
}

async fn launch(
    config: RelayConfig,
    source: Arc<MemorySource>,
    store: Arc<dyn HistoryStore>,
    dir: TempDir,
) -> Relay {
    let sink = Arc::new(MemorySink::new());
    let handle = Bridge::new(
        Arc::new(config),
        Arc::clone(&source) as Arc<dyn SourceClient>,
        Arc::clone(&sink) as Arc<dyn SinkClient>,
        Arc::clone(&store),
    )
    .start();
    let relay = Relay {
        source,
        sink,
        store,
        handle,
        _dir: dir,
    };
    relay.live(CHANNEL).await;
    relay
}

async fn start(config: RelayConfig) -> Relay {
    start_with(
        config,
        Arc::new(MemorySource::new()),
        tempfile::tempdir().unwrap(),
    )
    .await
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn post(id: i64, secs: i64, text: &str) -> RawEvent {
    RawEvent::NewMessage(RawMessage::text(CHANNEL, id, at(secs), text))
}

/// Poll `cond` until it holds or five seconds pass.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

impl Relay {
    async fn live(&self, channel: i64) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.handle.wait_for_state(channel, ChannelState::Live),
        )
        .await
        .expect("channel did not go live")
        .unwrap();
    }

    async fn checkpoint(&self) -> Option<i64> {
        self.handle
            .checkpoint(CHANNEL)
            .await
            .unwrap()
            .map(|c| c.last_processed_source_message_id)
    }

    async fn wait_for_checkpoint(&self, id: i64) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.checkpoint().await.is_none_or(|c| c < id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "checkpoint never reached {id}");
    }
}

/// Delegates to `inner`, but rejects the first mapping of `channel` after
/// [`Self::arm`] as a conflict.
struct ConflictOnce {
    inner: Arc<dyn HistoryStore>,
    channel: SourceChannelId,
    armed: AtomicBool,
}

impl ConflictOnce {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryStore for ConflictOnce {
    async fn record_mapping(&self, mapping: &Mapping) -> relay_history::Result<()> {
        if mapping.source_channel_id == self.channel && self.armed.swap(false, Ordering::SeqCst) {
            return Err(relay_history::Error::Conflict {
                source_channel_id: mapping.source_channel_id,
                source_message_id: mapping.source_message_id,
                destination_channel_id: mapping.destination_channel_id,
            });
        }
        self.inner.record_mapping(mapping).await
    }

    async fn lookup_destination(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> relay_history::Result<Option<Mapping>> {
        self.inner
            .lookup_destination(source_channel_id, source_message_id, destination_channel_id)
            .await
    }

    async fn remove_mapping(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
        destination_channel_id: DestChannelId,
    ) -> relay_history::Result<Option<Mapping>> {
        self.inner
            .remove_mapping(source_channel_id, source_message_id, destination_channel_id)
            .await
    }

    async fn mappings_for(
        &self,
        source_channel_id: SourceChannelId,
        source_message_id: SourceMessageId,
    ) -> relay_history::Result<Vec<Mapping>> {
        self.inner
            .mappings_for(source_channel_id, source_message_id)
            .await
    }

    async fn get_checkpoint(
        &self,
        source_channel_id: SourceChannelId,
    ) -> relay_history::Result<Option<Checkpoint>> {
        self.inner.get_checkpoint(source_channel_id).await
    }

    async fn advance_checkpoint(
        &self,
        source_channel_id: SourceChannelId,
        message_id: SourceMessageId,
        at: DateTime<Utc>,
    ) -> relay_history::Result<Checkpoint> {
        self.inner
            .advance_checkpoint(source_channel_id, message_id, at)
            .await
    }

    async fn list_checkpoints(&self) -> relay_history::Result<Vec<Checkpoint>> {
        self.inner.list_checkpoints().await
    }

    async fn record_failed_forward(&self, failed: &FailedForward) -> relay_history::Result<()> {
        self.inner.record_failed_forward(failed).await
    }

    async fn list_failed_forwards(&self, limit: usize) -> relay_history::Result<Vec<FailedForward>> {
        self.inner.list_failed_forwards(limit).await
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn live_messages_are_forwarded_mapped_and_checkpointed() {
    let relay = start(base_config()).await;
    relay.source.push(post(1, 0, "first")).await;
    relay.source.push(post(2, 1, "second")).await;

    eventually("two deliveries", || relay.sink.texts(DEST).len() == 2).await;
    relay.wait_for_checkpoint(2).await;
    assert_eq!(relay.sink.texts(DEST), vec!["first", "second"]);

    let mapping = relay
        .store
        .lookup_destination(CHANNEL, 2, DEST)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.destination_message_id, 1001);
    assert_eq!(relay.handle.stats()["news"].forwarded, 2);
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn excluded_hashtag_vetoes_forward_everything() {
    let mut config = base_config();
    config.forwarders[0].excluded_hashtags = vec![HashtagConfig {
        name: "#sponsored".into(),
        override_mention_everyone: false,
    }];
    let relay = start(config).await;
    relay.source.push(post(1, 0, "buy now #Sponsored")).await;
    relay.source.push(post(2, 1, "real news")).await;

    relay.wait_for_checkpoint(2).await;
    assert_eq!(relay.sink.texts(DEST), vec!["real news"]);
    assert_eq!(relay.handle.stats()["news"].filtered, 1);
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn hashtag_rules_fan_out_per_destination() {
    let mut config = base_config();
    let mut deals = ForwarderConfig::new("deals", CHANNEL, 43);
    deals.forward_everything = false;
    deals.forward_hashtags = vec![HashtagConfig {
        name: "#deal".into(),
        override_mention_everyone: true,
    }];
    config.forwarders.push(deals);
    let relay = start(config).await;

    relay.source.push(post(1, 0, "weather is fine")).await;
    relay.source.push(post(2, 1, "half price #Deal")).await;

    relay.wait_for_checkpoint(2).await;
    assert_eq!(relay.sink.texts(DEST).len(), 2);
    assert_eq!(relay.sink.texts(43), vec!["half price #Deal\n@everyone"]);
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn near_duplicates_inside_the_window_are_suppressed() {
    let mut config = base_config();
    config.anti_spam.enabled = true;
    config.anti_spam.window_secs = 60;
    let relay = start(config).await;

    relay.source.push(post(1, 0, "Flash sale today")).await;
    relay.source.push(post(2, 30, "flash   SALE today")).await;
    relay.source.push(post(3, 120, "flash sale today")).await;

    relay.wait_for_checkpoint(3).await;
    assert_eq!(relay.sink.texts(DEST).len(), 2);
    assert!(
        relay
            .store
            .lookup_destination(CHANNEL, 2, DEST)
            .await
            .unwrap()
            .is_none()
    );
    let dedup = relay.handle.dedup_stats();
    assert_eq!(dedup[&CHANNEL].suppressed, 1);
    assert_eq!(dedup[&CHANNEL].checked, 3);
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn edits_and_deletes_follow_the_mapping() {
    let relay = start(base_config()).await;
    relay.source.push(post(1, 0, "tpyo")).await;
    relay.wait_for_checkpoint(1).await;

    relay
        .source
        .push(RawEvent::Edited(RawMessage::text(CHANNEL, 1, at(0), "typo")))
        .await;
    eventually("edit", || relay.sink.texts(DEST) == vec!["typo"]).await;

    // Never forwarded, so nothing to edit.
    relay
        .source
        .push(RawEvent::Edited(RawMessage::text(CHANNEL, 9, at(5), "ghost")))
        .await;

    relay
        .source
        .push(RawEvent::Deleted {
            channel_id: CHANNEL,
            message_ids: vec![1],
        })
        .await;
    eventually("delete", || relay.sink.texts(DEST).is_empty()).await;
    eventually("delete stat", || relay.handle.stats()["news"].deleted == 1).await;

    assert!(
        relay
            .store
            .lookup_destination(CHANNEL, 1, DEST)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(relay.handle.stats()["news"].edited, 1);
    assert_eq!(relay.checkpoint().await, Some(1));
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn startup_recovers_the_gap_after_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    open_store(&dir)
        .await
        .advance_checkpoint(CHANNEL, 10, Utc::now())
        .await
        .unwrap();

    let source = Arc::new(MemorySource::new());
    for id in 1..=15 {
        source.push_offline(post(id, id, &format!("m{id}")));
    }
    let relay = start_with(base_config(), source, dir).await;

    assert_eq!(relay.sink.texts(DEST), vec!["m11", "m12", "m13", "m14", "m15"]);
    assert_eq!(relay.checkpoint().await, Some(15));
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn reconnect_replays_messages_missed_while_down() {
    let relay = start(base_config()).await;
    relay.source.push(post(1, 0, "before")).await;
    relay.wait_for_checkpoint(1).await;

    relay.source.disconnect().await;
    relay.source.push_offline(post(2, 1, "during one"));
    relay.source.push_offline(post(3, 2, "during two"));
    eventually("reconnecting", || {
        relay.handle.channel_state(CHANNEL) != Some(ChannelState::Live)
    })
    .await;

    relay.source.reconnect();
    relay.wait_for_checkpoint(3).await;
    relay.live(CHANNEL).await;
    assert_eq!(relay.sink.texts(DEST), vec!["before", "during one", "during two"]);

    relay.source.push(post(4, 3, "after")).await;
    relay.wait_for_checkpoint(4).await;
    assert_eq!(relay.sink.texts(DEST).len(), 4);
    assert!(relay.source.subscribe_count(CHANNEL) >= 2);
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_are_logged_as_failed_forwards() {
    let mut config = base_config();
    config.delivery.max_attempts = 2;
    let relay = start(config).await;
    relay
        .sink
        .fail_next_creates([SinkError::transient("502"), SinkError::transient("502")]);

    relay.source.push(post(1, 0, "lost")).await;
    relay.source.push(post(2, 1, "kept")).await;
    relay.wait_for_checkpoint(2).await;

    assert_eq!(relay.sink.texts(DEST), vec!["kept"]);
    assert_eq!(relay.sink.create_attempts(), 3);
    let failed = relay.store.list_failed_forwards(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].source_message_id, 1);
    assert_eq!(relay.handle.stats()["news"].failed, 1);
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn forced_recovery_runs_on_request() {
    let relay = start(base_config()).await;
    relay.source.push(post(1, 0, "live")).await;
    relay.wait_for_checkpoint(1).await;

    relay.source.push_offline(post(2, 1, "missed"));
    relay.source.push_offline(post(3, 2, "missed too"));
    let report = relay.handle.force_recovery(CHANNEL).await.unwrap();
    assert_eq!(report.replayed, 2);
    assert!(!report.abandoned);
    assert_eq!(relay.sink.texts(DEST).len(), 3);
    assert_eq!(relay.checkpoint().await, Some(3));

    assert!(matches!(
        relay.handle.force_recovery(-5).await,
        Err(Error::UnknownChannel { channel: -5 })
    ));
    relay.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_finishes_in_flight_delivery() {
    let relay = start(base_config()).await;
    relay.sink.set_latency(Duration::from_millis(100));
    relay.source.push(post(1, 0, "slow")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    relay.handle.shutdown().await;

    assert_eq!(relay.sink.texts(DEST), vec!["slow"]);
    assert!(
        relay
            .store
            .lookup_destination(CHANNEL, 1, DEST)
            .await
            .unwrap()
            .is_some()
    );
    assert_eq!(relay.checkpoint().await, Some(1));
    assert_eq!(
        relay.handle.channel_states().into_values().collect::<Vec<_>>(),
        vec![ChannelState::Closed]
    );
}

#[tokio::test]
async fn history_conflict_restarts_only_the_affected_channel() {
    const OTHER: i64 = -2002;
    let mut config = base_config();
    config
        .forwarders
        .push(ForwarderConfig::new("other", OTHER, 43));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ConflictOnce {
        inner: open_store(&dir).await,
        channel: CHANNEL,
        armed: AtomicBool::new(false),
    });
    let relay = launch(
        config,
        Arc::new(MemorySource::new()),
        Arc::clone(&store) as Arc<dyn HistoryStore>,
        dir,
    )
    .await;
    relay.live(OTHER).await;

    relay.source.push(post(1, 0, "a one")).await;
    relay.wait_for_checkpoint(1).await;

    store.arm();
    relay.source.push(post(2, 1, "a two")).await;
    eventually("restart", || {
        relay.handle.channel_state(CHANNEL) != Some(ChannelState::Live)
    })
    .await;

    for (id, text) in [(1, "b one"), (2, "b two")] {
        relay
            .source
            .push(RawEvent::NewMessage(RawMessage::text(OTHER, id, at(id), text)))
            .await;
    }
    eventually("other channel", || relay.sink.texts(43) == vec!["b one", "b two"]).await;
    assert_eq!(relay.handle.channel_state(OTHER), Some(ChannelState::Live));

    // Back live after the restart delay; recovery replays the conflicting message.
    relay.live(CHANNEL).await;
    relay.wait_for_checkpoint(2).await;
    assert!(
        relay
            .store
            .lookup_destination(CHANNEL, 2, DEST)
            .await
            .unwrap()
            .is_some()
    );
    assert_eq!(relay.sink.texts(DEST).last().map(String::as_str), Some("a two"));

    relay.source.push(post(3, 2, "a three")).await;
    relay.wait_for_checkpoint(3).await;
    assert_eq!(relay.handle.stats()["other"].forwarded, 2);
    relay.handle.shutdown().await;
}

//! In-memory source and sink for tests.
//!
//! [`MemorySource`] keeps a per-channel message history that `fetch_since`
//! replays, and forwards pushed events to live subscribers while
//! "connected". [`MemorySink`] stores delivered messages and can be scripted
//! to fail.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    relay_common::{DestChannelId, DestMessageId, MediaRef, SourceChannelId, SourceMessageId},
    tokio::sync::mpsc,
};

use crate::{
    error::{SinkError, SourceError},
    event::{RawEvent, RawMessage, SourceUpdate},
    plugin::{EventStream, OutboundMessage, SinkClient, SourceClient},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Source ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SourceInner {
    history: HashMap<SourceChannelId, BTreeMap<SourceMessageId, RawMessage>>,
    subscribers: HashMap<SourceChannelId, mpsc::Sender<SourceUpdate>>,
    subscribe_calls: HashMap<SourceChannelId, usize>,
    media: HashMap<String, Vec<u8>>,
}

pub struct MemorySource {
    inner: Mutex<SourceInner>,
    connected: AtomicBool,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SourceInner::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Apply `event` to the history and deliver it to the live subscriber.
    pub async fn push(&self, event: RawEvent) {
        let sender = {
            let mut inner = lock(&self.inner);
            apply(&mut inner, &event);
            inner.subscribers.get(&event.channel_id()).cloned()
        };
        if self.is_connected()
            && let Some(tx) = sender
        {
            let _ = tx.send(SourceUpdate::Event(event)).await;
        }
    }

    /// Apply `event` to the history only, as if it happened during an outage.
    pub fn push_offline(&self, event: RawEvent) {
        apply(&mut lock(&self.inner), &event);
    }

    /// Drop every subscription and refuse new ones until [`Self::reconnect`].
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let senders: Vec<_> = lock(&self.inner).subscribers.drain().map(|(_, tx)| tx).collect();
        for tx in senders {
            let _ = tx.send(SourceUpdate::Disconnected).await;
        }
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn add_media(&self, id: impl Into<String>, bytes: Vec<u8>) {
        lock(&self.inner).media.insert(id.into(), bytes);
    }

    /// How many times `subscribe` succeeded for `channel`.
    #[must_use]
    pub fn subscribe_count(&self, channel: SourceChannelId) -> usize {
        lock(&self.inner)
            .subscribe_calls
            .get(&channel)
            .copied()
            .unwrap_or(0)
    }
}

fn apply(inner: &mut SourceInner, event: &RawEvent) {
    match event {
        RawEvent::NewMessage(msg) | RawEvent::Edited(msg) => {
            inner
                .history
                .entry(msg.channel_id)
                .or_default()
                .insert(msg.message_id, msg.clone());
        },
        RawEvent::Deleted {
            channel_id,
            message_ids,
        } => {
            if let Some(history) = inner.history.get_mut(channel_id) {
                for id in message_ids {
                    history.remove(id);
                }
            }
        },
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    async fn subscribe(
        &self,
        channel: SourceChannelId,
    ) -> Result<mpsc::Receiver<SourceUpdate>, SourceError> {
        if !self.is_connected() {
            return Err(SourceError::Disconnected);
        }
        let (tx, rx) = mpsc::channel(256);
        let mut inner = lock(&self.inner);
        inner.subscribers.insert(channel, tx);
        *inner.subscribe_calls.entry(channel).or_default() += 1;
        Ok(rx)
    }

    fn fetch_since(&self, channel: SourceChannelId, after: SourceMessageId) -> EventStream<'_> {
        let events: Vec<Result<RawEvent, SourceError>> = if self.is_connected() {
            lock(&self.inner)
                .history
                .get(&channel)
                .map(|h| {
                    h.range(after.saturating_add(1)..)
                        .map(|(_, m)| Ok(RawEvent::NewMessage(m.clone())))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            vec![Err(SourceError::Disconnected)]
        };
        Box::pin(futures::stream::iter(events))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, SourceError> {
        lock(&self.inner)
            .media
            .get(&media.id)
            .cloned()
            .ok_or_else(|| SourceError::unavailable(format!("unknown media {}", media.id)))
    }
}

// ── Sink ────────────────────────────────────────────────────────────────────

/// A call observed by [`MemorySink`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCall {
    Create {
        channel: DestChannelId,
        id: DestMessageId,
    },
    Edit {
        channel: DestChannelId,
        id: DestMessageId,
    },
    Delete {
        channel: DestChannelId,
        id: DestMessageId,
    },
}

struct SinkInner {
    next_id: DestMessageId,
    messages: BTreeMap<(DestChannelId, DestMessageId), OutboundMessage>,
    calls: Vec<SinkCall>,
    create_failures: VecDeque<SinkError>,
    create_attempts: usize,
    roles: HashMap<String, String>,
    latency: Duration,
}

pub struct MemorySink {
    inner: Mutex<SinkInner>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                next_id: 1000,
                messages: BTreeMap::new(),
                calls: Vec::new(),
                create_failures: VecDeque::new(),
                create_attempts: 0,
                roles: HashMap::new(),
                latency: Duration::ZERO,
            }),
        }
    }

    /// Register a role so `resolve_mentions` can find it.
    #[must_use]
    pub fn with_role(self, name: &str, mention: &str) -> Self {
        lock(&self.inner).roles.insert(name.into(), mention.into());
        self
    }

    /// The next `create` calls fail with these errors, in order.
    pub fn fail_next_creates(&self, errors: impl IntoIterator<Item = SinkError>) {
        lock(&self.inner).create_failures.extend(errors);
    }

    /// Delay every `create` by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.inner).latency = latency;
    }

    /// Messages currently present in `channel`, by ascending id.
    #[must_use]
    pub fn messages(&self, channel: DestChannelId) -> Vec<(DestMessageId, OutboundMessage)> {
        lock(&self.inner)
            .messages
            .iter()
            .filter(|((ch, _), _)| *ch == channel)
            .map(|((_, id), m)| (*id, m.clone()))
            .collect()
    }

    #[must_use]
    pub fn texts(&self, channel: DestChannelId) -> Vec<String> {
        self.messages(channel).into_iter().map(|(_, m)| m.text).collect()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<SinkCall> {
        lock(&self.inner).calls.clone()
    }

    /// Successful and failed `create` calls.
    #[must_use]
    pub fn create_attempts(&self) -> usize {
        lock(&self.inner).create_attempts
    }
}

#[async_trait]
impl SinkClient for MemorySink {
    async fn create(
        &self,
        channel: DestChannelId,
        message: &OutboundMessage,
    ) -> Result<DestMessageId, SinkError> {
        let latency = lock(&self.inner).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut inner = lock(&self.inner);
        inner.create_attempts += 1;
        if let Some(err) = inner.create_failures.pop_front() {
            return Err(err);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.messages.insert((channel, id), message.clone());
        inner.calls.push(SinkCall::Create { channel, id });
        Ok(id)
    }

    async fn edit(
        &self,
        channel: DestChannelId,
        message_id: DestMessageId,
        message: &OutboundMessage,
    ) -> Result<(), SinkError> {
        let mut inner = lock(&self.inner);
        let Some(slot) = inner.messages.get_mut(&(channel, message_id)) else {
            return Err(SinkError::not_found(format!("{channel}/{message_id}")));
        };
        *slot = message.clone();
        inner.calls.push(SinkCall::Edit {
            channel,
            id: message_id,
        });
        Ok(())
    }

    async fn delete(
        &self,
        channel: DestChannelId,
        message_id: DestMessageId,
    ) -> Result<(), SinkError> {
        let mut inner = lock(&self.inner);
        if inner.messages.remove(&(channel, message_id)).is_none() {
            return Err(SinkError::not_found(format!("{channel}/{message_id}")));
        }
        inner.calls.push(SinkCall::Delete {
            channel,
            id: message_id,
        });
        Ok(())
    }

    async fn resolve_mentions(
        &self,
        _channel: DestChannelId,
        names: &[String],
    ) -> Result<Vec<String>, SinkError> {
        let inner = lock(&self.inner);
        Ok(names
            .iter()
            .filter_map(|n| inner.roles.get(n).cloned())
            .collect())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::DateTime, futures::StreamExt};

    fn msg(id: SourceMessageId) -> RawEvent {
        let at = DateTime::from_timestamp(1_700_000_000 + id, 0).unwrap();
        RawEvent::NewMessage(RawMessage::text(-1, id, at, format!("m{id}")))
    }

    #[tokio::test]
    async fn fetch_since_is_exclusive_and_ordered() {
        let source = MemorySource::new();
        for id in [3, 1, 2, 5, 4] {
            source.push_offline(msg(id));
        }
        let ids: Vec<_> = source
            .fetch_since(-1, 2)
            .map(|e| match e.unwrap() {
                RawEvent::NewMessage(m) => m.message_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
            .await;
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn disconnect_closes_subscription() {
        let source = MemorySource::new();
        let mut rx = source.subscribe(-1).await.unwrap();
        source.push(msg(1)).await;
        source.disconnect().await;
        assert_eq!(rx.recv().await, Some(SourceUpdate::Event(msg(1))));
        assert_eq!(rx.recv().await, Some(SourceUpdate::Disconnected));
        assert_eq!(rx.recv().await, None);
        assert!(matches!(
            source.subscribe(-1).await,
            Err(SourceError::Disconnected)
        ));
        source.reconnect();
        assert!(source.subscribe(-1).await.is_ok());
        assert_eq!(source.subscribe_count(-1), 2);
    }

    #[tokio::test]
    async fn sink_scripted_failures_then_success() {
        let sink = MemorySink::new();
        sink.fail_next_creates([SinkError::transient("503")]);
        let out = OutboundMessage::text("hi");
        assert!(sink.create(7, &out).await.is_err());
        let id = sink.create(7, &out).await.unwrap();
        assert_eq!(sink.create_attempts(), 2);
        assert_eq!(sink.texts(7), vec!["hi"]);
        sink.delete(7, id).await.unwrap();
        assert!(matches!(
            sink.delete(7, id).await,
            Err(SinkError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resolve_mentions_drops_unknown() {
        let sink = MemorySink::new().with_role("Ops", "<@&42>");
        let got = sink
            .resolve_mentions(1, &["Ops".into(), "Nobody".into()])
            .await
            .unwrap();
        assert_eq!(got, vec!["<@&42>"]);
    }
}

//! normalize → route → dedup → render → deliver → record.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {
    chrono::Utc,
    relay_channels::{OutboundMessage, RawEvent, SinkClient, SinkError, SourceClient, split_message},
    relay_common::{
        CanonicalMessage, DestChannelId, DestMessageId, EventKind, MessageOrigin, SourceChannelId,
        SourceMessageId,
    },
    relay_config::RelayConfig,
    relay_history::{ChannelLocks, FailedForward, HistoryStore, Mapping},
    relay_routing::{FilterReason, ForwardingRule, RoutingDecision, RuleSet, decide, mentions_for},
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use relay_metrics::{forwarding as fwd_metrics, histogram};

use crate::{
    dedup::{DedupStats, Deduplicator},
    error::{Error, Result},
    normalize::{Normalized, Normalizer, SkipReason},
    render::{RenderTarget, Renderer},
    retry::RetryPolicy,
    stats::{ForwarderStats, StatEvent, Stats},
};

/// What happened to one message on one destination (or as a whole).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Skipped {
        reason: SkipReason,
    },
    /// A create at or below the channel checkpoint.
    AlreadyProcessed,
    Duplicate,
    Filtered {
        forwarder: String,
        reason: FilterReason,
    },
    Forwarded {
        forwarder: String,
        destination: DestChannelId,
        message_id: DestMessageId,
    },
    /// Delivered before a restart; not sent again.
    AlreadyMapped {
        forwarder: String,
        destination: DestChannelId,
    },
    Failed {
        forwarder: String,
        destination: DestChannelId,
        reason: String,
    },
    Edited {
        forwarder: String,
        destination: DestChannelId,
        message_id: DestMessageId,
    },
    Deleted {
        forwarder: String,
        destination: DestChannelId,
        message_id: DestMessageId,
    },
    /// Edit or delete of a message with no mapping, or whose destination
    /// message is gone.
    NotFound {
        forwarder: String,
        destination: DestChannelId,
    },
}

impl Outcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Everything one message needs on its way through the relay.
///
/// Shared by every channel loop. Per-channel ordering comes from the caller;
/// the pipeline only guarantees a single writer per channel in the store.
pub struct Pipeline {
    rules: Arc<RuleSet>,
    normalizer: Normalizer,
    dedup: Deduplicator,
    renderer: Renderer,
    store: Arc<dyn HistoryStore>,
    sink: Arc<dyn SinkClient>,
    locks: ChannelLocks,
    retry: RetryPolicy,
    stats: Stats,
    max_message_len: usize,
    /// Channels whose checkpoint may not move until a recovery pass
    /// completes without failures.
    held: Mutex<BTreeSet<SourceChannelId>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        config: &RelayConfig,
        source: Arc<dyn SourceClient>,
        sink: Arc<dyn SinkClient>,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        let rules = Arc::new(RuleSet::from_config(config));
        Self {
            normalizer: Normalizer::new(Arc::clone(&rules), config),
            rules,
            dedup: Deduplicator::new(&config.anti_spam),
            renderer: Renderer::new(source, Arc::clone(&sink), config),
            store,
            sink,
            locks: ChannelLocks::new(),
            retry: RetryPolicy::from_config(&config.delivery),
            stats: Stats::default(),
            max_message_len: config.delivery.max_message_len.max(1),
            held: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    #[must_use]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    #[must_use]
    pub fn dedup_stats(&self) -> BTreeMap<SourceChannelId, DedupStats> {
        self.dedup.stats()
    }

    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, ForwarderStats> {
        self.stats.snapshot()
    }

    /// Keep the checkpoint of `channel` where it is. Messages are still
    /// forwarded and mapped; the next recovery pass replays them from the
    /// checkpoint and skips the ones already delivered.
    pub fn hold_checkpoint(&self, channel: SourceChannelId) {
        if self.held_channels().insert(channel) {
            info!(source_channel = channel, "checkpoint held until recovery completes");
        }
    }

    pub fn release_checkpoint(&self, channel: SourceChannelId) {
        self.held_channels().remove(&channel);
    }

    #[must_use]
    pub fn is_checkpoint_held(&self, channel: SourceChannelId) -> bool {
        self.held_channels().contains(&channel)
    }

    fn held_channels(&self) -> MutexGuard<'_, BTreeSet<SourceChannelId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Normalize and handle one raw event.
    pub async fn process(
        &self,
        event: &RawEvent,
        origin: MessageOrigin,
        cancel: &CancellationToken,
    ) -> Result<Vec<Outcome>> {
        match self.normalizer.normalize(event, origin) {
            Normalized::Skip(reason) => Ok(vec![Outcome::Skipped { reason }]),
            Normalized::Messages(msgs) => {
                let mut outcomes = Vec::new();
                for msg in &msgs {
                    outcomes.extend(self.handle_message(msg, cancel).await?);
                }
                Ok(outcomes)
            },
        }
    }

    pub async fn handle_message(
        &self,
        msg: &CanonicalMessage,
        cancel: &CancellationToken,
    ) -> Result<Vec<Outcome>> {
        let _writer = self.locks.lock(msg.source_channel_id).await;
        match msg.event_kind {
            EventKind::Create => self.handle_create(msg, cancel).await,
            EventKind::Edit => self.handle_edit(msg, cancel).await,
            EventKind::Delete => self.handle_delete(msg, cancel).await,
        }
    }

    // ── Create ──────────────────────────────────────────────────────────────

    async fn handle_create(
        &self,
        msg: &CanonicalMessage,
        cancel: &CancellationToken,
    ) -> Result<Vec<Outcome>> {
        let channel = msg.source_channel_id;
        if let Some(cp) = self.store.get_checkpoint(channel).await?
            && msg.source_message_id <= cp.last_processed_source_message_id
        {
            debug!(
                source_channel = channel,
                message_id = msg.source_message_id,
                checkpoint = cp.last_processed_source_message_id,
                "message already processed"
            );
            return Ok(vec![Outcome::AlreadyProcessed]);
        }

        let mut outcomes = Vec::new();
        let (forward, filtered): (Vec<RoutingDecision>, Vec<RoutingDecision>) =
            decide(msg, self.rules.rules_for(channel))
                .into_iter()
                .partition(|d| d.forward);
        for d in filtered {
            self.stats.record(&d.forwarder, StatEvent::Filtered);
            if let Some(reason) = d.filtered {
                outcomes.push(Outcome::Filtered {
                    forwarder: d.forwarder,
                    reason,
                });
            }
        }

        let mut pending = Vec::new();
        for decision in forward {
            if self
                .store
                .lookup_destination(channel, msg.source_message_id, decision.destination_channel_id)
                .await?
                .is_some()
            {
                debug!(
                    forwarder = %decision.forwarder,
                    message_id = msg.source_message_id,
                    "already delivered, skipping"
                );
                outcomes.push(Outcome::AlreadyMapped {
                    forwarder: decision.forwarder,
                    destination: decision.destination_channel_id,
                });
            } else {
                pending.push(decision);
            }
        }

        if pending.is_empty() {
            self.advance(channel, msg.source_message_id).await?;
            return Ok(outcomes);
        }

        if self.dedup.is_duplicate(msg) {
            info!(
                source_channel = channel,
                message_id = msg.source_message_id,
                "duplicate message dropped"
            );
            for d in &pending {
                self.stats.record(&d.forwarder, StatEvent::Duplicate);
            }
            outcomes.push(Outcome::Duplicate);
            return Ok(outcomes);
        }

        let mut failed = false;
        let mut delivered = false;
        for decision in pending {
            let outcome = self.forward_one(msg, decision, cancel).await?;
            failed |= outcome.is_failed();
            delivered |= matches!(outcome, Outcome::Forwarded { .. });
            outcomes.push(outcome);
        }

        if delivered {
            self.dedup.remember(msg);
        }
        if !failed {
            self.advance(channel, msg.source_message_id).await?;
        }
        Ok(outcomes)
    }

    async fn forward_one(
        &self,
        msg: &CanonicalMessage,
        decision: RoutingDecision,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let channel = msg.source_channel_id;
        let destination = decision.destination_channel_id;
        let mut outbound = self
            .renderer
            .render(msg, RenderTarget {
                destination,
                mentions: &decision.mentions,
                strip_links: decision.strip_links,
                as_embed: decision.as_embed,
                with_media: true,
            })
            .await;
        if let Some(reply_to) = msg.reply_to_source_id {
            outbound.reply_to = self.reply_target(channel, reply_to, destination).await?;
        }

        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        let delivered = self.deliver(destination, outbound, cancel).await;
        #[cfg(feature = "metrics")]
        histogram!(fwd_metrics::FORWARD_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match delivered {
            Ok(message_id) => {
                self.store
                    .record_mapping(&Mapping {
                        source_channel_id: channel,
                        source_message_id: msg.source_message_id,
                        destination_channel_id: destination,
                        destination_message_id: message_id,
                        created_at: Utc::now(),
                    })
                    .await?;
                self.stats.record(&decision.forwarder, StatEvent::Forwarded);
                info!(
                    forwarder = %decision.forwarder,
                    source_channel = channel,
                    message_id = msg.source_message_id,
                    destination_channel = destination,
                    destination_message = message_id,
                    recovered = msg.is_recovered(),
                    "message forwarded"
                );
                Ok(Outcome::Forwarded {
                    forwarder: decision.forwarder,
                    destination,
                    message_id,
                })
            },
            Err(Error::Sink(e)) => {
                self.record_failure(&decision.forwarder, msg, destination, &e)
                    .await?;
                Ok(Outcome::Failed {
                    forwarder: decision.forwarder,
                    destination,
                    reason: e.to_string(),
                })
            },
            Err(e) => Err(e),
        }
    }

    /// Send `outbound`, split to the sink's length limit. Returns the id of
    /// the first part, which edits and deletes address.
    async fn deliver(
        &self,
        destination: DestChannelId,
        outbound: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<DestMessageId> {
        let mut parts = split_message(&outbound.text, self.max_message_len).into_iter();
        let first = OutboundMessage {
            text: parts.next().unwrap_or_default(),
            ..outbound
        };
        let first_id = self
            .retry
            .run("create", cancel, || self.sink.create(destination, &first))
            .await?;

        for text in parts {
            let part = OutboundMessage {
                text,
                as_embed: first.as_embed,
                ..Default::default()
            };
            if let Err(e) = self
                .retry
                .run("create", cancel, || self.sink.create(destination, &part))
                .await
            {
                if matches!(e, Error::Cancelled) {
                    return Ok(first_id);
                }
                warn!(
                    destination_channel = destination,
                    destination_message = first_id,
                    error = %e,
                    "continuation part not delivered"
                );
            }
        }
        Ok(first_id)
    }

    async fn reply_target(
        &self,
        channel: SourceChannelId,
        reply_to: SourceMessageId,
        destination: DestChannelId,
    ) -> Result<Option<DestMessageId>> {
        let target = self
            .store
            .lookup_destination(channel, reply_to, destination)
            .await?
            .map(|m| m.destination_message_id);
        if target.is_none() {
            debug!(
                source_channel = channel,
                reply_to,
                destination_channel = destination,
                "reply target not mapped, sending without reference"
            );
        }
        Ok(target)
    }

    async fn record_failure(
        &self,
        forwarder: &str,
        msg: &CanonicalMessage,
        destination: DestChannelId,
        error: &SinkError,
    ) -> Result<()> {
        warn!(
            forwarder,
            source_channel = msg.source_channel_id,
            message_id = msg.source_message_id,
            destination_channel = destination,
            error = %error,
            "forward failed"
        );
        self.stats.record(forwarder, StatEvent::Failed);
        self.store
            .record_failed_forward(&FailedForward {
                forwarder: forwarder.to_string(),
                source_channel_id: msg.source_channel_id,
                source_message_id: msg.source_message_id,
                destination_channel_id: destination,
                reason: error.to_string(),
                at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn advance(&self, channel: SourceChannelId, message_id: SourceMessageId) -> Result<()> {
        if self.is_checkpoint_held(channel) {
            debug!(source_channel = channel, message_id, "checkpoint held");
            return Ok(());
        }
        let cp = self
            .store
            .advance_checkpoint(channel, message_id, Utc::now())
            .await?;
        debug!(
            source_channel = channel,
            checkpoint = cp.last_processed_source_message_id,
            "checkpoint advanced"
        );
        Ok(())
    }

    // ── Edit / delete ───────────────────────────────────────────────────────

    /// Edits bypass the hashtag filter and the deduplicator: a mapped message
    /// is always updated.
    async fn handle_edit(
        &self,
        msg: &CanonicalMessage,
        cancel: &CancellationToken,
    ) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        for rule in self.rules.rules_for(msg.source_channel_id) {
            let Some(mapping) = self.mapping_for(msg, rule).await? else {
                outcomes.push(not_found(rule));
                continue;
            };
            let mentions = mentions_for(msg, rule);
            let rendered = self
                .renderer
                .render(msg, RenderTarget {
                    destination: rule.destination_channel_id,
                    mentions: &mentions,
                    strip_links: rule.strip_links,
                    as_embed: rule.send_as_embed,
                    with_media: false,
                })
                .await;
            let outbound = OutboundMessage {
                text: split_message(&rendered.text, self.max_message_len)
                    .into_iter()
                    .next()
                    .unwrap_or_default(),
                ..rendered
            };

            let dest_id = mapping.destination_message_id;
            let result = self
                .retry
                .run("edit", cancel, || {
                    self.sink.edit(rule.destination_channel_id, dest_id, &outbound)
                })
                .await;
            outcomes.push(self.settle(rule, msg, dest_id, result, StatEvent::Edited)?);
        }
        Ok(outcomes)
    }

    async fn handle_delete(
        &self,
        msg: &CanonicalMessage,
        cancel: &CancellationToken,
    ) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        for rule in self.rules.rules_for(msg.source_channel_id) {
            let Some(mapping) = self.mapping_for(msg, rule).await? else {
                outcomes.push(not_found(rule));
                continue;
            };
            let dest_id = mapping.destination_message_id;
            let result = self
                .retry
                .run("delete", cancel, || {
                    self.sink.delete(rule.destination_channel_id, dest_id)
                })
                .await;
            let gone = matches!(result, Ok(()) | Err(Error::Sink(SinkError::NotFound { .. })));
            let outcome = self.settle(rule, msg, dest_id, result, StatEvent::Deleted)?;
            if gone {
                self.store
                    .remove_mapping(
                        msg.source_channel_id,
                        msg.source_message_id,
                        rule.destination_channel_id,
                    )
                    .await?;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn mapping_for(
        &self,
        msg: &CanonicalMessage,
        rule: &ForwardingRule,
    ) -> Result<Option<Mapping>> {
        let mapping = self
            .store
            .lookup_destination(
                msg.source_channel_id,
                msg.source_message_id,
                rule.destination_channel_id,
            )
            .await?;
        if mapping.is_none() {
            debug!(
                forwarder = %rule.name,
                source_channel = msg.source_channel_id,
                message_id = msg.source_message_id,
                event = ?msg.event_kind,
                "no mapping for edited or deleted message"
            );
        }
        Ok(mapping)
    }

    /// Turn an edit/delete sink result into an outcome. `NotFound` and other
    /// sink errors are reported, not raised.
    fn settle(
        &self,
        rule: &ForwardingRule,
        msg: &CanonicalMessage,
        dest_id: DestMessageId,
        result: Result<()>,
        applied: StatEvent,
    ) -> Result<Outcome> {
        let forwarder = rule.name.clone();
        let destination = rule.destination_channel_id;
        match result {
            Ok(()) => {
                self.stats.record(&forwarder, applied);
                info!(
                    forwarder = %forwarder,
                    source_channel = msg.source_channel_id,
                    message_id = msg.source_message_id,
                    destination_channel = destination,
                    destination_message = dest_id,
                    event = ?msg.event_kind,
                    "change propagated"
                );
                Ok(if applied == StatEvent::Edited {
                    Outcome::Edited {
                        forwarder,
                        destination,
                        message_id: dest_id,
                    }
                } else {
                    Outcome::Deleted {
                        forwarder,
                        destination,
                        message_id: dest_id,
                    }
                })
            },
            Err(Error::Sink(SinkError::NotFound { .. })) => {
                info!(
                    forwarder = %forwarder,
                    destination_channel = destination,
                    destination_message = dest_id,
                    "destination message already gone"
                );
                Ok(Outcome::NotFound {
                    forwarder,
                    destination,
                })
            },
            Err(Error::Sink(e)) => {
                warn!(
                    forwarder = %forwarder,
                    destination_channel = destination,
                    destination_message = dest_id,
                    event = ?msg.event_kind,
                    error = %e,
                    "change not propagated"
                );
                self.stats.record(&forwarder, StatEvent::Failed);
                Ok(Outcome::Failed {
                    forwarder,
                    destination,
                    reason: e.to_string(),
                })
            },
            Err(e) => Err(e),
        }
    }
}

fn not_found(rule: &ForwardingRule) -> Outcome {
    Outcome::NotFound {
        forwarder: rule.name.clone(),
        destination: rule.destination_channel_id,
    }
}

//! Gap recovery: replay everything a channel missed since its checkpoint.

use std::{pin::Pin, sync::Arc, time::Duration};

use {
    futures::{Stream, StreamExt},
    relay_channels::SourceClient,
    relay_common::{CanonicalMessage, MessageOrigin, SourceChannelId},
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use relay_metrics::{counter, labels, recovery as recovery_metrics};

use crate::{
    error::{Error, Result},
    normalize::Normalized,
    pipeline::Pipeline,
};

/// Lazily recovered messages, oldest first.
pub type RecoveryStream<'a> = Pin<Box<dyn Stream<Item = Result<CanonicalMessage>> + Send + 'a>>;

/// Summary of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Messages handed to the pipeline.
    pub replayed: usize,
    /// Messages with at least one failed destination.
    pub failed: usize,
    /// The pass stopped early after too many failures.
    pub abandoned: bool,
}

pub struct Recoverer {
    source: Arc<dyn SourceClient>,
    delay: Duration,
    max_failures: u32,
}

impl Recoverer {
    #[must_use]
    pub fn new(source: Arc<dyn SourceClient>, delay: Duration, max_failures: u32) -> Self {
        Self {
            source,
            delay,
            max_failures: max_failures.max(1),
        }
    }

    /// Messages of `channel` newer than its checkpoint, ascending.
    ///
    /// Empty when the channel has no checkpoint yet: a channel seen for the
    /// first time starts live, without replaying its backlog.
    pub async fn recover<'a>(
        &'a self,
        pipeline: &'a Pipeline,
        channel: SourceChannelId,
    ) -> Result<RecoveryStream<'a>> {
        let Some(checkpoint) = pipeline.store().get_checkpoint(channel).await? else {
            debug!(source_channel = channel, "no checkpoint, nothing to recover");
            return Ok(Box::pin(futures::stream::empty()));
        };
        let after = checkpoint.last_processed_source_message_id;
        info!(source_channel = channel, after, "recovering missed messages");

        let normalizer = pipeline.normalizer();
        let stream = self
            .source
            .fetch_since(channel, after)
            .filter_map(move |event| {
                let out = match event {
                    Err(e) => Some(vec![Err(Error::from(e))]),
                    Ok(event) => match normalizer.normalize(&event, MessageOrigin::Recovered) {
                        Normalized::Messages(msgs) => {
                            Some(msgs.into_iter().map(Ok).collect::<Vec<_>>())
                        },
                        Normalized::Skip(reason) => {
                            debug!(source_channel = channel, ?reason, "recovered event skipped");
                            None
                        },
                    },
                };
                futures::future::ready(out)
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(stream))
    }

    /// Run one full recovery pass for `channel` through `pipeline`.
    ///
    /// The first failed message holds the checkpoint: later messages of the
    /// pass are still delivered, but the checkpoint stays below the failure
    /// until a later pass gets through cleanly. Once `max_failures` messages
    /// have failed, the pass is abandoned so live traffic can resume; the next
    /// reconnect tries again from the same checkpoint.
    pub async fn replay(
        &self,
        pipeline: &Pipeline,
        channel: SourceChannelId,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        pipeline.release_checkpoint(channel);
        let mut stream = self.recover(pipeline, channel).await?;

        while let Some(msg) = stream.next().await {
            let msg = msg?;
            if report.replayed > 0 && !self.delay.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(self.delay) => {},
                }
            }

            let outcomes = pipeline.handle_message(&msg, cancel).await?;
            report.replayed += 1;
            #[cfg(feature = "metrics")]
            counter!(
                recovery_metrics::RECOVERED_MESSAGES_TOTAL,
                labels::SOURCE_CHANNEL => channel.to_string()
            )
            .increment(1);

            if outcomes.iter().any(|o| o.is_failed()) {
                pipeline.hold_checkpoint(channel);
                report.failed += 1;
                if report.failed >= self.max_failures as usize {
                    warn!(
                        source_channel = channel,
                        message_id = msg.source_message_id,
                        failed = report.failed,
                        "recovery abandoned after repeated failures"
                    );
                    #[cfg(feature = "metrics")]
                    counter!(
                        recovery_metrics::ABANDONED_TOTAL,
                        labels::SOURCE_CHANNEL => channel.to_string()
                    )
                    .increment(1);
                    report.abandoned = true;
                    return Ok(report);
                }
            }
        }

        info!(
            source_channel = channel,
            replayed = report.replayed,
            failed = report.failed,
            "recovery complete"
        );
        Ok(report)
    }
}

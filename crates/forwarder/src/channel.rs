//! One loop per source channel: connect, recover, then forward live events
//! in arrival order until the subscription drops.

use std::{fmt, sync::Arc, time::Duration};

use {
    relay_channels::{SourceClient, SourceError, SourceUpdate},
    relay_common::{MessageOrigin, SourceChannelId},
    serde::Serialize,
    tokio::sync::{mpsc, oneshot, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use relay_metrics::{channels as channel_metrics, gauge};

use crate::{
    error::{Error, Result},
    pipeline::Pipeline,
    recover::{RecoveryReport, Recoverer},
};

const RECONNECT_BASE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Connecting,
    Recovering,
    Live,
    Reconnecting,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Recovering => "recovering",
            Self::Live => "live",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Requests from the management handle, served between live events.
pub(crate) enum Command {
    ForceRecovery(oneshot::Sender<Result<RecoveryReport>>),
}

enum LiveEnd {
    Cancelled,
    Disconnected,
}

pub(crate) struct ChannelWorker {
    pub(crate) channel: SourceChannelId,
    source: Arc<dyn SourceClient>,
    pipeline: Arc<Pipeline>,
    recoverer: Arc<Recoverer>,
    state: watch::Sender<ChannelState>,
    commands: mpsc::Receiver<Command>,
    reconnect_cap: Duration,
}

impl ChannelWorker {
    pub(crate) fn new(
        channel: SourceChannelId,
        source: Arc<dyn SourceClient>,
        pipeline: Arc<Pipeline>,
        recoverer: Arc<Recoverer>,
        state: watch::Sender<ChannelState>,
        commands: mpsc::Receiver<Command>,
        healthcheck_interval: Duration,
    ) -> Self {
        Self {
            channel,
            source,
            pipeline,
            recoverer,
            state,
            commands,
            reconnect_cap: healthcheck_interval.max(RECONNECT_BASE),
        }
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(source_channel = self.channel, from = %previous, to = %state, "channel state");
        }
    }

    /// Run until cancelled. Errors end the loop and are handled by the
    /// supervisor.
    pub(crate) async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            self.set_state(ChannelState::Connecting);
            let Some(mut updates) = self.connect(cancel).await else {
                return Ok(());
            };

            self.set_state(ChannelState::Recovering);
            match self.recoverer.replay(&self.pipeline, self.channel, cancel).await {
                Ok(report) => debug!(source_channel = self.channel, ?report, "startup recovery"),
                Err(Error::Cancelled) => return Ok(()),
                Err(Error::Source(SourceError::Disconnected)) => {
                    self.set_state(ChannelState::Reconnecting);
                    continue;
                },
                Err(e) => return Err(e),
            }

            self.set_state(ChannelState::Live);
            info!(source_channel = self.channel, "channel live");
            #[cfg(feature = "metrics")]
            gauge!(channel_metrics::LIVE).increment(1.0);
            let end = self.live(&mut updates, cancel).await;
            #[cfg(feature = "metrics")]
            gauge!(channel_metrics::LIVE).decrement(1.0);

            match end? {
                LiveEnd::Cancelled => return Ok(()),
                LiveEnd::Disconnected => {
                    warn!(source_channel = self.channel, "source disconnected, reconnecting");
                    self.set_state(ChannelState::Reconnecting);
                },
            }
        }
    }

    /// Subscribe, retrying with backoff capped at the health-check interval.
    /// `None` when cancelled first.
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Option<mpsc::Receiver<SourceUpdate>> {
        let mut attempt: u32 = 0;
        loop {
            if self.source.is_connected() {
                match self.source.subscribe(self.channel).await {
                    Ok(rx) => {
                        debug!(source_channel = self.channel, attempt, "subscribed");
                        return Some(rx);
                    },
                    Err(e) => {
                        warn!(source_channel = self.channel, attempt, error = %e, "subscribe failed");
                    },
                }
            } else {
                debug!(source_channel = self.channel, attempt, "source not connected");
            }

            let delay = std::cmp::min(
                RECONNECT_BASE.saturating_mul(2u32.saturating_pow(attempt)),
                self.reconnect_cap,
            );
            attempt = attempt.saturating_add(1);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {},
            }
        }
    }

    async fn live(
        &mut self,
        updates: &mut mpsc::Receiver<SourceUpdate>,
        cancel: &CancellationToken,
    ) -> Result<LiveEnd> {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(LiveEnd::Cancelled),
                Some(command) = self.commands.recv() => {
                    if !self.serve(command, cancel).await? {
                        return Ok(LiveEnd::Cancelled);
                    }
                },
                update = updates.recv() => match update {
                    Some(SourceUpdate::Event(event)) => {
                        match self.pipeline.process(&event, MessageOrigin::Live, cancel).await {
                            Ok(outcomes) => debug!(
                                source_channel = self.channel,
                                outcomes = outcomes.len(),
                                "event processed"
                            ),
                            Err(Error::Cancelled) => return Ok(LiveEnd::Cancelled),
                            Err(e) => return Err(e),
                        }
                    },
                    Some(SourceUpdate::Disconnected) | None => return Ok(LiveEnd::Disconnected),
                },
            }
        }
    }

    /// Returns `false` when cancelled while serving.
    async fn serve(&mut self, command: Command, cancel: &CancellationToken) -> Result<bool> {
        match command {
            Command::ForceRecovery(reply) => {
                info!(source_channel = self.channel, "manual recovery requested");
                self.set_state(ChannelState::Recovering);
                let result = self.recoverer.replay(&self.pipeline, self.channel, cancel).await;
                self.set_state(ChannelState::Live);
                match result {
                    Ok(report) => {
                        let _ = reply.send(Ok(report));
                        Ok(true)
                    },
                    Err(Error::Cancelled) => {
                        let _ = reply.send(Err(Error::Cancelled));
                        Ok(false)
                    },
                    Err(e) => {
                        let _ = reply.send(Err(Error::message(e.to_string())));
                        Err(e)
                    },
                }
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        relay_channels::{
            RawEvent, RawMessage, SinkClient,
            testing::{MemorySink, MemorySource},
        },
        relay_config::{ForwarderConfig, RelayConfig},
        relay_history::{HistoryStore, SqliteHistoryStore},
    };

    #[test]
    fn state_display() {
        assert_eq!(ChannelState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_string(&ChannelState::Live).unwrap(),
            "\"live\""
        );
    }

    #[tokio::test]
    async fn goes_live_then_stops_on_cancel() {
        let config = RelayConfig {
            forwarders: vec![ForwarderConfig::new("news", -1001, 42)],
            ..Default::default()
        };
        let source = Arc::new(MemorySource::new());
        let sink = Arc::new(MemorySink::new());
        let store: Arc<dyn HistoryStore> =
            Arc::new(SqliteHistoryStore::connect("sqlite::memory:").await.unwrap());
        let pipeline = Arc::new(Pipeline::new(
            &config,
            Arc::clone(&source) as Arc<dyn SourceClient>,
            Arc::clone(&sink) as Arc<dyn SinkClient>,
            store,
        ));
        let recoverer = Arc::new(Recoverer::new(
            Arc::clone(&source) as Arc<dyn SourceClient>,
            Duration::ZERO,
            3,
        ));
        let (state_tx, mut state_rx) = watch::channel(ChannelState::Idle);
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let mut worker = ChannelWorker::new(
            -1001,
            Arc::clone(&source) as Arc<dyn SourceClient>,
            pipeline,
            recoverer,
            state_tx,
            cmd_rx,
            Duration::from_secs(1),
        );

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(&cancel).await })
        };

        state_rx.wait_for(|s| *s == ChannelState::Live).await.unwrap();
        source
            .push(RawEvent::NewMessage(RawMessage::text(-1001, 1, chrono::Utc::now(), "hi")))
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.texts(42).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}

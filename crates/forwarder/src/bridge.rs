//! Wires the pipeline to a source and a sink and supervises one loop per
//! source channel.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use {
    relay_channels::{SinkClient, SourceClient},
    relay_common::SourceChannelId,
    relay_config::RelayConfig,
    relay_history::{Checkpoint, HistoryStore},
    tokio::{
        sync::{Mutex, mpsc, oneshot, watch},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

#[cfg(feature = "metrics")]
use relay_metrics::{channels as channel_metrics, counter, labels};

use crate::{
    channel::{ChannelState, ChannelWorker, Command},
    dedup::DedupStats,
    error::{Error, Result},
    pipeline::Pipeline,
    recover::{RecoveryReport, Recoverer},
    stats::ForwarderStats,
};

const RESTART_BASE: Duration = Duration::from_secs(1);

/// The relay, before it is started.
pub struct Bridge {
    config: Arc<RelayConfig>,
    source: Arc<dyn SourceClient>,
    sink: Arc<dyn SinkClient>,
    store: Arc<dyn HistoryStore>,
}

impl Bridge {
    #[must_use]
    pub fn new(
        config: Arc<RelayConfig>,
        source: Arc<dyn SourceClient>,
        sink: Arc<dyn SinkClient>,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            store,
        }
    }

    /// Spawn one supervised loop per bound source channel.
    #[must_use]
    pub fn start(self) -> BridgeHandle {
        let pipeline = Arc::new(Pipeline::new(
            &self.config,
            Arc::clone(&self.source),
            self.sink,
            self.store,
        ));
        let recoverer = Arc::new(Recoverer::new(
            Arc::clone(&self.source),
            self.config.application.recoverer_delay(),
            self.config.delivery.recovery_max_failures,
        ));
        let healthcheck = self.config.application.healthcheck_interval();
        let cancel = CancellationToken::new();

        let mut channels = BTreeMap::new();
        let mut tasks = Vec::new();
        let bound: Vec<SourceChannelId> = pipeline.rules().channels().collect();
        for channel in bound {
            let (state_tx, state_rx) = watch::channel(ChannelState::Idle);
            let (cmd_tx, cmd_rx) = mpsc::channel(8);
            let worker = ChannelWorker::new(
                channel,
                Arc::clone(&self.source),
                Arc::clone(&pipeline),
                Arc::clone(&recoverer),
                state_tx,
                cmd_rx,
                healthcheck,
            );
            tasks.push(tokio::spawn(supervise(worker, cancel.clone(), healthcheck)));
            channels.insert(channel, ChannelHandle {
                state: state_rx,
                commands: cmd_tx,
            });
        }
        info!(
            name = %self.config.application.name,
            channels = channels.len(),
            "relay started"
        );

        BridgeHandle {
            inner: Arc::new(HandleInner {
                pipeline,
                channels,
                cancel,
                tasks: Mutex::new(tasks),
            }),
        }
    }
}

/// Restart the channel loop after errors until shutdown.
async fn supervise(mut worker: ChannelWorker, cancel: CancellationToken, cap: Duration) {
    let channel = worker.channel;
    let mut restarts: u32 = 0;
    loop {
        match worker.run(&cancel).await {
            Ok(()) => break,
            Err(_) if cancel.is_cancelled() => break,
            Err(e) => {
                if e.is_fatal() {
                    error!(source_channel = channel, error = %e, "channel history inconsistent, restarting loop");
                } else {
                    warn!(source_channel = channel, error = %e, "channel loop failed, restarting");
                }
                #[cfg(feature = "metrics")]
                counter!(
                    channel_metrics::RESTARTS_TOTAL,
                    labels::SOURCE_CHANNEL => channel.to_string()
                )
                .increment(1);

                let delay = std::cmp::min(
                    RESTART_BASE.saturating_mul(2u32.saturating_pow(restarts)),
                    cap.max(RESTART_BASE),
                );
                restarts = restarts.saturating_add(1);
                worker.set_state(ChannelState::Reconnecting);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {},
                }
            },
        }
    }
    worker.set_state(ChannelState::Closed);
    info!(source_channel = channel, "channel closed");
}

struct ChannelHandle {
    state: watch::Receiver<ChannelState>,
    commands: mpsc::Sender<Command>,
}

struct HandleInner {
    pipeline: Arc<Pipeline>,
    channels: BTreeMap<SourceChannelId, ChannelHandle>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Management surface of a running relay. Cheap to clone.
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<HandleInner>,
}

impl BridgeHandle {
    pub async fn checkpoint(&self, channel: SourceChannelId) -> Result<Option<Checkpoint>> {
        Ok(self.inner.pipeline.store().get_checkpoint(channel).await?)
    }

    #[must_use]
    pub fn channel_state(&self, channel: SourceChannelId) -> Option<ChannelState> {
        self.inner
            .channels
            .get(&channel)
            .map(|c| *c.state.borrow())
    }

    #[must_use]
    pub fn channel_states(&self) -> BTreeMap<SourceChannelId, ChannelState> {
        self.inner
            .channels
            .iter()
            .map(|(ch, c)| (*ch, *c.state.borrow()))
            .collect()
    }

    /// Resolve once `channel` reaches `state`.
    pub async fn wait_for_state(&self, channel: SourceChannelId, state: ChannelState) -> Result<()> {
        let mut rx = self
            .inner
            .channels
            .get(&channel)
            .ok_or(Error::UnknownChannel { channel })?
            .state
            .clone();
        rx.wait_for(|s| *s == state)
            .await
            .map_err(|_| Error::message(format!("channel {channel} loop ended")))?;
        Ok(())
    }

    /// Queue a recovery pass on `channel`. It runs before the next live event.
    pub async fn force_recovery(&self, channel: SourceChannelId) -> Result<RecoveryReport> {
        let handle = self
            .inner
            .channels
            .get(&channel)
            .ok_or(Error::UnknownChannel { channel })?;
        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(Command::ForceRecovery(tx))
            .await
            .map_err(|_| Error::message(format!("channel {channel} loop is not running")))?;
        rx.await
            .map_err(|_| Error::message(format!("channel {channel} dropped the recovery request")))?
    }

    #[must_use]
    pub fn dedup_stats(&self) -> BTreeMap<SourceChannelId, DedupStats> {
        self.inner.pipeline.dedup_stats()
    }

    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, ForwarderStats> {
        self.inner.pipeline.stats()
    }

    /// Cancel every loop and wait for in-flight work to finish.
    pub async fn shutdown(&self) {
        info!("relay shutting down");
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "channel task ended abnormally");
            }
        }
    }
}

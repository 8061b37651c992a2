//! The relay core: turns source events into sink messages and keeps the
//! history store in step.
//!
//! Per source channel a loop subscribes to the source, replays what it missed
//! since its checkpoint and then forwards live events in order:
//!
//! ```text
//! RawEvent → Normalizer → decide() → Deduplicator → Renderer → SinkClient
//!                                                          ↘ HistoryStore
//! ```

pub mod bridge;
pub mod channel;
pub mod dedup;
pub mod error;
pub mod normalize;
pub mod pipeline;
pub mod recover;
pub mod render;
pub mod retry;
pub mod stats;

pub use {
    bridge::{Bridge, BridgeHandle},
    channel::ChannelState,
    dedup::{DedupStats, Deduplicator},
    error::{Error, Result},
    normalize::{Normalized, Normalizer, SkipReason},
    pipeline::{Outcome, Pipeline},
    recover::{RecoveryReport, RecoveryStream, Recoverer},
    render::{RenderTarget, Renderer, render_text},
    retry::RetryPolicy,
    stats::{ForwarderStats, StatEvent, Stats},
};

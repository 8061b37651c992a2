//! Collaborator traits for the platforms the relay talks to.
//!
//! The pipeline never speaks a wire protocol itself. A source (Telegram) is
//! anything implementing [`SourceClient`] and a sink (Discord) is anything
//! implementing [`SinkClient`]; the core never branches on which platform
//! sits behind them.

pub mod error;
pub mod event;
pub mod plugin;
pub mod split;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use {
    error::{SinkError, SourceError},
    event::{EntityKind, RawEvent, RawMessage, SourceUpdate, TextEntity},
    plugin::{Attachment, EventStream, OutboundMessage, SinkClient, SourceClient},
    split::split_message,
};

//! Domain types shared by every relay crate.

pub mod types;

pub use types::{
    CanonicalMessage, DestChannelId, DestMessageId, EventKind, LinkRef, MediaKind, MediaRef,
    MessageOrigin, SourceChannelId, SourceMessageId,
};

//! Metrics for relay.
//!
//! Every pipeline stage records through the `metrics` facade using the names
//! in [`definitions`]. No recorder is installed by the library crates; until
//! the host process installs one, all calls are no-ops.
//!
//! ```rust,ignore
//! use relay_metrics::{counter, forwarding, labels};
//!
//! counter!(forwarding::MESSAGES_FORWARDED_TOTAL, labels::FORWARDER => "news").increment(1);
//! ```

mod definitions;

pub use definitions::*;

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};

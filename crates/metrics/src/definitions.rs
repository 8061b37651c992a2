//! Metric name and label definitions.
//!
//! All metric names used by the relay live here so dashboards have a single
//! place to look.

/// Forwarding pipeline metrics
pub mod forwarding {
    /// Messages delivered to a destination
    pub const MESSAGES_FORWARDED_TOTAL: &str = "relay_messages_forwarded_total";
    /// Messages dropped by a forwarder's hashtag rules
    pub const MESSAGES_FILTERED_TOTAL: &str = "relay_messages_filtered_total";
    /// Messages suppressed as near-duplicates
    pub const MESSAGES_DUPLICATE_TOTAL: &str = "relay_messages_duplicate_total";
    /// Forwards abandoned after exhausting retries or on a permanent error
    pub const FORWARD_FAILURES_TOTAL: &str = "relay_forward_failures_total";
    /// Sink calls retried after a transient error
    pub const SINK_RETRIES_TOTAL: &str = "relay_sink_retries_total";
    /// Edits applied to an already delivered message
    pub const EDITS_PROPAGATED_TOTAL: &str = "relay_edits_propagated_total";
    /// Deletes applied to an already delivered message
    pub const DELETES_PROPAGATED_TOTAL: &str = "relay_deletes_propagated_total";
    /// Time spent delivering one message, retries included
    pub const FORWARD_DURATION_SECONDS: &str = "relay_forward_duration_seconds";
}

/// Gap recovery metrics
pub mod recovery {
    /// Messages replayed by the recoverer
    pub const RECOVERED_MESSAGES_TOTAL: &str = "relay_recovered_messages_total";
    /// Recovery passes abandoned after too many failed forwards
    pub const ABANDONED_TOTAL: &str = "relay_recovery_abandoned_total";
}

/// History store metrics
pub mod history {
    /// JSON store segments archived by size rotation
    pub const ROTATIONS_TOTAL: &str = "relay_history_rotations_total";
}

/// Channel loop metrics
pub mod channels {
    /// Source channels currently in the live state
    pub const LIVE: &str = "relay_channels_live";
    /// Channel loops restarted by the supervisor
    pub const RESTARTS_TOTAL: &str = "relay_channel_restarts_total";
}

/// Common label keys
pub mod labels {
    pub const FORWARDER: &str = "forwarder";
    pub const SOURCE_CHANNEL: &str = "source_channel";
}

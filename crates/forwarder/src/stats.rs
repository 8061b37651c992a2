//! In-memory per-forwarder counters, mirrored to the metrics facade.

use std::{collections::BTreeMap, sync::Mutex};

use serde::Serialize;

#[cfg(feature = "metrics")]
use relay_metrics::{counter, forwarding as fwd_metrics, labels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    Forwarded,
    Filtered,
    Duplicate,
    Failed,
    Edited,
    Deleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwarderStats {
    pub forwarded: u64,
    pub filtered: u64,
    pub duplicate: u64,
    pub failed: u64,
    pub edited: u64,
    pub deleted: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    inner: Mutex<BTreeMap<String, ForwarderStats>>,
}

impl Stats {
    pub fn record(&self, forwarder: &str, event: StatEvent) {
        {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = map.entry(forwarder.to_string()).or_default();
            match event {
                StatEvent::Forwarded => entry.forwarded += 1,
                StatEvent::Filtered => entry.filtered += 1,
                StatEvent::Duplicate => entry.duplicate += 1,
                StatEvent::Failed => entry.failed += 1,
                StatEvent::Edited => entry.edited += 1,
                StatEvent::Deleted => entry.deleted += 1,
            }
        }

        #[cfg(feature = "metrics")]
        {
            let name = match event {
                StatEvent::Forwarded => fwd_metrics::MESSAGES_FORWARDED_TOTAL,
                StatEvent::Filtered => fwd_metrics::MESSAGES_FILTERED_TOTAL,
                StatEvent::Duplicate => fwd_metrics::MESSAGES_DUPLICATE_TOTAL,
                StatEvent::Failed => fwd_metrics::FORWARD_FAILURES_TOTAL,
                StatEvent::Edited => fwd_metrics::EDITS_PROPAGATED_TOTAL,
                StatEvent::Deleted => fwd_metrics::DELETES_PROPAGATED_TOTAL,
            };
            counter!(name, labels::FORWARDER => forwarder.to_string()).increment(1);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ForwarderStats> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_forwarder() {
        let stats = Stats::default();
        stats.record("news", StatEvent::Forwarded);
        stats.record("news", StatEvent::Forwarded);
        stats.record("news", StatEvent::Duplicate);
        stats.record("deals", StatEvent::Filtered);

        let snap = stats.snapshot();
        assert_eq!(snap["news"].forwarded, 2);
        assert_eq!(snap["news"].duplicate, 1);
        assert_eq!(snap["deals"], ForwarderStats {
            filtered: 1,
            ..Default::default()
        });
    }
}

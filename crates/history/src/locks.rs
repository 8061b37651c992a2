//! Single-writer-per-channel coordination.

use std::{collections::HashMap, sync::Arc};

use {
    relay_common::SourceChannelId,
    tokio::sync::{Mutex, OwnedMutexGuard},
};

/// One async mutex per source channel.
///
/// Holding the guard makes the caller the only writer for that channel's
/// mappings and checkpoint. Different channels never contend.
#[derive(Default)]
pub struct ChannelLocks {
    locks: std::sync::Mutex<HashMap<SourceChannelId, Arc<Mutex<()>>>>,
}

impl ChannelLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, channel: SourceChannelId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(channel).or_default())
        };
        lock.lock_owned().await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[tokio::test]
    async fn same_channel_serializes() {
        let locks = Arc::new(ChannelLocks::new());
        let guard = locks.lock(1).await;
        let other = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = other.lock(1).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_channels_do_not_block() {
        let locks = ChannelLocks::new();
        let _a = locks.lock(1).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock(2))
            .await
            .unwrap();
    }
}

//! Head block time and LIB bookkeeping, read by lag reporters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::types::{Block, BlockRef};

#[derive(Debug, Clone, Copy)]
struct Head {
    num: u64,
    time: DateTime<Utc>,
}

/// Shared view of the newest delivered block and the last irreversible block.
///
/// Written by the driver loop and the pipeline sink, read by anyone holding a
/// clone.
#[derive(Debug, Clone, Default)]
pub struct HeadTracker {
    head: Arc<RwLock<Option<Head>>>,
    lib: Arc<RwLock<Option<BlockRef>>>,
}

impl HeadTracker {
    pub async fn set_head(&self, block: &Block) {
        *self.head.write().await = Some(Head {
            num: block.number,
            time: block.timestamp,
        });
    }

    pub async fn head_num(&self) -> Option<u64> {
        self.head.read().await.map(|h| h.num)
    }

    pub async fn head_time(&self) -> Option<DateTime<Utc>> {
        self.head.read().await.map(|h| h.time)
    }

    /// Wall-clock lag behind the head block, `None` before the first block.
    pub async fn drift(&self) -> Option<chrono::Duration> {
        self.head_time().await.map(|t| Utc::now() - t)
    }

    /// Record a new LIB. Lower refs are ignored.
    pub async fn set_lib(&self, lib: BlockRef) {
        let mut current = self.lib.write().await;
        if current.as_ref().map_or(true, |c| lib.num() >= c.num()) {
            *current = Some(lib);
        }
    }

    pub async fn lib(&self) -> Option<BlockRef> {
        self.lib.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::block;

    #[tokio::test]
    async fn drift_follows_head_time() {
        let tracker = HeadTracker::default();
        assert!(tracker.drift().await.is_none());
        tracker.set_head(&block(10, "b10", "b9")).await;
        assert_eq!(tracker.head_num().await, Some(10));
        // Test blocks are stamped in 2023.
        assert!(tracker.drift().await.unwrap() > chrono::Duration::days(365));
    }

    #[tokio::test]
    async fn lib_never_moves_back() {
        let tracker = HeadTracker::default();
        tracker.set_lib(BlockRef::new("b20", 20)).await;
        tracker.set_lib(BlockRef::new("b19", 19)).await;
        assert_eq!(tracker.lib().await, Some(BlockRef::new("b20", 20)));
    }
}

//! Block sources: the pull side of the pipeline.
//!
//! ```text
//! HistoricalSource ──┐
//!                    ├── JoiningSource ── EternalSource ── driver loop
//! LiveSource ────────┘
//! ```
//!
//! Historical and live sources each run their producer on a spawned task and
//! hand blocks over a bounded `mpsc` channel, so a slow consumer blocks the
//! producer instead of losing blocks. Every source is built with a
//! [`CancellationToken`]; cancelling it (directly or through
//! [`BlockSource::shutdown`]) unblocks any pending read and releases the
//! archive handles or feed connection the producer holds.

pub mod eternal;
pub mod historical;
pub mod joining;
pub mod live;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{ArchiveError, FeedError, IngestError};
use crate::types::{Block, ShutdownReason};

pub use eternal::{EternalSource, SourceFactory};
pub use historical::{HistoricalSource, HistoricalSourceConfig, ARCHIVE_DOWNLOAD_CONCURRENCY};
pub use joining::{JoinState, JoinTarget, JoiningSource};
pub use live::{LiveSource, LiveSourceConfig};

pub use tokio_util::sync::CancellationToken;

/// An ordered stream of blocks that can be shut down.
#[async_trait]
pub trait BlockSource: Send {
    /// Next block, or `Ok(None)` once the source is exhausted.
    ///
    /// After shutdown this returns `Ok(None)` (clean) or the fault. Must be
    /// cancel-safe: dropping the future before it completes loses no block.
    async fn next_block(&mut self) -> Result<Option<Block>, IngestError>;

    /// Tear the source down. Idempotent.
    fn shutdown(&mut self, reason: ShutdownReason);
}

#[async_trait]
impl<S: BlockSource + ?Sized> BlockSource for Box<S> {
    async fn next_block(&mut self) -> Result<Option<Block>, IngestError> {
        (**self).next_block().await
    }

    fn shutdown(&mut self, reason: ShutdownReason) {
        (**self).shutdown(reason)
    }
}

// ─── Collaborators ────────────────────────────────────────────────────────────

/// Result of reading one archive bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleRead {
    /// Blocks of the bundle, in number order.
    Blocks(Vec<Block>),
    /// The archive has not caught up to this bundle yet.
    NotYetAvailable,
    /// Nothing will ever be written at or after this bundle.
    EndOfArchive,
}

/// Durable block archive, organised in bundles of `bundle_size()` blocks
/// whose base number is a multiple of the bundle size.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    fn bundle_size(&self) -> u64;

    /// Read the bundle starting at `base`. Safe to call concurrently.
    async fn read_bundle(&self, base: u64) -> Result<BundleRead, ArchiveError>;
}

/// A stream of blocks pushed by a live feed.
pub type BlockStream = Pin<Box<dyn Stream<Item = Result<Block, FeedError>> + Send>>;

/// Real-time block feed endpoint.
#[async_trait]
pub trait BlockFeed: Send + Sync {
    /// Open a subscription. Reconnecting is the caller's job.
    async fn subscribe(&self, address: &str) -> Result<BlockStream, FeedError>;
}

/// Per-block transform applied by the historical source before delivery.
pub type PreprocessFn = Arc<dyn Fn(Block) -> Result<Block, IngestError> + Send + Sync>;

/// Map a terminal reason onto what `next_block` reports after shutdown.
pub(crate) fn terminal_result(reason: Option<&ShutdownReason>) -> Result<Option<Block>, IngestError> {
    match reason {
        Some(ShutdownReason::Fault(reason)) => Err(IngestError::Aborted {
            reason: reason.clone(),
        }),
        _ => Ok(None),
    }
}

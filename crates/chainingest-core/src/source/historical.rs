//! Historical source: replays archived blocks in number order.
//!
//! Bundles are downloaded by a spawned producer with a fixed prefetch window
//! of [`ARCHIVE_DOWNLOAD_CONCURRENCY`] (`futures::StreamExt::buffered` keeps
//! them in order) and handed to the consumer over a bounded channel.
//!
//! - Bundles the archive does not have yet are polled with capped backoff,
//!   forever.
//! - Transient read faults are retried per the [`RetryPolicy`]; once retries
//!   are exhausted the fault ends the run.
//! - `EndOfArchive` or passing `stop_block_num` ends the stream cleanly.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::IngestError;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::source::{terminal_result, ArchiveStore, BlockSource, BundleRead, PreprocessFn};
use crate::types::{Block, ShutdownReason};

/// Bundles downloaded in parallel. Fixed on purpose: it bounds memory and
/// the load put on the archive store.
pub const ARCHIVE_DOWNLOAD_CONCURRENCY: usize = 2;

/// Configuration for a [`HistoricalSource`].
#[derive(Debug, Clone)]
pub struct HistoricalSourceConfig {
    /// First block delivered.
    pub start_block_num: u64,
    /// Last block delivered (inclusive); `None` = until the archive ends.
    pub stop_block_num: Option<u64>,
    /// Blocks buffered between producer and consumer.
    pub channel_capacity: usize,
    pub retry: RetryConfig,
    /// Log every delivered block at debug level.
    pub verbose: bool,
}

impl HistoricalSourceConfig {
    pub fn starting_at(start_block_num: u64) -> Self {
        Self {
            start_block_num,
            stop_block_num: None,
            channel_capacity: 200,
            retry: RetryConfig::default(),
            verbose: false,
        }
    }
}

/// Replays the archive from a start block.
pub struct HistoricalSource {
    rx: mpsc::Receiver<Result<Block, IngestError>>,
    cancel: CancellationToken,
    reason: Option<ShutdownReason>,
    task: Option<JoinHandle<()>>,
}

impl HistoricalSource {
    /// Start the producer task. `cancel` is the parent token of the run.
    pub fn spawn(
        store: Arc<dyn ArchiveStore>,
        config: HistoricalSourceConfig,
        preprocess: Option<PreprocessFn>,
        cancel: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let cancel = cancel.child_token();
        tracing::info!(
            start = config.start_block_num,
            stop = ?config.stop_block_num,
            concurrency = ARCHIVE_DOWNLOAD_CONCURRENCY,
            "starting historical source"
        );
        let task = tokio::spawn(produce(store, config, preprocess, tx, cancel.clone()));
        Self {
            rx,
            cancel,
            reason: None,
            task: Some(task),
        }
    }
}

#[async_trait]
impl BlockSource for HistoricalSource {
    async fn next_block(&mut self) -> Result<Option<Block>, IngestError> {
        if self.reason.is_some() {
            return terminal_result(self.reason.as_ref());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => terminal_result(self.reason.as_ref()),
            item = self.rx.recv() => item.transpose(),
        }
    }

    fn shutdown(&mut self, reason: ShutdownReason) {
        if self.reason.is_some() {
            return;
        }
        tracing::info!(%reason, "shutting down historical source");
        self.reason = Some(reason);
        self.cancel.cancel();
        self.rx.close();
    }
}

impl Drop for HistoricalSource {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn produce(
    store: Arc<dyn ArchiveStore>,
    config: HistoricalSourceConfig,
    preprocess: Option<PreprocessFn>,
    tx: mpsc::Sender<Result<Block, IngestError>>,
    cancel: CancellationToken,
) {
    let bundle_size = store.bundle_size().max(1);
    let start = config.start_block_num;
    let stop = config.stop_block_num;
    let first_base = start - start % bundle_size;
    let policy = RetryPolicy::new(config.retry.clone());

    let bases = (first_base..)
        .step_by(bundle_size as usize)
        .take_while(move |base| stop.map_or(true, |s| *base <= s));

    let mut bundles = futures::stream::iter(bases)
        .map(|base| {
            fetch_bundle(
                Arc::clone(&store),
                base,
                policy.clone(),
                BlockRange { start, stop },
                preprocess.clone(),
            )
        })
        .buffered(ARCHIVE_DOWNLOAD_CONCURRENCY);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = bundles.next() => next,
        };
        let blocks = match next {
            None => {
                tracing::info!(stop = ?stop, "historical source reached its stop block");
                return;
            }
            Some(Ok(None)) => {
                tracing::info!("historical source reached the end of the archive");
                return;
            }
            Some(Ok(Some(blocks))) => blocks,
            Some(Err(e)) => {
                tracing::error!(error = %e, "historical source failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for block in blocks {
            if config.verbose {
                tracing::debug!(num = block.number, id = %block.id, "historical block");
            }
            let sent = tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tx.send(Ok(block)) => sent,
            };
            if sent.is_err() {
                return;
            }
        }
    }
}

#[derive(Clone, Copy)]
struct BlockRange {
    start: u64,
    stop: Option<u64>,
}

impl BlockRange {
    fn contains(&self, num: u64) -> bool {
        num >= self.start && self.stop.map_or(true, |s| num <= s)
    }
}

/// `Ok(None)` means the archive ends before `base`.
async fn fetch_bundle(
    store: Arc<dyn ArchiveStore>,
    base: u64,
    policy: RetryPolicy,
    range: BlockRange,
    preprocess: Option<PreprocessFn>,
) -> Result<Option<Vec<Block>>, IngestError> {
    let mut failures = 0u32;
    let mut waits = 0u32;
    loop {
        match store.read_bundle(base).await {
            Ok(BundleRead::Blocks(blocks)) => {
                let mut out = Vec::with_capacity(blocks.len());
                for block in blocks.into_iter().filter(|b| range.contains(b.number)) {
                    out.push(match &preprocess {
                        Some(f) => f(block)?,
                        None => block,
                    });
                }
                return Ok(Some(out));
            }
            Ok(BundleRead::EndOfArchive) => return Ok(None),
            Ok(BundleRead::NotYetAvailable) => {
                waits += 1;
                let delay = policy.backoff(waits);
                tracing::debug!(base, ?delay, "bundle not in archive yet, waiting");
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                failures += 1;
                match policy.next_delay(failures) {
                    Some(delay) => {
                        tracing::warn!(base, attempt = failures, error = %e, "archive read failed, retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

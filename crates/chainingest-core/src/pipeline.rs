//! The downstream indexing pipeline and the sink that feeds it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::handler::StepHandler;
use crate::tracker::HeadTracker;
use crate::types::{Block, ChainBlock, ForkStep, RunMode, RunModeHandle};

/// Index-writing collaborator. Shared between the sink, the preprocess hook
/// and the ingestor's cleanup, hence `&self` everywhere.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Prepare to index from `start_block_num` (already shard-aligned).
    async fn bootstrap(&self, start_block_num: u64) -> Result<(), IngestError>;

    /// Enrich a block before it reaches the resolver. Batch mode only.
    fn preprocess_block(&self, block: Block) -> Result<Block, IngestError> {
        Ok(block)
    }

    fn set_catch_up_mode(&self);

    /// Called each time a live run has joined the feed, after
    /// [`Pipeline::set_catch_up_mode`].
    fn set_live_mode(&self) {}

    /// Write one resolved block.
    async fn process_block(&self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError>;

    /// Block until every in-flight upload is durably committed.
    async fn wait_on_uploads(&self) -> Result<(), IngestError>;
}

/// Last handler of the chain: hands resolved blocks to the [`Pipeline`] and
/// records the LIB.
///
/// With a stop block, nothing above it is forwarded and the run completes
/// once the stop block itself has been written as irreversible.
pub struct PipelineSink {
    pipeline: Arc<dyn Pipeline>,
    tracker: HeadTracker,
    run_mode: RunModeHandle,
    /// Joins already announced through `set_live_mode`.
    joins_notified: u64,
    stop_block_num: Option<u64>,
}

impl PipelineSink {
    pub fn new(pipeline: Arc<dyn Pipeline>, tracker: HeadTracker, run_mode: RunModeHandle) -> Self {
        Self {
            pipeline,
            tracker,
            run_mode,
            joins_notified: 0,
            stop_block_num: None,
        }
    }

    /// Last block of the run (inclusive).
    pub fn with_stop_block(mut self, stop_block_num: Option<u64>) -> Self {
        self.stop_block_num = stop_block_num;
        self
    }
}

#[async_trait]
impl StepHandler for PipelineSink {
    async fn process_step(&mut self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError> {
        if let Some(stop) = self.stop_block_num {
            if block.num() > stop {
                tracing::trace!(num = block.num(), stop, "past stop block, not forwarded");
                return Ok(());
            }
        }

        let joins = self.run_mode.joins();
        if joins > self.joins_notified && self.run_mode.get() == RunMode::Live {
            self.joins_notified = joins;
            tracing::info!(num = block.num(), joins, "pipeline switched to live mode");
            self.pipeline.set_live_mode();
        }

        let irreversible = step == ForkStep::Irreversible;
        let block_ref = block.block_ref();
        self.pipeline.process_block(block, step).await?;
        if irreversible {
            let num = block_ref.num();
            self.tracker.set_lib(block_ref).await;
            if self.stop_block_num == Some(num) {
                tracing::info!(stop = num, "stop block is irreversible");
                return Err(IngestError::Completed);
            }
        }
        Ok(())
    }
}

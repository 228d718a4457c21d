//! Handler traits: the push side of the pipeline.
//!
//! Sources produce raw [`Block`]s which flow into a [`BlockHandler`] (the fork
//! resolver, optionally behind a gate). The resolver emits `(block, step)`
//! pairs into a [`StepHandler`] (a gate, then the pipeline sink).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::types::{Block, ForkStep};

/// Consumer of the raw block stream.
#[async_trait]
pub trait BlockHandler: Send {
    async fn process_block(&mut self, block: Block) -> Result<(), IngestError>;
}

/// Consumer of fork-resolved decisions.
#[async_trait]
pub trait StepHandler: Send {
    async fn process_step(&mut self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError>;
}

#[async_trait]
impl<H: BlockHandler + ?Sized> BlockHandler for Box<H> {
    async fn process_block(&mut self, block: Block) -> Result<(), IngestError> {
        (**self).process_block(block).await
    }
}

#[async_trait]
impl<H: StepHandler + ?Sized> StepHandler for Box<H> {
    async fn process_step(&mut self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError> {
        (**self).process_step(block, step).await
    }
}

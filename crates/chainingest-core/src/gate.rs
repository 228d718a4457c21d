//! Gates: stream filters that withhold every block before a threshold.
//!
//! - [`BlockNumGate`] compares block numbers only and keeps no other state.
//! - [`BlockIdGate`] opens at a specific block id; it is used to resume a
//!   stream right after a block that was already delivered.
//!
//! Both wrap the raw-stream side ([`BlockHandler`]) and the resolved side
//! ([`StepHandler`]). `BlockIdGate` can also wrap a [`BlockSource`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::handler::{BlockHandler, StepHandler};
use crate::source::BlockSource;
use crate::types::{Block, ChainBlock, ForkStep, ShutdownReason};

/// Whether the threshold block itself passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Forward blocks strictly after the threshold.
    Exclusive,
    /// Forward the threshold block and everything after it.
    Inclusive,
}

// ─── BlockNumGate ─────────────────────────────────────────────────────────────

/// Forwards a block when `num > target` (exclusive) or `num >= target` (inclusive).
pub struct BlockNumGate<H> {
    target: u64,
    mode: GateMode,
    next: H,
    opened: bool,
}

impl<H> BlockNumGate<H> {
    pub fn new(target: u64, mode: GateMode, next: H) -> Self {
        Self {
            target,
            mode,
            next,
            opened: false,
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Pure threshold check.
    pub fn passes(&self, num: u64) -> bool {
        match self.mode {
            GateMode::Exclusive => num > self.target,
            GateMode::Inclusive => num >= self.target,
        }
    }

    pub fn into_inner(self) -> H {
        self.next
    }

    fn admit(&mut self, num: u64) -> bool {
        if !self.passes(num) {
            tracing::trace!(num, target = self.target, "block held by number gate");
            return false;
        }
        if !self.opened {
            self.opened = true;
            tracing::info!(num, target = self.target, "number gate passed");
        }
        true
    }
}

#[async_trait]
impl<H: BlockHandler> BlockHandler for BlockNumGate<H> {
    async fn process_block(&mut self, block: Block) -> Result<(), IngestError> {
        if self.admit(block.num()) {
            self.next.process_block(block).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<H: StepHandler> StepHandler for BlockNumGate<H> {
    async fn process_step(&mut self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError> {
        if self.admit(block.num()) {
            self.next.process_step(block, step).await?;
        }
        Ok(())
    }
}

// ─── BlockIdGate ──────────────────────────────────────────────────────────────

/// Opens when the block with `block_id` goes by.
///
/// In exclusive mode that block is dropped too, so a resumed stream does not
/// redeliver it.
pub struct BlockIdGate<T> {
    block_id: String,
    mode: GateMode,
    passed: bool,
    inner: T,
}

impl<T> BlockIdGate<T> {
    pub fn new(block_id: impl Into<String>, mode: GateMode, inner: T) -> Self {
        Self {
            block_id: block_id.into(),
            mode,
            passed: false,
            inner,
        }
    }

    pub fn has_passed(&self) -> bool {
        self.passed
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn admit(&mut self, block: &impl ChainBlock) -> bool {
        if self.passed {
            return true;
        }
        if block.id() != self.block_id {
            tracing::trace!(num = block.num(), id = block.id(), "block held by id gate");
            return false;
        }
        self.passed = true;
        tracing::info!(num = block.num(), id = block.id(), mode = ?self.mode, "id gate passed");
        self.mode == GateMode::Inclusive
    }
}

#[async_trait]
impl<H: BlockHandler> BlockHandler for BlockIdGate<H> {
    async fn process_block(&mut self, block: Block) -> Result<(), IngestError> {
        if self.admit(&block) {
            self.inner.process_block(block).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<H: StepHandler> StepHandler for BlockIdGate<H> {
    async fn process_step(&mut self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError> {
        if self.admit(block.as_ref()) {
            self.inner.process_step(block, step).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: BlockSource> BlockSource for BlockIdGate<S> {
    async fn next_block(&mut self) -> Result<Option<Block>, IngestError> {
        loop {
            match self.inner.next_block().await? {
                Some(block) if self.admit(&block) => return Ok(Some(block)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    fn shutdown(&mut self, reason: ShutdownReason) {
        self.inner.shutdown(reason);
    }
}

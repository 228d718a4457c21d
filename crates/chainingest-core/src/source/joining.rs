//! Joining source: splices the historical leg onto the live leg.
//!
//! Both legs run concurrently. Live blocks are parked in a bounded join
//! buffer while the historical leg is delivered. The join happens when a
//! buffered live block *is* the last historical block (delivery resumes right
//! after it) or *chains from* it (delivery resumes at it). Before the
//! historical leg delivers anything, an optional [`JoinTarget`] plays the role
//! of the last delivered block.
//!
//! When the historical leg is exhausted and the join buffer fills up without a
//! common block, the two legs cannot be spliced and the run fails with
//! [`IngestError::JoinInconsistency`].

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::source::{terminal_result, BlockSource};
use crate::types::{Block, BlockRef, ChainBlock, RunMode, RunModeHandle, ShutdownReason};

/// Where live delivery may begin before the historical leg produced anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    /// A block that was already delivered; live resumes strictly after it.
    BlockId(String),
    /// The first block of the chain; live resumes at it.
    BlockNum(u64),
}

impl From<&BlockRef> for JoinTarget {
    fn from(r: &BlockRef) -> Self {
        JoinTarget::BlockId(r.id().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Delivering the historical leg, buffering live.
    AwaitingJoin,
    /// Delivering the live leg only.
    Joined,
}

enum Leg {
    File(Result<Option<Block>, IngestError>),
    Live(Result<Option<Block>, IngestError>),
}

pub struct JoiningSource {
    file: Option<Box<dyn BlockSource>>,
    live: Box<dyn BlockSource>,
    state: JoinState,
    buffer: VecDeque<Block>,
    capacity: usize,
    target: Option<JoinTarget>,
    last_file: Option<BlockRef>,
    run_mode: RunModeHandle,
    reason: Option<ShutdownReason>,
}

impl JoiningSource {
    /// `file` is `None` when there is nothing to replay.
    pub fn new(
        file: Option<Box<dyn BlockSource>>,
        live: Box<dyn BlockSource>,
        buffer_size: usize,
        run_mode: RunModeHandle,
    ) -> Self {
        Self {
            file,
            live,
            state: JoinState::AwaitingJoin,
            buffer: VecDeque::with_capacity(buffer_size),
            capacity: buffer_size.max(1),
            target: None,
            last_file: None,
            run_mode,
            reason: None,
        }
    }

    pub fn with_target(mut self, target: JoinTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    /// Index of the first buffered live block to deliver, if the legs meet.
    fn join_index(&self) -> Option<usize> {
        let anchor = match (&self.last_file, &self.target) {
            (Some(last), _) => last.id(),
            (None, Some(JoinTarget::BlockId(id))) => id.as_str(),
            (None, Some(JoinTarget::BlockNum(num))) => {
                return self.buffer.iter().position(|b| b.num() == *num);
            }
            (None, None) => return self.file.is_none().then_some(0),
        };
        self.buffer.iter().enumerate().find_map(|(i, b)| {
            if b.id() == anchor {
                Some(i + 1)
            } else if b.parent_id() == anchor {
                Some(i)
            } else {
                None
            }
        })
    }

    /// Switch to live delivery if the legs meet. Returns `true` on join.
    fn try_join(&mut self) -> bool {
        let Some(from) = self.join_index() else {
            self.trim_covered();
            return false;
        };
        self.buffer.drain(..from);
        if let Some(mut file) = self.file.take() {
            file.shutdown(ShutdownReason::Clean);
        }
        self.state = JoinState::Joined;
        self.run_mode.set(RunMode::Live);
        tracing::info!(
            last_historical = ?self.last_file.as_ref().map(|r| r.to_string()),
            target = ?self.target,
            first_live = ?self.buffer.front().map(|b| b.num()),
            buffered = self.buffer.len(),
            "joined live feed"
        );
        true
    }

    /// Drop buffered live blocks the historical leg already covered.
    fn trim_covered(&mut self) {
        let Some(last) = self.last_file.as_ref().map(|r| r.num()) else {
            return;
        };
        let before = self.buffer.len();
        self.buffer.retain(|b| b.num() > last);
        let trimmed = before - self.buffer.len();
        if trimmed > 0 {
            tracing::debug!(trimmed, last, "discarded live blocks covered by the archive");
        }
    }

    fn no_common_block(&self) -> IngestError {
        IngestError::JoinInconsistency {
            reason: format!(
                "no common block between archive (last {}) and live feed within a join window of {} blocks",
                self.last_file
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| format!("{:?}", self.target)),
                self.capacity
            ),
        }
    }

    async fn next_awaiting(&mut self) -> Result<Option<Block>, IngestError> {
        loop {
            if self.try_join() {
                return self.next_joined().await;
            }

            let Some(file) = self.file.as_mut() else {
                if self.buffer.len() >= self.capacity {
                    return Err(self.no_common_block());
                }
                match self.live.next_block().await? {
                    Some(b) => self.buffer.push_back(b),
                    None => return Err(self.live_ended()),
                }
                continue;
            };

            let live_open = self.buffer.len() < self.capacity;
            let polled = tokio::select! {
                r = file.next_block() => Leg::File(r),
                r = self.live.next_block(), if live_open => Leg::Live(r),
            };

            match polled {
                Leg::File(r) => match r? {
                    Some(b) => {
                        self.last_file = Some(b.block_ref());
                        self.try_join();
                        return Ok(Some(b));
                    }
                    None => {
                        tracing::info!(
                            last = ?self.last_file.as_ref().map(|r| r.num()),
                            "historical leg exhausted, waiting for live join"
                        );
                        if let Some(mut file) = self.file.take() {
                            file.shutdown(ShutdownReason::Clean);
                        }
                    }
                },
                Leg::Live(r) => match r? {
                    Some(b) => self.buffer.push_back(b),
                    None => return Err(self.live_ended()),
                },
            }
        }
    }

    async fn next_joined(&mut self) -> Result<Option<Block>, IngestError> {
        if let Some(b) = self.buffer.pop_front() {
            return Ok(Some(b));
        }
        self.live.next_block().await
    }

    fn live_ended(&self) -> IngestError {
        IngestError::JoinInconsistency {
            reason: "live feed ended before the join point".into(),
        }
    }
}

#[async_trait]
impl BlockSource for JoiningSource {
    async fn next_block(&mut self) -> Result<Option<Block>, IngestError> {
        if self.reason.is_some() {
            return terminal_result(self.reason.as_ref());
        }
        match self.state {
            JoinState::AwaitingJoin => self.next_awaiting().await,
            JoinState::Joined => self.next_joined().await,
        }
    }

    fn shutdown(&mut self, reason: ShutdownReason) {
        if self.reason.is_some() {
            return;
        }
        if let Some(mut file) = self.file.take() {
            file.shutdown(reason.clone());
        }
        self.live.shutdown(reason.clone());
        self.buffer.clear();
        self.reason = Some(reason);
    }
}

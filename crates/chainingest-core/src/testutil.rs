//! Helpers shared by the unit tests of this crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::error::IngestError;
use crate::handler::{BlockHandler, StepHandler};
use crate::types::{Block, ForkStep, Protocol};

pub fn block(num: u64, id: &str, parent: &str) -> Block {
    block_lib(num, id, parent, 0)
}

pub fn block_lib(num: u64, id: &str, parent: &str, lib_num: u64) -> Block {
    Block {
        number: num,
        id: id.into(),
        parent_id: parent.into(),
        parent_num: num.saturating_sub(1),
        lib_num,
        timestamp: Utc.timestamp_opt(1_700_000_000 + num as i64, 0).unwrap(),
        protocol: Protocol::Evm,
        payload: vec![],
    }
}

/// A linear chain `b{from}..=b{to}`, each block declaring `lib_num = num - lag`.
pub fn chain(from: u64, to: u64, lag: u64) -> Vec<Block> {
    (from..=to)
        .map(|n| block_lib(n, &format!("b{n}"), &format!("b{}", n.saturating_sub(1)), n.saturating_sub(lag)))
        .collect()
}

#[derive(Clone, Default)]
pub struct Recorder {
    pub blocks: Arc<Mutex<Vec<Block>>>,
    pub steps: Arc<Mutex<Vec<(String, u64, ForkStep)>>>,
}

impl Recorder {
    pub fn ids(&self) -> Vec<String> {
        self.blocks.lock().unwrap().iter().map(|b| b.id.clone()).collect()
    }

    pub fn steps(&self) -> Vec<(String, u64, ForkStep)> {
        self.steps.lock().unwrap().clone()
    }

    pub fn irreversible_ids(&self) -> Vec<String> {
        self.steps()
            .into_iter()
            .filter(|(_, _, s)| *s == ForkStep::Irreversible)
            .map(|(id, _, _)| id)
            .collect()
    }
}

#[async_trait]
impl BlockHandler for Recorder {
    async fn process_block(&mut self, block: Block) -> Result<(), IngestError> {
        self.blocks.lock().unwrap().push(block);
        Ok(())
    }
}

#[async_trait]
impl StepHandler for Recorder {
    async fn process_step(&mut self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError> {
        self.steps.lock().unwrap().push((block.id.clone(), block.number, step));
        Ok(())
    }
}

/// What a [`ScriptedSource`] does once its blocks run out.
#[derive(Clone, Debug)]
pub enum AfterEnd {
    Exhaust,
    Hang,
    Fail(String),
}

/// A source replaying a fixed list of blocks.
pub struct ScriptedSource {
    pub blocks: std::collections::VecDeque<Block>,
    pub after: AfterEnd,
    pub shutdowns: Arc<std::sync::atomic::AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(blocks: Vec<Block>, after: AfterEnd) -> Self {
        Self {
            blocks: blocks.into(),
            after,
            shutdowns: Arc::default(),
        }
    }
}

#[async_trait]
impl crate::source::BlockSource for ScriptedSource {
    async fn next_block(&mut self) -> Result<Option<Block>, IngestError> {
        if self.shutdowns.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            return Ok(None);
        }
        if let Some(b) = self.blocks.pop_front() {
            return Ok(Some(b));
        }
        match &self.after {
            AfterEnd::Exhaust => Ok(None),
            AfterEnd::Hang => futures::future::pending().await,
            AfterEnd::Fail(reason) => Err(IngestError::Pipeline(reason.clone())),
        }
    }

    fn shutdown(&mut self, _reason: crate::types::ShutdownReason) {
        self.shutdowns.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

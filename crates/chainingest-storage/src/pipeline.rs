//! In-memory pipeline that records what it is given.
//!
//! Every delivered block is held as an in-flight upload until
//! [`Pipeline::wait_on_uploads`] commits it, which can be slowed down or made
//! to fail to exercise shutdown paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use chainingest_core::error::IngestError;
use chainingest_core::pipeline::Pipeline;
use chainingest_core::types::{Block, ChainBlock, ForkStep};

#[derive(Default)]
pub struct MemoryPipeline {
    bootstrapped: Mutex<Option<u64>>,
    in_flight: Mutex<Vec<(Arc<Block>, ForkStep)>>,
    committed: Mutex<Vec<(Arc<Block>, ForkStep)>>,
    catch_up: AtomicBool,
    live: AtomicBool,
    catch_up_calls: AtomicUsize,
    live_calls: AtomicUsize,
    drains: AtomicUsize,
    drain_delay: Option<Duration>,
    fail_drain: Option<String>,
    stop_at: Option<u64>,
}

impl MemoryPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in `wait_on_uploads` before committing.
    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = Some(delay);
        self
    }

    /// Make `wait_on_uploads` fail with `reason`.
    pub fn with_failing_drain(mut self, reason: impl Into<String>) -> Self {
        self.fail_drain = Some(reason.into());
        self
    }

    /// Report the range complete once block `num` is irreversible.
    pub fn with_stop_at(mut self, num: u64) -> Self {
        self.stop_at = Some(num);
        self
    }

    pub fn bootstrapped_at(&self) -> Option<u64> {
        *self.bootstrapped.lock().unwrap()
    }

    pub fn in_catch_up_mode(&self) -> bool {
        self.catch_up.load(Ordering::Acquire)
    }

    pub fn in_live_mode(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Times the pipeline was put into catch-up mode.
    pub fn catch_up_switches(&self) -> usize {
        self.catch_up_calls.load(Ordering::Acquire)
    }

    /// Times the pipeline was put into live mode.
    pub fn live_switches(&self) -> usize {
        self.live_calls.load(Ordering::Acquire)
    }

    /// Calls to `wait_on_uploads`, failed ones included.
    pub fn drain_count(&self) -> usize {
        self.drains.load(Ordering::Acquire)
    }

    /// Numbers of committed blocks delivered with `step`, in delivery order.
    pub fn committed_nums(&self, step: ForkStep) -> Vec<u64> {
        self.committed
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == step)
            .map(|(b, _)| b.num())
            .collect()
    }

    /// Every `(number, id, step)` received so far, committed or not.
    pub fn delivered(&self) -> Vec<(u64, String, ForkStep)> {
        let committed = self.committed.lock().unwrap();
        let in_flight = self.in_flight.lock().unwrap();
        committed
            .iter()
            .chain(in_flight.iter())
            .map(|(b, s)| (b.num(), b.id().to_string(), *s))
            .collect()
    }

    /// Numbers received with `step`, committed or not, in delivery order.
    pub fn delivered_nums(&self, step: ForkStep) -> Vec<u64> {
        self.delivered()
            .into_iter()
            .filter(|(_, _, s)| *s == step)
            .map(|(n, _, _)| n)
            .collect()
    }
}

#[async_trait]
impl Pipeline for MemoryPipeline {
    async fn bootstrap(&self, start_block_num: u64) -> Result<(), IngestError> {
        *self.bootstrapped.lock().unwrap() = Some(start_block_num);
        Ok(())
    }

    fn set_catch_up_mode(&self) {
        self.catch_up_calls.fetch_add(1, Ordering::AcqRel);
        self.catch_up.store(true, Ordering::Release);
        self.live.store(false, Ordering::Release);
    }

    fn set_live_mode(&self) {
        self.live_calls.fetch_add(1, Ordering::AcqRel);
        self.catch_up.store(false, Ordering::Release);
        self.live.store(true, Ordering::Release);
    }

    async fn process_block(&self, block: Arc<Block>, step: ForkStep) -> Result<(), IngestError> {
        let done = step == ForkStep::Irreversible && Some(block.num()) == self.stop_at;
        self.in_flight.lock().unwrap().push((block, step));
        if done {
            return Err(IngestError::Completed);
        }
        Ok(())
    }

    async fn wait_on_uploads(&self) -> Result<(), IngestError> {
        self.drains.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.drain_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.fail_drain {
            return Err(IngestError::Pipeline(reason.clone()));
        }
        let drained: Vec<_> = self.in_flight.lock().unwrap().drain(..).collect();
        tracing::debug!(uploads = drained.len(), "uploads committed");
        self.committed.lock().unwrap().extend(drained);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::chain;

    #[tokio::test]
    async fn uploads_commit_on_drain() {
        let pipeline = MemoryPipeline::new();
        for b in chain(1, 3) {
            pipeline
                .process_block(Arc::new(b), ForkStep::Irreversible)
                .await
                .unwrap();
        }
        assert_eq!(pipeline.in_flight(), 3);
        pipeline.wait_on_uploads().await.unwrap();
        assert_eq!(pipeline.in_flight(), 0);
        assert_eq!(pipeline.committed_nums(ForkStep::Irreversible), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stop_at_reports_completion() {
        let pipeline = MemoryPipeline::new().with_stop_at(2);
        let mut results = Vec::new();
        for b in chain(1, 2) {
            results.push(pipeline.process_block(Arc::new(b), ForkStep::Irreversible).await);
        }
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_completed());
    }

    #[tokio::test]
    async fn failing_drain_keeps_uploads_in_flight() {
        let pipeline = MemoryPipeline::new().with_failing_drain("bucket unreachable");
        pipeline
            .process_block(Arc::new(chain(1, 1).remove(0)), ForkStep::New)
            .await
            .unwrap();
        assert!(pipeline.wait_on_uploads().await.is_err());
        assert_eq!(pipeline.in_flight(), 1);
        assert_eq!(pipeline.drain_count(), 1);
        assert_eq!(pipeline.delivered_nums(ForkStep::New), vec![1]);
    }

    #[test]
    fn modes_are_exclusive() {
        let pipeline = MemoryPipeline::new();
        pipeline.set_catch_up_mode();
        assert!(pipeline.in_catch_up_mode());
        pipeline.set_live_mode();
        assert!(pipeline.in_live_mode() && !pipeline.in_catch_up_mode());
        pipeline.set_catch_up_mode();
        assert_eq!(pipeline.catch_up_switches(), 2);
        assert_eq!(pipeline.live_switches(), 1);
    }
}

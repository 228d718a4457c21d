//! Eternal source: keeps a live stream going across normal terminations.
//!
//! Whenever the inner source ends cleanly, a fresh one is built by the
//! factory from the last delivered [`BlockRef`]; the factory is expected to
//! skip that block itself (an exclusive id gate). Errors are not retried.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::IngestError;
use crate::source::{terminal_result, BlockSource};
use crate::types::{Block, BlockRef, ChainBlock, ShutdownReason};

/// Builds a source resuming after the given block (`None` on the first start).
pub type SourceFactory =
    Box<dyn FnMut(Option<&BlockRef>) -> Result<Box<dyn BlockSource>, IngestError> + Send>;

pub struct EternalSource {
    factory: SourceFactory,
    current: Option<Box<dyn BlockSource>>,
    last: Option<BlockRef>,
    restart_delay: Duration,
    starts: u32,
    cancel: CancellationToken,
    reason: Option<ShutdownReason>,
}

impl EternalSource {
    pub fn new(factory: SourceFactory, restart_delay: Duration, cancel: &CancellationToken) -> Self {
        Self {
            factory,
            current: None,
            last: None,
            restart_delay,
            starts: 0,
            cancel: cancel.child_token(),
            reason: None,
        }
    }

    /// The last block handed out.
    pub fn last_delivered(&self) -> Option<&BlockRef> {
        self.last.as_ref()
    }
}

#[async_trait]
impl BlockSource for EternalSource {
    async fn next_block(&mut self) -> Result<Option<Block>, IngestError> {
        loop {
            if self.reason.is_some() || self.cancel.is_cancelled() {
                return terminal_result(self.reason.as_ref());
            }

            if self.current.is_none() {
                if self.starts > 0 {
                    tokio::select! {
                        _ = self.cancel.cancelled() => continue,
                        _ = tokio::time::sleep(self.restart_delay) => {}
                    }
                }
                self.starts += 1;
                self.current = Some((self.factory)(self.last.as_ref())?);
            }
            let Some(source) = self.current.as_mut() else {
                continue;
            };

            match source.next_block().await? {
                Some(block) => {
                    self.last = Some(block.block_ref());
                    return Ok(Some(block));
                }
                None => {
                    if let Some(mut ended) = self.current.take() {
                        ended.shutdown(ShutdownReason::Clean);
                    }
                    tracing::info!(
                        after = ?self.last.as_ref().map(|r| r.to_string()),
                        delay = ?self.restart_delay,
                        "source ended, restarting"
                    );
                }
            }
        }
    }

    fn shutdown(&mut self, reason: ShutdownReason) {
        if self.reason.is_some() {
            return;
        }
        if let Some(mut current) = self.current.take() {
            current.shutdown(reason.clone());
        }
        self.cancel.cancel();
        self.reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{chain, AfterEnd, ScriptedSource};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn restarts_after_last_delivered_block() {
        let seen_refs: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
        let refs = seen_refs.clone();
        let factory: SourceFactory = Box::new(move |after| {
            refs.lock().unwrap().push(after.map(|r| r.id().to_string()));
            let blocks = match after {
                None => chain(1, 3, 1),
                Some(r) => chain(r.num() + 1, r.num() + 2, 1),
            };
            Ok(Box::new(ScriptedSource::new(blocks, AfterEnd::Exhaust)) as Box<dyn BlockSource>)
        });
        let cancel = CancellationToken::new();
        let mut source = EternalSource::new(factory, Duration::from_millis(1), &cancel);

        let mut nums = Vec::new();
        for _ in 0..7 {
            nums.push(source.next_block().await.unwrap().unwrap().number);
        }
        assert_eq!(nums, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            seen_refs.lock().unwrap()[..3],
            [None, Some("b3".to_string()), Some("b5".to_string())]
        );
    }

    #[tokio::test]
    async fn errors_are_not_retried() {
        let factory: SourceFactory = Box::new(|_| {
            Ok(Box::new(ScriptedSource::new(chain(1, 1, 0), AfterEnd::Fail("disk gone".into())))
                as Box<dyn BlockSource>)
        });
        let cancel = CancellationToken::new();
        let mut source = EternalSource::new(factory, Duration::from_millis(1), &cancel);
        assert!(source.next_block().await.unwrap().is_some());
        assert!(matches!(source.next_block().await, Err(IngestError::Pipeline(_))));
    }

    #[tokio::test]
    async fn cancelled_run_is_not_restarted() {
        let factory: SourceFactory = Box::new(|_| {
            Ok(Box::new(ScriptedSource::new(vec![], AfterEnd::Exhaust)) as Box<dyn BlockSource>)
        });
        let cancel = CancellationToken::new();
        let mut source = EternalSource::new(factory, Duration::from_secs(3600), &cancel);
        cancel.cancel();
        assert!(source.next_block().await.unwrap().is_none());
    }
}

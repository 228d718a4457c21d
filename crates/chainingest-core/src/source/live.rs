//! Live source: follows a real-time block feed.
//!
//! A spawned task keeps one subscription open and forwards blocks into a
//! bounded channel. Dropped connections are re-established with exponential
//! backoff; the attempt counter resets as soon as a block arrives. Malformed
//! messages are fatal.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{FeedError, IngestError};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::source::{terminal_result, BlockFeed, BlockSource};
use crate::types::{Block, ShutdownReason};

/// Configuration for a [`LiveSource`].
#[derive(Debug, Clone)]
pub struct LiveSourceConfig {
    /// Feed endpoint address.
    pub address: String,
    /// Blocks buffered between the feed task and the consumer.
    pub buffer_size: usize,
    pub retry: RetryConfig,
    pub verbose: bool,
}

impl LiveSourceConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            buffer_size: 250,
            retry: RetryConfig::default(),
            verbose: false,
        }
    }
}

/// Delivers blocks from a live feed, in arrival order.
pub struct LiveSource {
    rx: mpsc::Receiver<Result<Block, IngestError>>,
    cancel: CancellationToken,
    reason: Option<ShutdownReason>,
    task: Option<JoinHandle<()>>,
}

impl LiveSource {
    pub fn spawn(feed: Arc<dyn BlockFeed>, config: LiveSourceConfig, cancel: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let cancel = cancel.child_token();
        tracing::info!(address = %config.address, buffer = config.buffer_size, "starting live source");
        let task = tokio::spawn(run_feed(feed, config, tx, cancel.clone()));
        Self {
            rx,
            cancel,
            reason: None,
            task: Some(task),
        }
    }
}

#[async_trait]
impl BlockSource for LiveSource {
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
        tracing::info!(%reason, "shutting down live source");
        self.reason = Some(reason);
        self.cancel.cancel();
        self.rx.close();
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_feed(
    feed: Arc<dyn BlockFeed>,
    config: LiveSourceConfig,
    tx: mpsc::Sender<Result<Block, IngestError>>,
    cancel: CancellationToken,
) {
    let policy = RetryPolicy::new(config.retry.clone());
    let mut attempt = 0u32;

    loop {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return,
            res = feed.subscribe(&config.address) => res,
        };

        let err = match subscribed {
            Ok(mut stream) => {
                tracing::info!(address = %config.address, "live feed connected");
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(block)) => {
                            attempt = 0;
                            if config.verbose {
                                tracing::debug!(num = block.number, id = %block.id, "live block");
                            }
                            let sent = tokio::select! {
                                _ = cancel.cancelled() => return,
                                sent = tx.send(Ok(block)) => sent,
                            };
                            if sent.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => break e,
                        None => break FeedError::Closed,
                    }
                }
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            tracing::error!(error = %err, "live feed failed");
            let _ = tx.send(Err(err.into())).await;
            return;
        }

        attempt += 1;
        match policy.next_delay(attempt) {
            Some(delay) => {
                tracing::warn!(attempt, error = %err, "live feed dropped, reconnecting in {delay:?}");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                tracing::error!(attempts = attempt - 1, error = %err, "live feed reconnects exhausted");
                let exhausted = FeedError::RetriesExhausted {
                    attempts: attempt - 1,
                    last: err.to_string(),
                };
                let _ = tx.send(Err(exhausted.into())).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BlockStream;
    use crate::testutil::chain;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Session {
        Refused,
        Serve(Vec<Result<Block, FeedError>>),
    }

    /// Replays one scripted session per `subscribe` call, then hangs.
    struct ScriptedFeed {
        sessions: Mutex<VecDeque<Session>>,
    }

    impl ScriptedFeed {
        fn new(sessions: Vec<Session>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
            })
        }
    }

    #[async_trait]
    impl BlockFeed for ScriptedFeed {
        async fn subscribe(&self, address: &str) -> Result<BlockStream, FeedError> {
            let next = self.sessions.lock().unwrap().pop_front();
            match next {
                Some(Session::Refused) => Err(FeedError::ConnectionFailed {
                    address: address.to_string(),
                    reason: "refused".into(),
                }),
                Some(Session::Serve(items)) => Ok(futures::stream::iter(items).boxed()),
                None => Ok(futures::stream::pending().boxed()),
            }
        }
    }

    fn fast_config(max_retries: u32) -> LiveSourceConfig {
        let mut config = LiveSourceConfig::new("ws://feed");
        config.retry = RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        };
        config
    }

    fn ok(blocks: Vec<Block>) -> Vec<Result<Block, FeedError>> {
        blocks.into_iter().map(Ok).collect()
    }

    #[tokio::test]
    async fn reconnects_and_keeps_delivering() {
        let feed = ScriptedFeed::new(vec![
            Session::Serve(ok(chain(10, 12, 1))),
            Session::Refused,
            Session::Serve(ok(chain(13, 14, 1))),
        ]);
        let cancel = CancellationToken::new();
        let mut source = LiveSource::spawn(feed, fast_config(3), &cancel);
        let mut nums = Vec::new();
        for _ in 0..5 {
            nums.push(source.next_block().await.unwrap().unwrap().number);
        }
        assert_eq!(nums, vec![10, 11, 12, 13, 14]);
        source.shutdown(ShutdownReason::Clean);
    }

    #[tokio::test]
    async fn malformed_message_is_fatal() {
        let mut items = ok(chain(1, 1, 0));
        items.push(Err(FeedError::Decode("not json".into())));
        let feed = ScriptedFeed::new(vec![Session::Serve(items)]);
        let cancel = CancellationToken::new();
        let mut source = LiveSource::spawn(feed, fast_config(3), &cancel);
        assert_eq!(source.next_block().await.unwrap().unwrap().number, 1);
        let err = source.next_block().await.unwrap_err();
        assert!(matches!(err, IngestError::Feed(FeedError::Decode(_))));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let feed = ScriptedFeed::new(vec![
            Session::Refused,
            Session::Refused,
            Session::Refused,
        ]);
        let cancel = CancellationToken::new();
        let mut source = LiveSource::spawn(feed, fast_config(2), &cancel);
        let err = source.next_block().await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Feed(FeedError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn fault_shutdown_surfaces_as_aborted() {
        let feed = ScriptedFeed::new(vec![]);
        let cancel = CancellationToken::new();
        let mut source = LiveSource::spawn(feed, fast_config(1), &cancel);
        source.shutdown(ShutdownReason::Fault("resolver failed".into()));
        let err = source.next_block().await.unwrap_err();
        assert!(matches!(err, IngestError::Aborted { .. }));
    }
}

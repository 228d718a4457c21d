//! The ingestor: validates the start point, wires one of the two topologies
//! and drives it until it stops, then drains the pipeline.
//!
//! ```text
//! batch:  HistoricalSource(+preprocess) ─▶ ForkResolver[IRREVERSIBLE] ─▶ BlockNumGate ─▶ PipelineSink
//! live:   EternalSource(JoiningSource(Historical, Live)) ─▶ ForkResolver[NEW|IRREVERSIBLE] ─▶ BlockNumGate ─▶ PipelineSink
//! ```
//!
//! The number gate sits after the resolver so the resolver can see the
//! ancestry of the start block; only blocks from the start block on reach the
//! pipeline either way. A batch run reads past its stop block until the stop
//! block is irreversible; the sink forwards nothing above it.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{IngestMode, IngestorConfig};
use crate::error::IngestError;
use crate::forkable::ForkResolver;
use crate::gate::{BlockIdGate, BlockNumGate, GateMode};
use crate::handler::BlockHandler;
use crate::health::HealthState;
use crate::pipeline::{Pipeline, PipelineSink};
use crate::source::{
    ArchiveStore, BlockFeed, BlockSource, EternalSource, HistoricalSource, HistoricalSourceConfig,
    JoinTarget, JoiningSource, LiveSource, LiveSourceConfig, PreprocessFn, SourceFactory,
};
use crate::tracker::HeadTracker;
use crate::types::{BlockRef, RunMode, RunModeHandle, ShutdownReason, ShutdownState, StepFilter};

type Topology = (Box<dyn BlockSource>, Box<dyn BlockHandler>);

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Assembles an [`Ingestor`] from its collaborators.
#[derive(Default)]
pub struct IngestorBuilder {
    config: Option<IngestorConfig>,
    archive: Option<Arc<dyn ArchiveStore>>,
    feed: Option<Arc<dyn BlockFeed>>,
    pipeline: Option<Arc<dyn Pipeline>>,
}

impl IngestorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: IngestorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn archive(mut self, archive: Arc<dyn ArchiveStore>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Live block feed. Required in live mode.
    pub fn feed(mut self, feed: Arc<dyn BlockFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Check that every collaborator the configured mode needs is present.
    pub fn build(self) -> Result<Ingestor, IngestError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let archive = self
            .archive
            .ok_or_else(|| IngestError::Config("an archive store is required".into()))?;
        let pipeline = self
            .pipeline
            .ok_or_else(|| IngestError::Config("a pipeline is required".into()))?;
        if config.mode == IngestMode::Live && self.feed.is_none() {
            return Err(IngestError::Config("live mode requires a block feed".into()));
        }

        let (state_tx, _) = watch::channel(ShutdownState::Running);
        Ok(Ingestor {
            config,
            archive,
            feed: self.feed,
            pipeline,
            health: HealthState::default(),
            tracker: HeadTracker::default(),
            run_mode: RunModeHandle::default(),
            cancel: CancellationToken::new(),
            stop_reason: Arc::new(OnceLock::new()),
            state: Arc::new(state_tx),
            bootstrapped: None,
        })
    }
}

// ─── Handle ───────────────────────────────────────────────────────────────────

/// Clone-able control and observation handle for a running [`Ingestor`].
#[derive(Clone)]
pub struct IngestorHandle {
    cancel: CancellationToken,
    stop_reason: Arc<OnceLock<ShutdownReason>>,
    health: HealthState,
    tracker: HeadTracker,
    state: watch::Receiver<ShutdownState>,
}

impl IngestorHandle {
    /// Ask the run to stop. The first reason wins; later calls are no-ops.
    pub fn stop(&self, reason: ShutdownReason) {
        if self.stop_reason.set(reason.clone()).is_ok() {
            tracing::info!(%reason, "stop requested");
        }
        self.cancel.cancel();
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Lag between the wall clock and the newest delivered block.
    pub async fn drift(&self) -> Option<chrono::Duration> {
        self.tracker.drift().await
    }

    pub async fn lib(&self) -> Option<BlockRef> {
        self.tracker.lib().await
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Resolve once every upload has been committed.
    pub async fn drained(&mut self) {
        let _ = self.state.wait_for(|s| *s == ShutdownState::Drained).await;
    }
}

// ─── Ingestor ─────────────────────────────────────────────────────────────────

pub struct Ingestor {
    config: IngestorConfig,
    archive: Arc<dyn ArchiveStore>,
    feed: Option<Arc<dyn BlockFeed>>,
    pipeline: Arc<dyn Pipeline>,
    health: HealthState,
    tracker: HeadTracker,
    run_mode: RunModeHandle,
    cancel: CancellationToken,
    stop_reason: Arc<OnceLock<ShutdownReason>>,
    state: Arc<watch::Sender<ShutdownState>>,
    bootstrapped: Option<u64>,
}

impl Ingestor {
    pub fn builder() -> IngestorBuilder {
        IngestorBuilder::new()
    }

    pub fn handle(&self) -> IngestorHandle {
        IngestorHandle {
            cancel: self.cancel.clone(),
            stop_reason: Arc::clone(&self.stop_reason),
            health: self.health.clone(),
            tracker: self.tracker.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn config(&self) -> &IngestorConfig {
        &self.config
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode.get()
    }

    /// Validate the start block against the shard size and hand it to the
    /// pipeline.
    pub async fn bootstrap(&mut self, start_block_num: u64) -> Result<(), IngestError> {
        let shard_size = self.config.shard_size;
        if start_block_num != 1 && start_block_num % shard_size != 0 {
            return Err(IngestError::Config(format!(
                "start block {start_block_num} is not on a shard boundary (shard size {shard_size})"
            )));
        }
        tracing::info!(start = start_block_num, shard_size, "bootstrapping pipeline");
        self.pipeline.bootstrap(start_block_num).await?;
        self.bootstrapped = Some(start_block_num);
        Ok(())
    }

    /// Build the configured topology and run it to the end, then clean up.
    ///
    /// Reaching the end of the range counts as success. Whatever ended the
    /// run, uploads are drained before this returns.
    pub async fn launch(&mut self) -> Result<(), IngestError> {
        let start = self
            .bootstrapped
            .ok_or_else(|| IngestError::Config("launch called before bootstrap".into()))?;

        let (mut source, mut handler) = match self.config.mode {
            IngestMode::Batch => self.build_batch_pipeline(start)?,
            IngestMode::Live => self.build_live_pipeline(start)?,
        };
        self.health.set_ready();
        tracing::info!(mode = %self.config.mode, start, "ingestor launched");

        let run = self.drive(source.as_mut(), handler.as_mut()).await;
        let reason = match &run {
            Ok(()) => ShutdownReason::Clean,
            Err(e) => {
                tracing::error!(error = %e, "ingestion failed");
                ShutdownReason::Fault(e.to_string())
            }
        };
        source.shutdown(reason);
        drop(handler);
        self.cleanup(run).await
    }

    /// Historical source only, irreversible blocks only, catch-up mode.
    pub fn build_batch_pipeline(&self, start: u64) -> Result<Topology, IngestError> {
        let seed = self.lib_seed(start);
        let file_start = seed.as_ref().map_or(start, |s| s.num());

        self.run_mode.set(RunMode::CatchUp);
        self.pipeline.set_catch_up_mode();

        let pipeline = Arc::clone(&self.pipeline);
        let preprocess: PreprocessFn = Arc::new(move |block| pipeline.preprocess_block(block));
        let source = HistoricalSource::spawn(
            Arc::clone(&self.archive),
            self.historical_config(file_start),
            Some(preprocess),
            &self.cancel,
        );

        let stop = self.config.stop_block_num;
        let handler = self.resolver(start, StepFilter::IRREVERSIBLE, seed, stop);
        tracing::info!(start, file_start, ?stop, "batch pipeline built");
        Ok((Box::new(source), handler))
    }

    /// Archive replay joined onto the live feed, restarted whenever it ends.
    /// Blocks are not preprocessed in this topology.
    pub fn build_live_pipeline(&self, start: u64) -> Result<Topology, IngestError> {
        let feed = self
            .feed
            .clone()
            .ok_or_else(|| IngestError::Config("live mode requires a block feed".into()))?;
        let seed = self.lib_seed(start);
        let file_start = seed.as_ref().map_or(start, |s| s.num());

        let factory = self.live_source_factory(file_start, feed);
        let source = EternalSource::new(
            factory,
            Duration::from_millis(self.config.restart_delay_ms),
            &self.cancel,
        );

        let handler = self.resolver(start, StepFilter::NEW | StepFilter::IRREVERSIBLE, seed, None);
        tracing::info!(start, file_start, "live pipeline built");
        Ok((Box::new(source), handler))
    }

    /// The irreversible block right before `start`, when the config names it.
    fn lib_seed(&self, start: u64) -> Option<BlockRef> {
        let id = self.config.previous_irreversible_id.as_ref()?;
        (start > 1).then(|| BlockRef::new(id.clone(), start - 1))
    }

    fn historical_config(&self, start: u64) -> HistoricalSourceConfig {
        let mut config = HistoricalSourceConfig::starting_at(start);
        config.retry = self.config.retry.clone();
        config.verbose = self.config.verbose;
        config
    }

    fn resolver(
        &self,
        start: u64,
        filter: StepFilter,
        seed: Option<BlockRef>,
        stop: Option<u64>,
    ) -> Box<dyn BlockHandler> {
        let sink = PipelineSink::new(
            Arc::clone(&self.pipeline),
            self.tracker.clone(),
            self.run_mode.clone(),
        )
        .with_stop_block(stop);
        let gate = BlockNumGate::new(start, GateMode::Inclusive, sink);
        let mut builder = ForkResolver::builder(gate).filter(filter);
        if let Some(seed) = seed {
            builder = builder.inclusive_lib(seed);
        }
        Box::new(builder.build())
    }

    /// Builds the joined archive + feed source of a live run. Every call puts
    /// the run (and the pipeline) back into catch-up mode; the joining source
    /// switches it to live again once it joins.
    pub fn live_source_factory(&self, file_start: u64, feed: Arc<dyn BlockFeed>) -> SourceFactory {
        let archive = Arc::clone(&self.archive);
        let historical = self.historical_config(file_start);
        let mut live_config = LiveSourceConfig::new(self.config.feed_address.clone().unwrap_or_default());
        live_config.buffer_size = self.config.live_buffer_size;
        live_config.retry = self.config.retry.clone();
        live_config.verbose = self.config.verbose;
        let join_buffer = self.config.join_buffer_size;
        let first_block = self.config.protocol_first_block;
        let run_mode = self.run_mode.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let cancel = self.cancel.clone();

        Box::new(move |after: Option<&BlockRef>| {
            run_mode.set(RunMode::CatchUp);
            pipeline.set_catch_up_mode();
            let (file, target) = match after {
                None => {
                    let file = HistoricalSource::spawn(Arc::clone(&archive), historical.clone(), None, &cancel);
                    (Box::new(file) as Box<dyn BlockSource>, first_block.map(JoinTarget::BlockNum))
                }
                Some(last) => {
                    tracing::info!(after = %last, "resuming live stream");
                    let mut resumed = historical.clone();
                    resumed.start_block_num = last.num();
                    let file = HistoricalSource::spawn(Arc::clone(&archive), resumed, None, &cancel);
                    let gated = BlockIdGate::new(last.id(), GateMode::Exclusive, file);
                    (Box::new(gated) as Box<dyn BlockSource>, Some(JoinTarget::from(last)))
                }
            };
            let live = LiveSource::spawn(Arc::clone(&feed), live_config.clone(), &cancel);
            let mut joining = JoiningSource::new(Some(file), Box::new(live), join_buffer, run_mode.clone());
            if let Some(target) = target {
                joining = joining.with_target(target);
            }
            Ok(Box::new(joining) as Box<dyn BlockSource>)
        })
    }

    async fn drive(
        &self,
        source: &mut dyn BlockSource,
        handler: &mut dyn BlockHandler,
    ) -> Result<(), IngestError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.requested_stop(),
                next = source.next_block() => next,
            };
            let block = match next {
                Ok(Some(block)) => block,
                Ok(None) => {
                    if self.cancel.is_cancelled() {
                        return self.requested_stop();
                    }
                    tracing::info!("source exhausted, range complete");
                    return Ok(());
                }
                Err(e) if e.is_completed() => return Ok(()),
                Err(e) => return Err(e),
            };

            self.tracker.set_head(&block).await;
            match handler.process_block(block).await {
                Ok(()) => {}
                Err(e) if e.is_completed() => {
                    tracing::info!("pipeline reported the range complete");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn requested_stop(&self) -> Result<(), IngestError> {
        match self.stop_reason.get() {
            Some(ShutdownReason::Fault(reason)) => Err(IngestError::Aborted {
                reason: reason.clone(),
            }),
            _ => {
                tracing::info!("clean stop requested");
                Ok(())
            }
        }
    }

    /// Flag shutdown for health checks, then block until every upload is
    /// committed. A failed drain is a failed shutdown.
    async fn cleanup(&self, run: Result<(), IngestError>) -> Result<(), IngestError> {
        self.health.set_shutting_down();
        self.state.send_replace(ShutdownState::Terminating);
        tracing::info!("waiting on pipeline uploads");

        match self.pipeline.wait_on_uploads().await {
            Ok(()) => {
                self.state.send_replace(ShutdownState::Drained);
                tracing::info!(success = run.is_ok(), "shutdown complete");
                run
            }
            Err(e) => {
                tracing::error!(error = %e, "upload drain failed");
                Err(IngestError::UploadDrain {
                    reason: e.to_string(),
                    run_error: run.err().map(|e| e.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArchiveError;
    use crate::source::BundleRead;
    use crate::types::{Block, ForkStep};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct NoArchive;

    #[async_trait]
    impl ArchiveStore for NoArchive {
        fn bundle_size(&self) -> u64 {
            100
        }
        async fn read_bundle(&self, _base: u64) -> Result<BundleRead, ArchiveError> {
            Ok(BundleRead::EndOfArchive)
        }
    }

    #[derive(Default)]
    struct NullPipeline {
        bootstrapped: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Pipeline for NullPipeline {
        async fn bootstrap(&self, start: u64) -> Result<(), IngestError> {
            self.bootstrapped.lock().unwrap().push(start);
            Ok(())
        }
        fn set_catch_up_mode(&self) {}
        async fn process_block(&self, _block: Arc<Block>, _step: ForkStep) -> Result<(), IngestError> {
            Ok(())
        }
        async fn wait_on_uploads(&self) -> Result<(), IngestError> {
            Ok(())
        }
    }

    fn ingestor(pipeline: Arc<NullPipeline>) -> Ingestor {
        let config = crate::config::IngestorConfigBuilder::new()
            .shard_size(100)
            .build()
            .unwrap();
        Ingestor::builder()
            .config(config)
            .archive(Arc::new(NoArchive))
            .pipeline(pipeline)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_enforces_shard_boundaries() {
        let pipeline = Arc::new(NullPipeline::default());
        let mut ing = ingestor(pipeline.clone());
        ing.bootstrap(100).await.unwrap();
        ing.bootstrap(1).await.unwrap();
        assert!(ing.bootstrap(150).await.unwrap_err().is_config());
        assert_eq!(*pipeline.bootstrapped.lock().unwrap(), vec![100, 1]);
    }

    #[tokio::test]
    async fn builder_requires_collaborators() {
        assert!(Ingestor::builder().build().is_err());
        let live = crate::config::IngestorConfigBuilder::new()
            .mode(IngestMode::Live)
            .feed_address("ws://feed")
            .build()
            .unwrap();
        let err = Ingestor::builder()
            .config(live)
            .archive(Arc::new(NoArchive))
            .pipeline(Arc::new(NullPipeline::default()))
            .build()
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn launch_before_bootstrap_is_rejected() {
        let mut ing = ingestor(Arc::new(NullPipeline::default()));
        assert!(ing.launch().await.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn empty_archive_completes_and_drains() {
        let mut ing = ingestor(Arc::new(NullPipeline::default()));
        let mut handle = ing.handle();
        ing.bootstrap(100).await.unwrap();
        ing.launch().await.unwrap();
        handle.drained().await;
        assert_eq!(handle.shutdown_state(), ShutdownState::Drained);
        assert!(handle.health().is_shutting_down());
    }

    #[tokio::test]
    async fn fault_stop_fails_the_run() {
        let mut ing = ingestor(Arc::new(NullPipeline::default()));
        let handle = ing.handle();
        ing.bootstrap(1).await.unwrap();
        handle.stop(ShutdownReason::Fault("operator abort".into()));
        handle.stop(ShutdownReason::Clean);
        let err = ing.launch().await.unwrap_err();
        assert!(matches!(err, IngestError::Aborted { reason } if reason == "operator abort"));
    }
}

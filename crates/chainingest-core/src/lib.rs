//! chainingest-core — block ingestion, fork resolution and run lifecycle.
//!
//! # Architecture
//!
//! ```text
//! IngestorBuilder → Ingestor
//!                      ├── BlockSource      (historical / live / joining / eternal)
//!                      ├── ForkResolver     (NEW / IRREVERSIBLE decisions, LIB)
//!                      ├── BlockNumGate     (start block alignment)
//!                      ├── PipelineSink     (downstream index writer)
//!                      └── HeadTracker / HealthState (lag + health)
//! ```

pub mod config;
pub mod error;
pub mod forkable;
pub mod gate;
pub mod handler;
pub mod health;
pub mod ingestor;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod testutil;

pub use config::{IngestMode, IngestorConfig, IngestorConfigBuilder, LogConfig};
pub use error::{ArchiveError, FeedError, IngestError};
pub use forkable::{ForkResolver, ForkResolverBuilder};
pub use gate::{BlockIdGate, BlockNumGate, GateMode};
pub use handler::{BlockHandler, StepHandler};
pub use health::{HealthSnapshot, HealthState};
pub use ingestor::{Ingestor, IngestorBuilder, IngestorHandle};
pub use pipeline::{Pipeline, PipelineSink};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{
    ArchiveStore, BlockFeed, BlockSource, BlockStream, BundleRead, CancellationToken, PreprocessFn,
};
pub use tracker::HeadTracker;
pub use types::{
    Block, BlockRef, ChainBlock, ForkStep, Protocol, RunMode, RunModeHandle, ShutdownReason,
    ShutdownState, StepFilter,
};

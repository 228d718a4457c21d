//! chainingest-storage — block archive stores and a recording pipeline.
//!
//! Backends:
//! - [`memory`] — in-memory bundles (tests, embedding)
//! - [`fs`] — JSON-lines bundle files on local disk via `tokio::fs`
//! - [`pipeline`] — in-memory [`Pipeline`](chainingest_core::Pipeline) that records deliveries

#[cfg(feature = "fs")]
pub mod fs;
#[cfg(feature = "memory")]
pub mod memory;
pub mod pipeline;

#[cfg(test)]
mod testutil;

use thiserror::Error;

#[cfg(feature = "fs")]
pub use fs::FsArchiveStore;
#[cfg(feature = "memory")]
pub use memory::MemoryArchiveStore;
pub use pipeline::MemoryPipeline;

/// Errors raised while writing to an archive.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// A block does not belong in the bundle it was written to.
    #[error("block #{block_num} does not belong to bundle {base}")]
    Misplaced { base: u64, block_num: u64 },
}

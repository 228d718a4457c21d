//! Filesystem block archive.
//!
//! Layout under the root directory:
//!
//! ```text
//! 0000000000.jsonl   blocks 0..bundle_size, one JSON block per line
//! 0000000100.jsonl
//! ...
//! SEALED             present once the archive is final
//! ```
//!
//! Bundles are written to a temporary file and renamed into place, so a
//! reader never sees a partial bundle.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use chainingest_core::error::ArchiveError;
use chainingest_core::source::{ArchiveStore, BundleRead};
use chainingest_core::types::Block;

use crate::StorageError;

const SEALED_MARKER: &str = "SEALED";

pub struct FsArchiveStore {
    root: PathBuf,
    bundle_size: u64,
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>, bundle_size: u64) -> Self {
        Self {
            root: root.into(),
            bundle_size: bundle_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_path(&self, base: u64) -> PathBuf {
        self.root.join(format!("{base:010}.jsonl"))
    }

    /// Write the bundle starting at `base`.
    pub async fn write_bundle(&self, base: u64, blocks: &[Block]) -> Result<(), StorageError> {
        let mut body = Vec::new();
        for block in blocks {
            if block.number < base || block.number >= base + self.bundle_size {
                return Err(StorageError::Misplaced {
                    base,
                    block_num: block.number,
                });
            }
            serde_json::to_writer(&mut body, block)?;
            body.push(b'\n');
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = self.root.join(format!(".{base:010}.jsonl.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.bundle_path(base)).await?;
        tracing::debug!(base, blocks = blocks.len(), "bundle written");
        Ok(())
    }

    /// Mark the archive as final.
    pub async fn seal(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.root.join(SEALED_MARKER), b"").await?;
        Ok(())
    }

    async fn is_sealed(&self) -> Result<bool, ArchiveError> {
        tokio::fs::try_exists(self.root.join(SEALED_MARKER))
            .await
            .map_err(|e| ArchiveError::Transient {
                base: 0,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    fn bundle_size(&self) -> u64 {
        self.bundle_size
    }

    async fn read_bundle(&self, base: u64) -> Result<BundleRead, ArchiveError> {
        let path = self.bundle_path(base);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(if self.is_sealed().await? {
                    BundleRead::EndOfArchive
                } else {
                    BundleRead::NotYetAvailable
                });
            }
            Err(e) => {
                return Err(ArchiveError::Transient {
                    base,
                    reason: format!("{}: {e}", path.display()),
                })
            }
        };

        let mut blocks = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let block: Block = serde_json::from_str(line).map_err(|e| ArchiveError::Fatal {
                base,
                reason: format!("{} line {}: {e}", path.display(), line_no + 1),
            })?;
            blocks.push(block);
        }
        Ok(BundleRead::Blocks(blocks))
    }
}

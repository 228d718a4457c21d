//! In-memory block archive.
//!
//! Bundles are published whole. Until the archive is sealed, a missing bundle
//! is reported as not yet available; afterwards it marks the end.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use chainingest_core::error::ArchiveError;
use chainingest_core::source::{ArchiveStore, BundleRead};
use chainingest_core::types::Block;

use crate::StorageError;

pub struct MemoryArchiveStore {
    bundle_size: u64,
    bundles: Mutex<BTreeMap<u64, Vec<Block>>>,
    sealed: AtomicBool,
}

impl MemoryArchiveStore {
    pub fn new(bundle_size: u64) -> Self {
        Self {
            bundle_size: bundle_size.max(1),
            bundles: Mutex::new(BTreeMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Group `blocks` into bundles and seal the archive.
    pub fn from_blocks(bundle_size: u64, blocks: impl IntoIterator<Item = Block>) -> Self {
        let store = Self::new(bundle_size);
        {
            let mut bundles = store.bundles.lock().unwrap();
            for block in blocks {
                let base = block.number - block.number % store.bundle_size;
                bundles.entry(base).or_default().push(block);
            }
            for bundle in bundles.values_mut() {
                bundle.sort_by_key(|b| b.number);
            }
        }
        store.seal();
        store
    }

    /// Publish the bundle starting at `base`, replacing any previous content.
    pub fn write_bundle(&self, base: u64, mut blocks: Vec<Block>) -> Result<(), StorageError> {
        if let Some(b) = blocks
            .iter()
            .find(|b| b.number < base || b.number >= base + self.bundle_size)
        {
            return Err(StorageError::Misplaced {
                base,
                block_num: b.number,
            });
        }
        blocks.sort_by_key(|b| b.number);
        self.bundles.lock().unwrap().insert(base, blocks);
        Ok(())
    }

    /// No bundle will be added after this.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn bundle_count(&self) -> usize {
        self.bundles.lock().unwrap().len()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    fn bundle_size(&self) -> u64 {
        self.bundle_size
    }

    async fn read_bundle(&self, base: u64) -> Result<BundleRead, ArchiveError> {
        if let Some(blocks) = self.bundles.lock().unwrap().get(&base) {
            return Ok(BundleRead::Blocks(blocks.clone()));
        }
        if self.sealed.load(Ordering::Acquire) {
            Ok(BundleRead::EndOfArchive)
        } else {
            Ok(BundleRead::NotYetAvailable)
        }
    }
}

//! Fork resolution: turns a tree of competing branches into NEW and
//! IRREVERSIBLE decisions.
//!
//! The resolver keeps every undecided block keyed by id. Each block must link
//! to the current root (the last irreversible block, the configured seed, or
//! the parent of the very first block when no seed is given) through blocks
//! already held. When a block declares a `lib_num` above the current LIB, the
//! part of *its own* ancestry up to that number becomes irreversible: those
//! blocks are emitted oldest first, the root moves forward, and every held
//! block that no longer descends from the new root is discarded.
//!
//! Every block that attaches is announced as NEW on arrival, whichever branch
//! it extends, so a consumer always sees a parent before its children.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::handler::{BlockHandler, StepHandler};
use crate::types::{Block, BlockRef, ChainBlock, ForkStep, StepFilter};

/// How many blocks below the LIB ids of discarded branches are remembered.
const EXCLUDED_RETENTION: u64 = 1_000;

/// Builder for [`ForkResolver`].
pub struct ForkResolverBuilder<H> {
    next: H,
    filter: StepFilter,
    seed: Option<(BlockRef, bool)>,
}

impl<H: StepHandler> ForkResolverBuilder<H> {
    /// Steps forwarded downstream (default: irreversible only).
    pub fn filter(mut self, filter: StepFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Seed a known-irreversible block that is expected to arrive again and
    /// must itself be emitted as irreversible.
    pub fn inclusive_lib(mut self, lib: BlockRef) -> Self {
        self.seed = Some((lib, true));
        self
    }

    /// Seed a known-irreversible block that was already delivered; only its
    /// descendants are emitted.
    pub fn exclusive_lib(mut self, lib: BlockRef) -> Self {
        self.seed = Some((lib, false));
        self
    }

    pub fn build(self) -> ForkResolver<H> {
        let (root, pending_inclusive) = match self.seed {
            Some((lib, inclusive)) if !lib.is_empty() => {
                let pending = inclusive.then(|| lib.clone());
                (Some(lib), pending)
            }
            _ => (None, None),
        };
        ForkResolver {
            next: self.next,
            filter: self.filter,
            lib: if pending_inclusive.is_some() { None } else { root.clone() },
            root,
            pending_inclusive,
            pending: HashMap::new(),
            excluded: HashMap::new(),
            head: None,
        }
    }
}

/// Buffers competing branches and emits decisions to `next`.
pub struct ForkResolver<H> {
    next: H,
    filter: StepFilter,
    /// Last block confirmed irreversible (seeded or emitted).
    lib: Option<BlockRef>,
    /// Block every held block must descend from.
    root: Option<BlockRef>,
    /// Inclusive seed still waiting to be seen.
    pending_inclusive: Option<BlockRef>,
    /// Undecided blocks by id.
    pending: HashMap<String, Arc<Block>>,
    /// Ids of blocks on discarded branches, with their numbers.
    excluded: HashMap<String, u64>,
    /// Highest block seen on any branch.
    head: Option<BlockRef>,
}

impl<H: StepHandler> ForkResolver<H> {
    pub fn builder(next: H) -> ForkResolverBuilder<H> {
        ForkResolverBuilder {
            next,
            filter: StepFilter::IRREVERSIBLE,
            seed: None,
        }
    }

    pub fn lib(&self) -> Option<&BlockRef> {
        self.lib.as_ref()
    }

    pub fn head(&self) -> Option<&BlockRef> {
        self.head.as_ref()
    }

    /// Number of undecided blocks held.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn into_inner(self) -> H {
        self.next
    }

    async fn emit(&mut self, block: &Arc<Block>, step: ForkStep) -> Result<(), IngestError> {
        if self.filter.contains(step) {
            self.next.process_step(Arc::clone(block), step).await?;
        }
        Ok(())
    }

    fn bump_head(&mut self, block: &Block) {
        if self.head.as_ref().map_or(true, |h| block.num() > h.num()) {
            self.head = Some(block.block_ref());
        }
    }

    async fn accept_inclusive_seed(&mut self, block: Block) -> Result<(), IngestError> {
        self.pending_inclusive = None;
        let block = Arc::new(block);
        tracing::info!(num = block.num(), id = block.id(), "inclusive LIB seed reached");
        self.root = Some(block.block_ref());
        self.lib = Some(block.block_ref());
        self.bump_head(&block);
        self.emit(&block, ForkStep::New).await?;
        self.emit(&block, ForkStep::Irreversible).await
    }

    /// Promote `tip`'s ancestry up to `target` and prune what it excludes.
    async fn advance_lib(&mut self, tip: &Arc<Block>, target: u64) -> Result<(), IngestError> {
        let mut segment = Vec::new();
        let mut cursor = Some(Arc::clone(tip));
        while let Some(b) = cursor {
            if b.num() <= target {
                segment.push(Arc::clone(&b));
            }
            cursor = self.pending.get(b.parent_id()).cloned();
        }
        if segment.is_empty() {
            return Ok(());
        }
        segment.reverse();

        for b in &segment {
            self.pending.remove(b.id());
            self.lib = Some(b.block_ref());
            self.root = Some(b.block_ref());
            self.emit(b, ForkStep::Irreversible).await?;
        }

        let new_root = b_ref(segment.last());
        tracing::debug!(lib = %new_root, emitted = segment.len(), "LIB advanced");
        self.prune(&new_root);
        Ok(())
    }

    fn prune(&mut self, root: &BlockRef) {
        let mut held: Vec<Arc<Block>> = self.pending.values().cloned().collect();
        held.sort_by_key(|b| b.num());

        let mut linked: HashSet<String> = HashSet::from([root.id().to_string()]);
        let mut dropped = 0usize;
        for b in held {
            if linked.contains(b.parent_id()) {
                linked.insert(b.id().to_string());
            } else {
                self.pending.remove(b.id());
                self.excluded.insert(b.id().to_string(), b.num());
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, lib = %root, "discarded forked branches");
        }

        let floor = root.num().saturating_sub(EXCLUDED_RETENTION);
        self.excluded.retain(|_, num| *num >= floor);

        let head_alive = self
            .head
            .as_ref()
            .map_or(false, |h| self.pending.contains_key(h.id()) || h == root);
        if !head_alive {
            self.head = self
                .pending
                .values()
                .max_by_key(|b| b.num())
                .map(|b| b.block_ref())
                .or_else(|| Some(root.clone()));
        }
    }
}

fn b_ref(block: Option<&Arc<Block>>) -> BlockRef {
    block.map(|b| b.block_ref()).unwrap_or_default()
}

#[async_trait]
impl<H: StepHandler> BlockHandler for ForkResolver<H> {
    async fn process_block(&mut self, block: Block) -> Result<(), IngestError> {
        if self.pending.contains_key(block.id()) {
            tracing::debug!(num = block.num(), id = block.id(), "duplicate block ignored");
            return Ok(());
        }

        if let Some(seed) = &self.pending_inclusive {
            if block.id() == seed.id() {
                return self.accept_inclusive_seed(block).await;
            }
        }

        let root = match &self.root {
            Some(root) => root.clone(),
            None => {
                let root = block.parent_ref();
                tracing::info!(num = block.num(), id = block.id(), "no LIB seed, rooting at first block");
                self.root = Some(root.clone());
                root
            }
        };

        if block.num() <= root.num() {
            tracing::debug!(num = block.num(), id = block.id(), lib = %root, "block at or below LIB dropped");
            return Ok(());
        }

        if self.excluded.contains_key(block.parent_id()) {
            tracing::debug!(num = block.num(), id = block.id(), "block on discarded branch dropped");
            self.excluded.insert(block.id().to_string(), block.num());
            return Ok(());
        }

        let attaches_to_root = block.parent_id() == root.id();
        if !attaches_to_root && !self.pending.contains_key(block.parent_id()) {
            return Err(IngestError::UnlinkableBlock {
                block_num: block.number,
                block_id: block.id,
                parent_id: block.parent_id,
            });
        }

        if attaches_to_root && self.pending_inclusive.take().is_some() {
            tracing::info!(num = block.num(), "child of inclusive LIB seed arrived first, seed considered delivered");
            self.lib = Some(root.clone());
        }

        let block = Arc::new(block);
        self.pending.insert(block.id().to_string(), Arc::clone(&block));
        self.bump_head(&block);
        self.emit(&block, ForkStep::New).await?;

        if block.lib_num() > root.num() {
            self.advance_lib(&block, block.lib_num()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{block, block_lib, chain, Recorder};

    fn resolver(rec: &Recorder, filter: StepFilter) -> ForkResolver<Recorder> {
        ForkResolver::builder(rec.clone()).filter(filter).build()
    }

    #[tokio::test]
    async fn linear_chain_emits_irreversible_in_order() {
        let rec = Recorder::default();
        let mut fr = resolver(&rec, StepFilter::IRREVERSIBLE);
        for b in chain(1, 10, 2) {
            fr.process_block(b).await.unwrap();
        }
        let ids = rec.irreversible_ids();
        assert_eq!(ids, (1..=8).map(|n| format!("b{n}")).collect::<Vec<_>>());
        assert_eq!(fr.lib().unwrap().num(), 8);
        assert_eq!(fr.pending_len(), 2);
    }

    #[tokio::test]
    async fn competing_branches_resolve_to_the_certified_one() {
        let rec = Recorder::default();
        let mut fr = ForkResolver::builder(rec.clone())
            .filter(StepFilter::ALL)
            .exclusive_lib(BlockRef::new("b50", 50))
            .build();

        fr.process_block(block(51, "51a", "b50")).await.unwrap();
        fr.process_block(block(51, "51b", "b50")).await.unwrap();
        fr.process_block(block_lib(52, "52b", "51b", 50)).await.unwrap();
        fr.process_block(block_lib(52, "52a", "51a", 51)).await.unwrap();

        assert_eq!(rec.irreversible_ids(), vec!["51a"]);
        // 52b descended from the losing branch and is gone.
        assert_eq!(fr.pending_len(), 1);
        assert_eq!(fr.head().unwrap().id(), "52a");

        // Late children of the discarded branch are dropped quietly.
        fr.process_block(block(53, "53b", "52b")).await.unwrap();
        assert_eq!(fr.pending_len(), 1);
    }

    #[tokio::test]
    async fn unknown_parent_is_fatal() {
        let rec = Recorder::default();
        let mut fr = ForkResolver::builder(rec.clone())
            .exclusive_lib(BlockRef::new("b10", 10))
            .build();
        fr.process_block(block(11, "b11", "b10")).await.unwrap();
        let err = fr.process_block(block(12, "b12", "zzz")).await.unwrap_err();
        assert!(matches!(err, IngestError::UnlinkableBlock { block_num: 12, .. }));
    }

    #[tokio::test]
    async fn inclusive_seed_is_emitted_then_children() {
        let rec = Recorder::default();
        let mut fr = ForkResolver::builder(rec.clone())
            .inclusive_lib(BlockRef::new("b100", 100))
            .build();
        assert!(fr.lib().is_none());
        for b in chain(98, 104, 1) {
            fr.process_block(b).await.unwrap();
        }
        assert_eq!(rec.irreversible_ids(), vec!["b100", "b101", "b102", "b103"]);
    }

    #[tokio::test]
    async fn same_seed_twice_gives_same_first_emission() {
        let mut firsts = Vec::new();
        for _ in 0..2 {
            let rec = Recorder::default();
            let mut fr = ForkResolver::builder(rec.clone())
                .inclusive_lib(BlockRef::new("b100", 100))
                .inclusive_lib(BlockRef::new("b100", 100))
                .build();
            for b in chain(100, 103, 0) {
                fr.process_block(b).await.unwrap();
            }
            firsts.push(rec.irreversible_ids().first().cloned());
        }
        assert_eq!(firsts[0], Some("b100".to_string()));
        assert_eq!(firsts[0], firsts[1]);
    }

    #[tokio::test]
    async fn fork_switch_announces_every_branch_block() {
        let rec = Recorder::default();
        let mut fr = ForkResolver::builder(rec.clone())
            .filter(StepFilter::NEW)
            .exclusive_lib(BlockRef::new("b50", 50))
            .build();
        fr.process_block(block(51, "51a", "b50")).await.unwrap();
        fr.process_block(block(51, "51b", "b50")).await.unwrap();
        fr.process_block(block(52, "52b", "51b")).await.unwrap();

        let announced: Vec<String> = rec.steps().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(announced, vec!["51a", "51b", "52b"]);
        assert_eq!(fr.head().unwrap().id(), "52b");
    }

    /// Block scripts with competing branches, each seeded at `b50`, and the
    /// irreversible ids they must produce.
    fn fork_scripts() -> Vec<(&'static str, Vec<Block>, Vec<&'static str>)> {
        vec![
            (
                "losing branch grows longer first",
                vec![
                    block_lib(51, "51a", "b50", 50),
                    block_lib(51, "51b", "b50", 50),
                    block_lib(52, "52b", "51b", 50),
                    block_lib(53, "53b", "52b", 50),
                    block_lib(52, "52a", "51a", 51),
                    block_lib(53, "53a", "52a", 52),
                    block_lib(54, "54a", "53a", 53),
                ],
                vec!["51a", "52a", "53a"],
            ),
            (
                "sibling arrives before the winner",
                vec![
                    block_lib(51, "51b", "b50", 50),
                    block_lib(51, "51a", "b50", 50),
                    block_lib(52, "52a", "51a", 50),
                    block_lib(52, "52b", "51b", 50),
                    block_lib(53, "53a", "52a", 52),
                ],
                vec!["51a", "52a"],
            ),
            (
                "deep fork above a shared prefix",
                vec![
                    block_lib(51, "51", "b50", 50),
                    block_lib(52, "52", "51", 50),
                    block_lib(53, "53a", "52", 50),
                    block_lib(53, "53b", "52", 50),
                    block_lib(54, "54b", "53b", 50),
                    block_lib(54, "54a", "53a", 50),
                    block_lib(55, "55b", "54b", 50),
                    block_lib(55, "55a", "54a", 52),
                    block_lib(56, "56a", "55a", 54),
                    block_lib(56, "56b", "55b", 50),
                ],
                vec!["51", "52", "53a", "54a"],
            ),
            (
                "three-way fork settled in one jump",
                vec![
                    block_lib(51, "51a", "b50", 50),
                    block_lib(51, "51b", "b50", 50),
                    block_lib(51, "51c", "b50", 50),
                    block_lib(52, "52c", "51c", 50),
                    block_lib(52, "52a", "51a", 50),
                    block_lib(53, "53c", "52c", 50),
                    block_lib(53, "53a", "52a", 50),
                    block_lib(54, "54a", "53a", 53),
                ],
                vec!["51a", "52a", "53a"],
            ),
        ]
    }

    #[tokio::test]
    async fn irreversible_output_is_prefix_closed_for_every_fork_script() {
        for (name, script, expected) in fork_scripts() {
            let parents: HashMap<String, String> = script
                .iter()
                .map(|b| (b.id.clone(), b.parent_id.clone()))
                .collect();
            let rec = Recorder::default();
            let mut fr = ForkResolver::builder(rec.clone())
                .filter(StepFilter::ALL)
                .exclusive_lib(BlockRef::new("b50", 50))
                .build();
            for b in script {
                fr.process_block(b).await.unwrap();
            }

            let irreversible: Vec<(String, u64)> = rec
                .steps()
                .into_iter()
                .filter(|(_, _, s)| *s == ForkStep::Irreversible)
                .map(|(id, num, _)| (id, num))
                .collect();
            assert_eq!(
                irreversible.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
                expected,
                "{name}"
            );

            let mut emitted: HashSet<String> = HashSet::from(["b50".to_string()]);
            let mut last_num = 50;
            for (id, num) in &irreversible {
                assert!(*num > last_num, "{name}: {id} not above {last_num}");
                assert!(emitted.contains(&parents[id]), "{name}: {id} before its parent");
                emitted.insert(id.clone());
                last_num = *num;
            }

            // Every announced block was announced after its parent.
            let mut announced: HashSet<String> = HashSet::from(["b50".to_string()]);
            for (id, _, step) in rec.steps() {
                if step == ForkStep::New {
                    assert!(announced.contains(&parents[&id]), "{name}: NEW {id} before its parent");
                    announced.insert(id);
                }
            }
        }
    }

    #[tokio::test]
    async fn duplicates_and_stale_blocks_are_ignored() {
        let rec = Recorder::default();
        let mut fr = resolver(&rec, StepFilter::ALL);
        for b in chain(1, 5, 1) {
            fr.process_block(b.clone()).await.unwrap();
            fr.process_block(b).await.unwrap();
        }
        let news = rec.steps().iter().filter(|s| s.2 == ForkStep::New).count();
        assert_eq!(news, 5);
        assert_eq!(rec.irreversible_ids().len(), 4);
    }

    #[tokio::test]
    async fn lib_never_decreases() {
        let rec = Recorder::default();
        let mut fr = resolver(&rec, StepFilter::IRREVERSIBLE);
        fr.process_block(block_lib(1, "b1", "b0", 0)).await.unwrap();
        fr.process_block(block_lib(2, "b2", "b1", 2)).await.unwrap();
        // A later block claiming an older LIB changes nothing.
        fr.process_block(block_lib(3, "b3", "b2", 1)).await.unwrap();
        assert_eq!(fr.lib().unwrap().num(), 2);
        assert_eq!(rec.irreversible_ids(), vec!["b1", "b2"]);
    }
}

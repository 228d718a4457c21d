//! Shared types for the ingestion pipeline.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// Identity of a block: an opaque id plus its number.
///
/// Equality is by id only; the number is an ordering hint. An empty reference
/// (no id) means "start of stream, position unknown".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockRef {
    id: String,
    num: u64,
}

impl BlockRef {
    pub fn new(id: impl Into<String>, num: u64) -> Self {
        Self { id: id.into(), num }
    }

    /// The "position unknown" reference.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

impl PartialEq for BlockRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BlockRef {}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "#{} ({})", self.num, self.id)
        }
    }
}

// ─── Protocol ─────────────────────────────────────────────────────────────────

/// Chain family a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Evm,
    Solana,
    Cosmos,
    Eos,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evm => write!(f, "evm"),
            Self::Solana => write!(f, "solana"),
            Self::Cosmos => write!(f, "cosmos"),
            Self::Eos => write!(f, "eos"),
        }
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block as it travels from a source through the resolver to the pipeline.
///
/// Never mutated after creation; a preprocessor returns a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number.
    pub number: u64,
    /// Block id (hash).
    pub id: String,
    /// Parent block id.
    pub parent_id: String,
    /// Parent block number (usually `number - 1`, not on every chain).
    pub parent_num: u64,
    /// Highest block number the chain declares irreversible as of this block.
    pub lib_num: u64,
    /// Block production time.
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    /// Opaque encoded payload.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.parent_id == parent.id
    }

    pub fn parent_ref(&self) -> BlockRef {
        BlockRef::new(self.parent_id.clone(), self.parent_num)
    }
}

/// Capability the gates and the resolver need from a block, regardless of
/// the protocol it was decoded from.
pub trait ChainBlock {
    fn num(&self) -> u64;
    fn id(&self) -> &str;
    fn parent_id(&self) -> &str;
    fn lib_num(&self) -> u64;

    fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.id(), self.num())
    }
}

impl ChainBlock for Block {
    fn num(&self) -> u64 {
        self.number
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn parent_id(&self) -> &str {
        &self.parent_id
    }

    fn lib_num(&self) -> u64 {
        self.lib_num
    }
}

// ─── ForkStep / StepFilter ────────────────────────────────────────────────────

/// Decision the resolver attaches to an emitted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForkStep {
    /// First sighting of a candidate block; may still be forked out.
    New,
    /// The block can no longer be reverted.
    Irreversible,
}

impl fmt::Display for ForkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Irreversible => write!(f, "irreversible"),
        }
    }
}

/// Set of steps the resolver forwards downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepFilter(u8);

impl StepFilter {
    pub const NEW: StepFilter = StepFilter(0b01);
    pub const IRREVERSIBLE: StepFilter = StepFilter(0b10);
    pub const ALL: StepFilter = StepFilter(0b11);

    pub fn contains(self, step: ForkStep) -> bool {
        let bit = match step {
            ForkStep::New => Self::NEW.0,
            ForkStep::Irreversible => Self::IRREVERSIBLE.0,
        };
        self.0 & bit != 0
    }
}

impl std::ops::BitOr for StepFilter {
    type Output = StepFilter;

    fn bitor(self, rhs: Self) -> Self::Output {
        StepFilter(self.0 | rhs.0)
    }
}

// ─── RunMode ──────────────────────────────────────────────────────────────────

/// Ingestion mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Replaying history from the archive.
    CatchUp,
    /// Following a contested chain tip.
    Live,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CatchUp => write!(f, "catch-up"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Shared, lock-free cell holding the current [`RunMode`].
///
/// Cloned into the joining source (which flips it on join) and the pipeline
/// sink. Every switch from catch-up to live bumps a join counter, so a reader
/// can tell a re-join apart from the join it already acted on.
#[derive(Debug, Clone)]
pub struct RunModeHandle {
    mode: Arc<AtomicU8>,
    joins: Arc<AtomicU64>,
}

impl RunModeHandle {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode: Arc::new(AtomicU8::new(Self::encode(mode))),
            joins: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn get(&self) -> RunMode {
        match self.mode.load(Ordering::Acquire) {
            0 => RunMode::CatchUp,
            _ => RunMode::Live,
        }
    }

    pub fn set(&self, mode: RunMode) {
        let previous = self.mode.swap(Self::encode(mode), Ordering::AcqRel);
        if mode == RunMode::Live && previous != Self::encode(RunMode::Live) {
            self.joins.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Number of catch-up to live switches so far.
    pub fn joins(&self) -> u64 {
        self.joins.load(Ordering::Acquire)
    }

    fn encode(mode: RunMode) -> u8 {
        match mode {
            RunMode::CatchUp => 0,
            RunMode::Live => 1,
        }
    }
}

impl Default for RunModeHandle {
    fn default() -> Self {
        Self::new(RunMode::CatchUp)
    }
}

// ─── Shutdown ─────────────────────────────────────────────────────────────────

/// Lifecycle of a run's teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownState {
    Running,
    /// A stop was requested; waiting on in-flight uploads.
    Terminating,
    /// All uploads committed; the run is fully stopped.
    Drained,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Terminating => write!(f, "terminating"),
            Self::Drained => write!(f, "drained"),
        }
    }
}

/// Why a pipeline is being torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Clean,
    Fault(String),
}

impl ShutdownReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean stop"),
            Self::Fault(reason) => write!(f, "fault: {reason}"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

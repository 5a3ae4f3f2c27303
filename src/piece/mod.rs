mod bitfield;
mod coordinator;
mod interval_set;
mod layout;
mod picker;
mod write_job;

pub use bitfield::Bitfield;
pub use coordinator::{CoordinatorBuilder, SwarmCoordinator};
pub use interval_set::IntervalSet;
pub use layout::{FileEntry, PieceLayout};
pub use picker::{
    LargestGap, RandomGap, RandomPiece, SelectionStrategy, Sequential, StrategyKind,
};
pub use write_job::{IoControl, PieceWriteJob, DEFAULT_CHUNK_SIZE};

use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive range of bytes, relative to the start of the whole download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub low: u64,
    pub high: u64,
}

impl ByteRange {
    pub fn new(low: u64, high: u64) -> Self {
        debug_assert!(low <= high, "inverted range {}-{}", low, high);
        Self { low, high }
    }

    /// Like `new`, but rejects `low > high` instead of asserting.
    pub fn try_new(low: u64, high: u64) -> Option<Self> {
        (low <= high).then_some(Self { low, high })
    }

    pub fn len(&self) -> u64 {
        self.high - self.low + 1
    }

    pub fn contains(&self, other: &ByteRange) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// An inclusive range of bytes relative to the start of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceInterval {
    pub piece_index: u32,
    pub low: u32,
    pub high: u32,
}

impl PieceInterval {
    pub fn new(piece_index: u32, low: u32, high: u32) -> Self {
        debug_assert!(low <= high, "inverted interval {}-{}", low, high);
        Self {
            piece_index,
            low,
            high,
        }
    }

    pub fn len(&self) -> u32 {
        self.high - self.low + 1
    }
}

impl fmt::Display for PieceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece {} [{}-{}]", self.piece_index, self.low, self.high)
    }
}

/// Where a range of the download is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseState {
    /// Nobody holds it; eligible for leasing
    Free,
    /// Exclusively claimed by one source
    Leased,
    /// A flush to the disk backend is outstanding
    Pending,
    /// On disk, waiting for its piece to be verified
    Written,
    /// Hash checked and final
    Verified,
}

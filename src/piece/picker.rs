use super::{ByteRange, IntervalSet};
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Chooses the next range to lease.
///
/// `candidates` is already restricted to bytes that are free and that the
/// source can serve. Implementations return a sub-range of `candidates` no
/// longer than `block_size`, aligned so it never crosses a multiple of
/// `block_size`, or `None` when `candidates` is empty.
pub trait SelectionStrategy: Send + Sync {
    fn select_next(&self, candidates: &IntervalSet, block_size: u64) -> Option<ByteRange>;
}

/// The block around `pos`, clipped to `range`.
fn block_containing(range: &ByteRange, pos: u64, block_size: u64) -> ByteRange {
    let block = pos / block_size;
    let low = range.low.max(block * block_size);
    let high = range
        .high
        .min((block + 1).saturating_mul(block_size).saturating_sub(1));
    ByteRange::new(low, high)
}

/// Lowest free block first.
#[derive(Debug, Default)]
pub struct Sequential;

impl SelectionStrategy for Sequential {
    fn select_next(&self, candidates: &IntervalSet, block_size: u64) -> Option<ByteRange> {
        let first = candidates.first()?;
        Some(block_containing(&first, first.low, block_size))
    }
}

/// The block holding a uniformly random candidate byte.
#[derive(Debug)]
pub struct RandomPiece {
    rng: Mutex<StdRng>,
}

impl RandomPiece {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomPiece {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RandomPiece {
    fn select_next(&self, candidates: &IntervalSet, block_size: u64) -> Option<ByteRange> {
        let total = candidates.byte_count();
        if total == 0 {
            return None;
        }

        let mut skip = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..total);

        for range in candidates.iter() {
            if skip < range.len() {
                return Some(block_containing(&range, range.low + skip, block_size));
            }
            skip -= range.len();
        }
        None
    }
}

/// Start of the largest contiguous candidate gap. Equal gaps go to the one
/// with the lowest offset.
#[derive(Debug, Default)]
pub struct LargestGap;

impl SelectionStrategy for LargestGap {
    fn select_next(&self, candidates: &IntervalSet, block_size: u64) -> Option<ByteRange> {
        let mut best: Option<ByteRange> = None;
        for range in candidates.iter() {
            if best.map_or(true, |b| range.len() > b.len()) {
                best = Some(range);
            }
        }
        best.map(|gap| block_containing(&gap, gap.low, block_size))
    }
}

/// Start of a uniformly random candidate gap.
#[derive(Debug)]
pub struct RandomGap {
    rng: Mutex<StdRng>,
}

impl RandomGap {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomGap {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RandomGap {
    fn select_next(&self, candidates: &IntervalSet, block_size: u64) -> Option<ByteRange> {
        let count = candidates.num_ranges();
        if count == 0 {
            return None;
        }
        let pick = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..count);
        let gap = candidates.iter().nth(pick)?;
        Some(block_containing(&gap, gap.low, block_size))
    }
}

/// Strategy names accepted by the CLI and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Sequential,
    RandomPiece,
    LargestGap,
    RandomGap,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            StrategyKind::Sequential => Box::new(Sequential),
            StrategyKind::RandomPiece => Box::new(RandomPiece::new()),
            StrategyKind::LargestGap => Box::new(LargestGap),
            StrategyKind::RandomGap => Box::new(RandomGap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> IntervalSet {
        ranges.iter().map(|&(l, h)| ByteRange::new(l, h)).collect()
    }

    #[test]
    fn test_sequential_clips_to_block() {
        let candidates = set(&[(5, 100)]);
        assert_eq!(
            Sequential.select_next(&candidates, 16),
            Some(ByteRange::new(5, 15))
        );
        assert_eq!(Sequential.select_next(&IntervalSet::new(), 16), None);
    }

    #[test]
    fn test_largest_gap_prefers_lowest_on_tie() {
        let candidates = set(&[(0, 9), (20, 39), (50, 69)]);
        assert_eq!(
            LargestGap.select_next(&candidates, 100),
            Some(ByteRange::new(20, 39))
        );
        assert_eq!(
            LargestGap.select_next(&candidates, 8),
            Some(ByteRange::new(20, 23))
        );
    }

    #[test]
    fn test_random_strategies_stay_inside_candidates() {
        let candidates = set(&[(3, 12), (40, 41), (90, 200)]);
        let piece = RandomPiece::with_seed(7);
        let gap = RandomGap::with_seed(7);
        for _ in 0..200 {
            for picked in [
                piece.select_next(&candidates, 10).unwrap(),
                gap.select_next(&candidates, 10).unwrap(),
            ] {
                assert!(candidates.contains(&picked), "{} escaped", picked);
                assert!(picked.len() <= 10);
                assert_eq!(picked.low / 10, picked.high / 10);
            }
        }
    }

    #[test]
    fn test_random_piece_covers_every_block() {
        let candidates = set(&[(0, 39)]);
        let piece = RandomPiece::with_seed(1);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(piece.select_next(&candidates, 10).unwrap().low);
        }
        assert_eq!(seen.len(), 4);
    }
}

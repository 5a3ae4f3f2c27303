use super::ByteRange;
use std::collections::BTreeMap;
use std::fmt;

/// A set of disjoint, non-adjacent byte ranges. Adding a range that touches
/// or overlaps existing ones coalesces them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    /// low -> high, both inclusive
    ranges: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(range: ByteRange) -> Self {
        let mut set = Self::new();
        set.add(range);
        set
    }

    pub fn add(&mut self, range: ByteRange) {
        let mut low = range.low;
        let mut high = range.high;

        // Ranges are sorted and disjoint, so walking down from the last one
        // that starts at or before high+1 visits every merge candidate.
        let merge: Vec<u64> = self
            .ranges
            .range(..=high.saturating_add(1))
            .rev()
            .take_while(|(_, &h)| h.saturating_add(1) >= low)
            .map(|(&l, _)| l)
            .collect();

        for l in merge {
            if let Some(h) = self.ranges.remove(&l) {
                low = low.min(l);
                high = high.max(h);
            }
        }

        self.ranges.insert(low, high);
    }

    pub fn delete(&mut self, range: ByteRange) {
        let hit: Vec<(u64, u64)> = self
            .ranges
            .range(..=range.high)
            .rev()
            .take_while(|(_, &h)| h >= range.low)
            .map(|(&l, &h)| (l, h))
            .collect();

        for (l, h) in hit {
            self.ranges.remove(&l);
            if l < range.low {
                self.ranges.insert(l, range.low - 1);
            }
            if h > range.high {
                self.ranges.insert(range.high + 1, h);
            }
        }
    }

    pub fn add_all(&mut self, other: &IntervalSet) {
        for range in other.iter() {
            self.add(range);
        }
    }

    pub fn delete_all(&mut self, other: &IntervalSet) {
        for range in other.iter() {
            self.delete(range);
        }
    }

    /// True if every byte of `range` is in the set.
    pub fn contains(&self, range: &ByteRange) -> bool {
        self.ranges
            .range(..=range.low)
            .next_back()
            .is_some_and(|(_, &h)| h >= range.high)
    }

    /// True if any byte of `range` is in the set.
    pub fn overlaps(&self, range: &ByteRange) -> bool {
        self.ranges
            .range(..=range.high)
            .next_back()
            .is_some_and(|(_, &h)| h >= range.low)
    }

    /// The part of the set that falls inside `range`.
    pub fn intersect_range(&self, range: &ByteRange) -> IntervalSet {
        let mut out = IntervalSet::new();
        for (&l, &h) in self.ranges.range(..=range.high).rev() {
            if h < range.low {
                break;
            }
            out.ranges.insert(l.max(range.low), h.min(range.high));
        }
        out
    }

    pub fn intersect(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = IntervalSet::new();
        for range in other.iter() {
            for piece in self.intersect_range(&range).iter() {
                out.add(piece);
            }
        }
        out
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = ByteRange> + '_ {
        self.ranges.iter().map(|(&l, &h)| ByteRange::new(l, h))
    }

    pub fn first(&self) -> Option<ByteRange> {
        self.ranges.iter().next().map(|(&l, &h)| ByteRange::new(l, h))
    }

    /// Total number of bytes covered.
    pub fn byte_count(&self) -> u64 {
        self.ranges.iter().map(|(&l, &h)| h - l + 1).sum()
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

impl FromIterator<ByteRange> for IntervalSet {
    fn from_iter<I: IntoIterator<Item = ByteRange>>(iter: I) -> Self {
        let mut set = IntervalSet::new();
        for range in iter {
            set.add(range);
        }
        set
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ranges.iter().map(|(l, h)| format!("{}-{}", l, h)))
            .finish()
    }
}

use super::{Bitfield, ByteRange, IntervalSet, PieceInterval};
use crate::error::{SwarmError, Result};

/// One file of a multi-file download, placed at `offset` in the global byte
/// space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components relative to the download directory
    pub path: Vec<String>,
    pub length: u64,
    /// Global offset of the first byte of this file
    pub offset: u64,
}

impl FileEntry {
    /// Global range covered by the file, or `None` for empty files.
    pub fn range(&self) -> Option<ByteRange> {
        (self.length > 0).then(|| ByteRange::new(self.offset, self.offset + self.length - 1))
    }
}

/// Piece geometry of a download and its files. Translates between global
/// byte ranges and piece-relative intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceLayout {
    piece_length: u64,
    total_length: u64,
    files: Vec<FileEntry>,
}

impl PieceLayout {
    /// Layout of a single-file download called `name`.
    pub fn single_file(name: &str, piece_length: u64, total_length: u64) -> Result<Self> {
        Self::from_files(piece_length, vec![(vec![name.to_string()], total_length)])
    }

    /// Lays out files back to back in the order given.
    pub fn from_files(piece_length: u64, files: Vec<(Vec<String>, u64)>) -> Result<Self> {
        if piece_length == 0 || piece_length > u32::MAX as u64 {
            return Err(SwarmError::ConfigError(format!(
                "piece length {} is not representable on the wire",
                piece_length
            )));
        }

        let mut entries = Vec::with_capacity(files.len());
        let mut offset = 0u64;
        for (path, length) in files {
            entries.push(FileEntry {
                path,
                length,
                offset,
            });
            offset += length;
        }

        if offset == 0 {
            return Err(SwarmError::ConfigError("download has no content".to_string()));
        }

        Ok(Self {
            piece_length,
            total_length: offset,
            files: entries,
        })
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn num_pieces(&self) -> usize {
        self.total_length.div_ceil(self.piece_length) as usize
    }

    /// Size of the given piece; the last one may be short.
    pub fn piece_size(&self, piece_index: u32) -> Option<u64> {
        let start = piece_index as u64 * self.piece_length;
        if start >= self.total_length {
            return None;
        }
        Some(self.piece_length.min(self.total_length - start))
    }

    /// The whole download as one range.
    pub fn full_range(&self) -> ByteRange {
        ByteRange::new(0, self.total_length - 1)
    }

    pub fn piece_range(&self, piece_index: u32) -> Option<ByteRange> {
        let size = self.piece_size(piece_index)?;
        let start = piece_index as u64 * self.piece_length;
        Some(ByteRange::new(start, start + size - 1))
    }

    /// True if `interval` names an existing piece and lies inside it.
    pub fn is_valid(&self, interval: &PieceInterval) -> bool {
        self.piece_size(interval.piece_index)
            .is_some_and(|size| interval.low <= interval.high && (interval.high as u64) < size)
    }

    /// Splits a global range into one interval per piece it touches, in
    /// ascending order.
    pub fn to_intervals(&self, range: &ByteRange) -> Result<Vec<PieceInterval>> {
        if range.low > range.high || range.high >= self.total_length {
            return Err(SwarmError::InvalidRange(format!(
                "{} is outside 0-{}",
                range,
                self.total_length - 1
            )));
        }

        let first = range.low / self.piece_length;
        let last = range.high / self.piece_length;
        let mut intervals = Vec::with_capacity((last - first + 1) as usize);

        for index in first..=last {
            let piece_start = index * self.piece_length;
            let piece_end = (piece_start + self.piece_length - 1).min(self.total_length - 1);
            let low = range.low.max(piece_start) - piece_start;
            let high = range.high.min(piece_end) - piece_start;
            intervals.push(PieceInterval::new(index as u32, low as u32, high as u32));
        }

        Ok(intervals)
    }

    pub fn interval_to_range(&self, interval: &PieceInterval) -> ByteRange {
        let start = interval.piece_index as u64 * self.piece_length;
        ByteRange::new(start + interval.low as u64, start + interval.high as u64)
    }

    /// Joins intervals back into a single global range. Returns `None` if
    /// they are empty or not contiguous.
    pub fn to_range(&self, intervals: &[PieceInterval]) -> Option<ByteRange> {
        let mut ranges = intervals.iter().map(|i| self.interval_to_range(i));
        let first = ranges.next()?;
        let mut high = first.high;
        for range in ranges {
            if range.low != high + 1 {
                return None;
            }
            high = range.high;
        }
        Some(ByteRange::new(first.low, high))
    }

    /// Byte ranges of every piece set in `available`.
    pub fn available_ranges(&self, available: &Bitfield) -> IntervalSet {
        available
            .iter_set()
            .filter_map(|index| self.piece_range(index as u32))
            .collect()
    }

    /// Pieces that `range` touches, ascending.
    pub fn pieces_touching(&self, range: &ByteRange) -> std::ops::RangeInclusive<u32> {
        let first = (range.low / self.piece_length) as u32;
        let last = (range.high.min(self.total_length - 1) / self.piece_length) as u32;
        first..=last
    }

    /// Index of the file holding global byte `offset`.
    pub fn file_at(&self, offset: u64) -> Option<usize> {
        self.files
            .iter()
            .position(|f| offset >= f.offset && offset < f.offset + f.length)
    }

    /// Splits a global range into `(file index, offset in file, length)`
    /// spans, skipping empty files.
    pub fn file_spans(&self, range: &ByteRange) -> Vec<(usize, u64, u64)> {
        let mut spans = Vec::new();
        for (index, file) in self.files.iter().enumerate() {
            let Some(file_range) = file.range() else {
                continue;
            };
            if !file_range.overlaps(range) {
                continue;
            }
            let low = range.low.max(file_range.low);
            let high = range.high.min(file_range.high);
            spans.push((index, low - file.offset, high - low + 1));
        }
        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(piece_length: u64, total: u64) -> PieceLayout {
        PieceLayout::single_file("data.bin", piece_length, total).unwrap()
    }

    #[test]
    fn test_piece_geometry() {
        let l = layout(10, 35);
        assert_eq!(l.num_pieces(), 4);
        assert_eq!(l.piece_size(0), Some(10));
        assert_eq!(l.piece_size(3), Some(5));
        assert_eq!(l.piece_size(4), None);
        assert_eq!(l.piece_range(3), Some(ByteRange::new(30, 34)));
    }

    #[test]
    fn test_range_straddling_pieces() {
        let l = layout(10, 35);
        let intervals = l.to_intervals(&ByteRange::new(7, 32)).unwrap();
        assert_eq!(
            intervals,
            vec![
                PieceInterval::new(0, 7, 9),
                PieceInterval::new(1, 0, 9),
                PieceInterval::new(2, 0, 9),
                PieceInterval::new(3, 0, 2),
            ]
        );
    }

    #[test]
    fn test_range_out_of_bounds() {
        let l = layout(10, 35);
        assert!(l.to_intervals(&ByteRange::new(30, 35)).is_err());
    }

    #[test]
    fn test_range_piece_round_trip() {
        for piece_length in [1u64, 3, 9, 16] {
            let l = layout(piece_length, 50);
            for low in 0..50 {
                for high in low..50 {
                    let range = ByteRange::new(low, high);
                    let intervals = l.to_intervals(&range).unwrap();
                    assert!(intervals.iter().all(|i| l.is_valid(i)));
                    assert_eq!(l.to_range(&intervals), Some(range));
                }
            }
        }
    }

    #[test]
    fn test_to_range_rejects_gaps() {
        let l = layout(10, 35);
        let intervals = [PieceInterval::new(0, 0, 8), PieceInterval::new(1, 0, 9)];
        assert_eq!(l.to_range(&intervals), None);
        assert_eq!(l.to_range(&[]), None);
    }

    #[test]
    fn test_is_valid() {
        let l = layout(10, 35);
        assert!(l.is_valid(&PieceInterval::new(3, 0, 4)));
        assert!(!l.is_valid(&PieceInterval::new(3, 0, 5)));
        assert!(!l.is_valid(&PieceInterval::new(4, 0, 0)));
    }

    #[test]
    fn test_file_spans() {
        let l = PieceLayout::from_files(
            8,
            vec![
                (vec!["a".into()], 5),
                (vec!["empty".into()], 0),
                (vec!["dir".into(), "b".into()], 10),
            ],
        )
        .unwrap();
        assert_eq!(l.total_length(), 15);
        assert_eq!(l.file_spans(&ByteRange::new(3, 9)), vec![(0, 3, 2), (2, 0, 5)]);
        assert_eq!(l.file_at(5), Some(2));
        assert_eq!(l.file_at(15), None);
    }

    #[test]
    fn test_available_ranges() {
        let l = layout(10, 35);
        let mut bf = Bitfield::new(4);
        bf.set_piece(0);
        bf.set_piece(1);
        bf.set_piece(3);
        let ranges: Vec<_> = l.available_ranges(&bf).iter().collect();
        assert_eq!(ranges, vec![ByteRange::new(0, 19), ByteRange::new(30, 34)]);
    }
}

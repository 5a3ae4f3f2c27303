use super::{ByteRange, PieceInterval, SwarmCoordinator};
use crate::error::{SwarmError, Result};
use crate::peer::ByteSource;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Default largest block handed to the disk backend at once.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Flow control toward whatever is feeding a write job.
pub trait IoControl: Send + Sync {
    /// Stop producing more data for now.
    fn pause(&self);
    /// Data may flow again.
    fn resume(&self);
}

/// Streams the bytes of one lease into the disk backend.
///
/// The lease is split into piece intervals up front. Incoming bytes are
/// buffered until the current chunk is full, where a chunk never crosses a
/// piece boundary and is at most `max_chunk` bytes, and then flushed as a
/// single block. The coordinator sees every flushed block go
/// `Leased → Pending → Written`.
///
/// Dropping or cancelling a job never releases its lease; whoever leased the
/// range must `unlease` it on abort.
pub struct PieceWriteJob {
    coordinator: SwarmCoordinator,
    control: Arc<dyn IoControl>,
    intervals: VecDeque<PieceInterval>,
    /// Piece-relative offset of the first buffered byte
    low: u32,
    buffer: BytesMut,
    max_chunk: usize,
    range: ByteRange,
    written: u64,
    cancelled: bool,
}

impl std::fmt::Debug for PieceWriteJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceWriteJob")
            .field("range", &self.range)
            .field("intervals", &self.intervals)
            .field("buffered", &self.buffer.len())
            .field("written", &self.written)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl PieceWriteJob {
    pub(crate) fn new(
        coordinator: SwarmCoordinator,
        intervals: Vec<PieceInterval>,
        max_chunk: usize,
        control: Arc<dyn IoControl>,
    ) -> Result<Self> {
        if intervals.iter().any(|i| i.low > i.high) {
            return Err(SwarmError::InvalidRange("degenerate piece interval".to_string()));
        }
        let range = coordinator.layout().to_range(&intervals).ok_or_else(|| {
            SwarmError::InvalidRange("write job needs contiguous intervals".to_string())
        })?;
        let low = intervals[0].low;

        Ok(Self {
            coordinator,
            control,
            intervals: intervals.into(),
            low,
            buffer: BytesMut::with_capacity(max_chunk.max(1)),
            max_chunk: max_chunk.max(1),
            range,
            written: 0,
            cancelled: false,
        })
    }

    /// The global range this job fills.
    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// Global offset of the next byte the job expects, `None` once done.
    pub fn next_offset(&self) -> Option<u64> {
        let current = self.intervals.front()?;
        let start = current.piece_index as u64 * self.coordinator.layout().piece_length();
        Some(start + self.low as u64 + self.buffer.len() as u64)
    }

    /// Bytes that have reached the backend.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Bytes still to be fed in.
    pub fn remaining(&self) -> u64 {
        self.range.len() - self.written - self.buffer.len() as u64
    }

    pub fn is_done(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Size the chunk being filled will be flushed at.
    fn target_len(&self) -> usize {
        match self.intervals.front() {
            Some(current) => self.max_chunk.min((current.high - self.low) as usize + 1),
            None => 0,
        }
    }

    /// Consumes as much of `content` as the job still needs and returns how
    /// many bytes were taken. Bytes past the end of the job are left in
    /// `content`.
    pub fn write<S: ByteSource + ?Sized>(&mut self, content: &mut S) -> Result<usize> {
        if self.cancelled {
            return Err(SwarmError::Cancelled);
        }

        let mut consumed = 0;
        while content.available() > 0 && !self.intervals.is_empty() {
            let target = self.target_len();
            let want = target - self.buffer.len();
            consumed += content.drain_into(&mut self.buffer, want);

            // Paused only while a flush is outstanding; every read resumes.
            let flushed = if self.buffer.len() == target {
                self.control.pause();
                self.flush()
            } else {
                Ok(())
            };
            self.control.resume();

            if let Err(e) = flushed {
                self.cancelled = true;
                return Err(e);
            }
        }

        Ok(consumed)
    }

    /// Signals end of stream. Fails if the job wasn't filled.
    pub fn finish(&mut self) -> Result<()> {
        if self.cancelled {
            return Err(SwarmError::Cancelled);
        }
        if !self.is_done() {
            return Err(SwarmError::IncompleteWrite {
                expected: self.range.len(),
                written: self.written,
            });
        }
        debug!("Write job for {} finished", self.range);
        Ok(())
    }

    /// Drops buffered bytes and refuses further writes.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            trace!("Cancelled write job for {}", self.range);
        }
        self.cancelled = true;
        self.buffer.clear();
    }

    fn flush(&mut self) -> Result<()> {
        let Some(current) = self.intervals.front().copied() else {
            return Ok(());
        };

        let high = self.low + self.buffer.len() as u32 - 1;
        let block = PieceInterval::new(current.piece_index, self.low, high);
        let range = self.coordinator.layout().interval_to_range(&block);

        self.write_block(&block, range)?;

        trace!("Flushed {}", block);
        self.written += self.buffer.len() as u64;
        self.buffer.clear();

        if high == current.high {
            self.intervals.pop_front();
            if let Some(next) = self.intervals.front() {
                self.low = next.low;
            }
        } else {
            self.low = high + 1;
        }
        Ok(())
    }

    fn write_block(&self, block: &PieceInterval, range: ByteRange) -> Result<()> {
        self.coordinator.pending(range)?;

        if let Err(e) = self.coordinator.backend().write_block(
            block.piece_index,
            block.low,
            block.high,
            &self.buffer,
        ) {
            self.coordinator.unpending(range)?;
            return Err(match e {
                SwarmError::BackendFailure(_) => e,
                other => SwarmError::BackendFailure(other.to_string()),
            });
        }

        self.coordinator.wrote(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::{Bitfield, LeaseState, PieceLayout};
    use crate::storage::MemoryBackend;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingControl {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl IoControl for CountingControl {
        fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(
        piece_length: u64,
        total: u64,
        chunk: usize,
    ) -> (SwarmCoordinator, Arc<MemoryBackend>, Arc<CountingControl>) {
        let layout = PieceLayout::single_file("f", piece_length, total).unwrap();
        let backend = Arc::new(MemoryBackend::new(layout.clone()));
        let coordinator = SwarmCoordinator::builder(layout, backend.clone())
            .chunk_size(chunk)
            .build();
        (coordinator, backend, Arc::new(CountingControl::default()))
    }

    #[test]
    fn test_three_reads_flush_one_chunk() {
        let (c, backend, control) = setup(9, 9, DEFAULT_CHUNK_SIZE);
        let lease = c.lease_available(&Bitfield::full(1)).unwrap();
        let mut job = c.create_write_job(lease, control.clone()).unwrap();

        for part in [&b"ABC"[..], b"DEF", b"GHI"] {
            let mut content = Bytes::copy_from_slice(part);
            assert_eq!(job.write(&mut content).unwrap(), 3);
        }
        job.finish().unwrap();

        let blocks = backend.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].interval, PieceInterval::new(0, 0, 8));
        assert_eq!(blocks[0].data, b"ABCDEFGHI");
        assert_eq!(c.lease_state(&lease), Some(LeaseState::Verified));
        // one flush, but a resume after every read
        assert_eq!(control.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(control.resumes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_partial_reads_resume_without_pausing() {
        let (c, backend, control) = setup(8, 8, 16);
        let lease = c.lease().unwrap();
        let mut job = c.create_write_job(lease, control.clone()).unwrap();

        job.write(&mut Bytes::from_static(b"ab")).unwrap();
        job.write(&mut Bytes::from_static(b"cd")).unwrap();
        assert!(backend.blocks().is_empty());
        assert_eq!(control.pauses.load(Ordering::SeqCst), 0);
        assert_eq!(control.resumes.load(Ordering::SeqCst), 2);

        job.write(&mut Bytes::from_static(b"efgh")).unwrap();
        assert_eq!(control.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(control.resumes.load(Ordering::SeqCst), 3);
        assert_eq!(backend.contents(), b"abcdefgh");
    }

    #[test]
    fn test_chunks_stop_at_piece_boundaries() {
        let (c, backend, control) = setup(10, 30, 4);
        let leased = c.lease().unwrap();
        let lease = c.renew_lease(leased, ByteRange::new(7, 24)).unwrap();
        let mut job = c.create_write_job(lease, control).unwrap();

        let data: Vec<u8> = (7..25).collect();
        let mut content = Bytes::from(data);
        assert_eq!(job.write(&mut content).unwrap(), 18);
        assert!(job.is_done());

        let intervals: Vec<_> = backend.blocks().iter().map(|b| b.interval).collect();
        assert_eq!(
            intervals,
            vec![
                PieceInterval::new(0, 7, 9),
                PieceInterval::new(1, 0, 3),
                PieceInterval::new(1, 4, 7),
                PieceInterval::new(1, 8, 9),
                PieceInterval::new(2, 0, 3),
                PieceInterval::new(2, 4, 4),
            ]
        );
        assert_eq!(&backend.contents()[7..25], &(7..25).collect::<Vec<u8>>()[..]);
        assert_eq!(c.lease_state(&ByteRange::new(10, 19)), Some(LeaseState::Verified));
        assert_eq!(c.lease_state(&ByteRange::new(20, 24)), Some(LeaseState::Written));
    }

    #[test]
    fn test_leftover_bytes_stay_in_source() {
        let (c, _, control) = setup(4, 8, 16);
        let lease = c.lease_available(&Bitfield::full(2)).unwrap();
        let mut job = c.create_write_job(lease, control).unwrap();

        let mut content = Bytes::from_static(b"abcdEXTRA");
        assert_eq!(job.write(&mut content).unwrap(), 4);
        assert_eq!(&content[..], b"EXTRA");
        assert_eq!(job.next_offset(), None);
    }

    #[test]
    fn test_end_of_stream_before_done_is_incomplete() {
        let (c, _, control) = setup(8, 8, 16);
        let lease = c.lease().unwrap();
        let mut job = c.create_write_job(lease, control).unwrap();

        let mut content = Bytes::from_static(b"abc");
        job.write(&mut content).unwrap();
        assert_eq!(job.next_offset(), Some(3));
        assert_eq!(job.remaining(), 5);

        match job.finish() {
            Err(SwarmError::IncompleteWrite { expected, written }) => {
                assert_eq!(expected, 8);
                assert_eq!(written, 0);
            }
            other => panic!("unexpected {:?}", other),
        }

        // the abandoned lease goes back to the pool
        c.unlease(lease);
        assert_eq!(c.lease_state(&lease), Some(LeaseState::Free));
    }

    #[test]
    fn test_backend_failure_leaves_range_leased() {
        let (c, backend, control) = setup(4, 4, 16);
        let lease = c.lease().unwrap();
        let mut job = c.create_write_job(lease, control).unwrap();

        backend.fail_writes(true);
        let mut content = Bytes::from_static(b"abcd");
        assert!(matches!(job.write(&mut content), Err(SwarmError::BackendFailure(_))));
        assert_eq!(c.lease_state(&lease), Some(LeaseState::Leased));
        assert!(matches!(job.write(&mut content), Err(SwarmError::Cancelled)));

        c.unlease(lease);
        assert!(c.is_range_available_for_lease(None));
    }

    #[test]
    fn test_cancel_keeps_the_lease() {
        let (c, _, control) = setup(4, 4, 16);
        let lease = c.lease().unwrap();
        let mut job = c.create_write_job(lease, control).unwrap();
        job.cancel();
        assert_eq!(c.lease_state(&lease), Some(LeaseState::Leased));
        assert!(job.write(&mut Bytes::from_static(b"a")).is_err());
    }
}

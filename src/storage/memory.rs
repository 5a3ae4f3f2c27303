use super::{DiskBackend, PieceHash, Verifier};
use crate::error::{SwarmError, Result};
use crate::piece::{PieceInterval, PieceLayout};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// A block as it was handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBlock {
    pub interval: PieceInterval,
    pub data: Vec<u8>,
}

struct State {
    data: Vec<u8>,
    blocks: Vec<WrittenBlock>,
    fail_writes: bool,
}

/// Keeps the whole download in memory and records every block written.
/// Useful for tests and for inspecting traffic without touching disk.
pub struct MemoryBackend {
    layout: PieceLayout,
    state: Mutex<State>,
    verifier: Verifier,
}

impl MemoryBackend {
    /// A backend that accepts every piece without hashing it.
    pub fn new(layout: PieceLayout) -> Self {
        let num_pieces = layout.num_pieces();
        Self {
            state: Mutex::new(State {
                data: vec![0; layout.total_length() as usize],
                blocks: Vec::new(),
                fail_writes: false,
            }),
            verifier: Verifier {
                hashes: None,
                verified: Mutex::new(vec![false; num_pieces]),
                corrupted: Default::default(),
            },
            layout,
        }
    }

    /// A backend that checks pieces against SHA1 hashes.
    pub fn with_hashes(layout: PieceLayout, hashes: Vec<PieceHash>) -> Result<Self> {
        let verifier = Verifier::new(layout.num_pieces(), Some(hashes))?;
        let mut backend = Self::new(layout);
        backend.verifier = verifier;
        Ok(backend)
    }

    /// Makes every following `write_block` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn blocks(&self) -> Vec<WrittenBlock> {
        self.lock().blocks.clone()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DiskBackend for MemoryBackend {
    fn write_block(&self, piece_index: u32, low: u32, high: u32, data: &[u8]) -> Result<()> {
        let interval = PieceInterval {
            piece_index,
            low,
            high,
        };
        if !self.layout.is_valid(&interval) || interval.len() as usize != data.len() {
            return Err(SwarmError::BackendFailure(format!(
                "block {} does not match {} bytes of data",
                interval,
                data.len()
            )));
        }

        let mut state = self.lock();
        if state.fail_writes {
            return Err(SwarmError::BackendFailure(format!("refusing to write {}", interval)));
        }

        let range = self.layout.interval_to_range(&interval);
        state.data[range.low as usize..=range.high as usize].copy_from_slice(data);
        state.blocks.push(WrittenBlock {
            interval,
            data: data.to_vec(),
        });

        trace!("Stored {} in memory", interval);
        Ok(())
    }

    fn verify_piece(&self, piece_index: u32) -> Result<bool> {
        let range = self.layout.piece_range(piece_index).ok_or_else(|| {
            SwarmError::BackendFailure(format!("piece {} does not exist", piece_index))
        })?;
        let data = self.lock().data[range.low as usize..=range.high as usize].to_vec();
        Ok(self.verifier.check(piece_index, &data))
    }

    fn is_complete(&self) -> bool {
        self.verifier.is_complete()
    }

    fn num_corrupted_bytes(&self) -> u64 {
        self.verifier.corrupted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hash_piece;

    #[test]
    fn test_records_blocks() {
        let layout = PieceLayout::single_file("m", 4, 6).unwrap();
        let backend = MemoryBackend::new(layout);

        backend.write_block(1, 0, 1, b"ef").unwrap();
        backend.write_block(0, 0, 3, b"abcd").unwrap();

        assert_eq!(backend.contents(), b"abcdef");
        assert_eq!(backend.blocks().len(), 2);
        assert_eq!(backend.blocks()[0].interval, PieceInterval::new(1, 0, 1));
        assert!(backend.write_block(1, 0, 2, b"xyz").is_err());
    }

    #[test]
    fn test_hash_checks() {
        let layout = PieceLayout::single_file("m", 4, 8).unwrap();
        let backend =
            MemoryBackend::with_hashes(layout, vec![hash_piece(b"abcd"), hash_piece(b"efgh")])
                .unwrap();

        backend.write_block(0, 0, 3, b"abcd").unwrap();
        backend.write_block(1, 0, 3, b"efgX").unwrap();

        assert!(backend.verify_piece(0).unwrap());
        assert!(!backend.verify_piece(1).unwrap());
        assert_eq!(backend.num_corrupted_bytes(), 4);
        assert!(!backend.is_complete());
    }

    #[test]
    fn test_failing_writes() {
        let layout = PieceLayout::single_file("m", 4, 4).unwrap();
        let backend = MemoryBackend::new(layout);
        backend.fail_writes(true);
        assert!(matches!(
            backend.write_block(0, 0, 3, b"abcd"),
            Err(SwarmError::BackendFailure(_))
        ));
        assert!(backend.blocks().is_empty());
    }
}

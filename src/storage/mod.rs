mod memory;

pub use memory::{MemoryBackend, WrittenBlock};

use crate::error::{SwarmError, Result};
use crate::piece::{ByteRange, PieceInterval, PieceLayout};
use sha1::{Digest, Sha1};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tracing::{debug, info, warn};

/// Where accepted piece data ends up. Implementations decide how bytes are
/// persisted and how pieces are checked.
///
/// Calls may block on the disk. Async callers run them with
/// `tokio::task::spawn_blocking`, the same way `tokio::fs` does.
pub trait DiskBackend: Send + Sync {
    /// Persist `data` as bytes `low..=high` of piece `piece_index`.
    fn write_block(&self, piece_index: u32, low: u32, high: u32, data: &[u8]) -> Result<()>;

    /// Check a fully written piece. `Ok(false)` means the bytes were bad and
    /// have been counted as corrupted.
    fn verify_piece(&self, piece_index: u32) -> Result<bool>;

    /// True once every piece has passed verification.
    fn is_complete(&self) -> bool;

    /// Bytes thrown away because their piece failed verification.
    fn num_corrupted_bytes(&self) -> u64;
}

pub type PieceHash = [u8; 20];

/// SHA1 of a piece, as stored in torrent metadata.
pub fn hash_piece(data: &[u8]) -> PieceHash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Shared piece-checking bookkeeping for the backends.
struct Verifier {
    hashes: Option<Vec<PieceHash>>,
    verified: Mutex<Vec<bool>>,
    corrupted: AtomicU64,
}

impl Verifier {
    fn new(num_pieces: usize, hashes: Option<Vec<PieceHash>>) -> Result<Self> {
        if let Some(hashes) = &hashes {
            if hashes.len() != num_pieces {
                return Err(SwarmError::ConfigError(format!(
                    "{} piece hashes given for {} pieces",
                    hashes.len(),
                    num_pieces
                )));
            }
        }

        Ok(Self {
            hashes,
            verified: Mutex::new(vec![false; num_pieces]),
            corrupted: AtomicU64::new(0),
        })
    }

    fn check(&self, piece_index: u32, data: &[u8]) -> bool {
        let ok = match &self.hashes {
            None => true,
            Some(hashes) => {
                let expected = &hashes[piece_index as usize];
                let actual = hash_piece(data);
                if actual != *expected {
                    warn!(
                        "Piece {} failed verification: expected {}, got {}",
                        piece_index,
                        hex::encode(expected),
                        hex::encode(actual)
                    );
                }
                actual == *expected
            }
        };

        let mut verified = self.verified.lock().unwrap_or_else(PoisonError::into_inner);
        verified[piece_index as usize] = ok;
        if !ok {
            self.corrupted.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        ok
    }

    fn is_complete(&self) -> bool {
        self.verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|&v| v)
    }

    fn corrupted(&self) -> u64 {
        self.corrupted.load(Ordering::Relaxed)
    }
}

/// Writes pieces into the files of a (possibly multi-file) download.
///
/// Directory setup is async; block I/O is blocking and belongs on tokio's
/// blocking pool.
pub struct FileBackend {
    /// Absolute path of every file, same order as the layout
    paths: Vec<PathBuf>,
    layout: PieceLayout,
    verifier: Verifier,
}

impl FileBackend {
    /// Creates the download directory and any parent directories the files
    /// need.
    pub async fn new<P: AsRef<Path>>(
        download_dir: P,
        layout: PieceLayout,
        hashes: Option<Vec<PieceHash>>,
    ) -> Result<Self> {
        let download_dir = download_dir.as_ref().to_path_buf();

        fs::create_dir_all(&download_dir).await?;

        let mut paths = Vec::with_capacity(layout.files().len());
        for file in layout.files() {
            let mut file_path = download_dir.clone();
            for component in &file.path {
                file_path.push(component);
            }

            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).await?;
            }

            paths.push(file_path);
        }

        info!(
            "Storage initialized: {} files, {} bytes total",
            paths.len(),
            layout.total_length()
        );

        let verifier = Verifier::new(layout.num_pieces(), hashes)?;
        Ok(Self {
            paths,
            layout,
            verifier,
        })
    }

    /// Read a whole piece back from disk.
    pub fn read_piece(&self, piece_index: u32) -> Result<Vec<u8>> {
        let range = self.layout.piece_range(piece_index).ok_or_else(|| {
            SwarmError::InvalidRange(format!("piece {} does not exist", piece_index))
        })?;
        self.read_range(&range)
    }

    /// Write data at a global range, spanning files if needed.
    fn write_range(&self, range: &ByteRange, data: &[u8]) -> Result<()> {
        let mut data = data;
        for (index, file_offset, length) in self.layout.file_spans(range) {
            let path = &self.paths[index];
            let mut file = OpenOptions::new().create(true).write(true).open(path)?;
            file.seek(SeekFrom::Start(file_offset))?;
            file.write_all(&data[..length as usize])?;

            debug!(
                "Wrote {} bytes to {:?} at offset {}",
                length, path, file_offset
            );

            data = &data[length as usize..];
        }
        Ok(())
    }

    fn read_range(&self, range: &ByteRange) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(range.len() as usize);
        for (index, file_offset, length) in self.layout.file_spans(range) {
            let mut file = std::fs::File::open(&self.paths[index])?;
            file.seek(SeekFrom::Start(file_offset))?;

            let mut buffer = vec![0u8; length as usize];
            file.read_exact(&mut buffer)?;
            result.extend_from_slice(&buffer);
        }
        Ok(result)
    }
}

impl DiskBackend for FileBackend {
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

        let range = self.layout.interval_to_range(&interval);
        self.write_range(&range, data)
            .map_err(|e| SwarmError::BackendFailure(format!("writing {}: {}", interval, e)))
    }

    fn verify_piece(&self, piece_index: u32) -> Result<bool> {
        let data = self
            .read_piece(piece_index)
            .map_err(|e| SwarmError::BackendFailure(format!("reading piece {}: {}", piece_index, e)))?;
        Ok(self.verifier.check(piece_index, &data))
    }

    fn is_complete(&self) -> bool {
        self.verifier.is_complete()
    }

    fn num_corrupted_bytes(&self) -> u64 {
        self.verifier.corrupted()
    }
}

use super::driver::ReadInterest;
use super::framer::MessageReceiver;
use super::message::{Message, MessageId};
use crate::error::{BadMessage, Result};
use crate::piece::{Bitfield, ByteRange, PieceInterval, PieceWriteJob, SelectionStrategy, SwarmCoordinator};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What one connection has delivered so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages: u64,
    /// Piece data that went into a write job
    pub piece_bytes: u64,
    /// Wanted `PIECE` messages fully received
    pub pieces: u64,
    pub leases_completed: u64,
}

/// Receives peer-wire messages for one connection of a download.
///
/// Tracks what the peer has, holds at most one lease at a time and streams
/// the peer's piece data for that lease into a write job. Data is only
/// welcome when it continues the job exactly where it stands; anything else
/// is left to the framer to discard.
///
/// Whatever lease the session still holds is returned when it is aborted or
/// dropped.
pub struct PieceSession {
    coordinator: SwarmCoordinator,
    interest: ReadInterest,
    available: Bitfield,
    lease: Option<ByteRange>,
    job: Option<PieceWriteJob>,
    stats: SessionStats,
}

impl PieceSession {
    pub fn new(coordinator: SwarmCoordinator, interest: ReadInterest) -> Self {
        let available = Bitfield::new(coordinator.layout().num_pieces());
        Self {
            coordinator,
            interest,
            available,
            lease: None,
            job: None,
            stats: SessionStats::default(),
        }
    }

    pub fn available(&self) -> &Bitfield {
        &self.available
    }

    pub fn lease(&self) -> Option<ByteRange> {
        self.lease
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Leases a portion of what the peer has using `strategy`, unless a
    /// lease is already held.
    pub fn request_lease(&mut self, strategy: &dyn SelectionStrategy) -> Result<Option<ByteRange>> {
        if self.lease.is_some() {
            return Ok(self.lease);
        }
        let Some(range) = self.coordinator.lease_portion(&self.available, strategy) else {
            return Ok(None);
        };
        self.start(range)
    }

    /// `request_lease` with the coordinator's strategy.
    pub fn lease_available(&mut self) -> Result<Option<ByteRange>> {
        if self.lease.is_some() {
            return Ok(self.lease);
        }
        let Some(range) = self.coordinator.lease_available(&self.available) else {
            return Ok(None);
        };
        self.start(range)
    }

    fn start(&mut self, range: ByteRange) -> Result<Option<ByteRange>> {
        let control = Arc::new(self.interest.clone());
        match self.coordinator.create_write_job(range, control) {
            Ok(job) => {
                debug!("Session leased {}", range);
                self.lease = Some(range);
                self.job = Some(job);
                Ok(Some(range))
            }
            Err(e) => {
                self.coordinator.unlease(range);
                Err(e)
            }
        }
    }

    /// Cancels the current job and gives its lease back.
    pub fn abort(&mut self) {
        if let Some(mut job) = self.job.take() {
            job.cancel();
        }
        if let Some(range) = self.lease.take() {
            debug!("Session gave up {}", range);
            self.coordinator.unlease(range);
        }
    }

    fn write(&mut self, data: bytes::Bytes) -> Result<()> {
        let Some(job) = self.job.as_mut() else {
            trace!("Dropping {} bytes with no write job", data.len());
            return Ok(());
        };

        let mut data = data;
        let taken = job.write(&mut data)?;
        self.stats.piece_bytes += taken as u64;
        if !data.is_empty() {
            warn!("{} bytes past the end of {}", data.len(), job.range());
        }

        if job.is_done() {
            job.finish()?;
            self.job = None;
            self.lease = None;
            self.stats.leases_completed += 1;
            self.lease_available()?;
        }
        Ok(())
    }
}

impl MessageReceiver for PieceSession {
    fn is_wanted(&mut self, interval: &PieceInterval) -> bool {
        let (Some(job), Some(lease)) = (&self.job, self.lease) else {
            return false;
        };
        let layout = self.coordinator.layout();
        if !layout.is_valid(interval) {
            return false;
        }

        let range = layout.interval_to_range(interval);
        job.next_offset() == Some(range.low)
            && lease.contains(&range)
            && self.coordinator.is_wanted(&range)
    }

    fn is_ready(&self) -> bool {
        !self.interest.is_paused()
    }

    fn piece_complete(&mut self, interval: &PieceInterval) {
        trace!("Received {}", interval);
        self.stats.pieces += 1;
    }

    fn receive(&mut self, message: Message) -> Result<()> {
        self.stats.messages += 1;

        let result = match message {
            Message::Bitfield(bits) => {
                let num_pieces = self.coordinator.layout().num_pieces();
                let expected = num_pieces.div_ceil(8);
                if bits.len() != expected {
                    Err(BadMessage::InvalidBitfieldLength {
                        expected,
                        actual: bits.len(),
                    }
                    .into())
                } else {
                    self.available = Bitfield::from_bytes(&bits, num_pieces);
                    debug!("Peer has {} pieces", self.available.count());
                    self.lease_available().map(|_| ())
                }
            }
            Message::Piece(_, data) => self.write(data),
            other => match other.as_have() {
                Some(index) if index as usize >= self.available.piece_count() => {
                    warn!("HAVE for piece {} of {}", index, self.available.piece_count());
                    Err(BadMessage::InvalidPieceIndex(index).into())
                }
                Some(index) => {
                    self.available.set_piece(index as usize);
                    self.lease_available().map(|_| ())
                }
                None => {
                    if other.id() == MessageId::Have {
                        warn!("Malformed HAVE ignored");
                    }
                    trace!("Ignoring {:?}", other.id());
                    Ok(())
                }
            },
        };

        if result.is_err() {
            self.abort();
        }
        result
    }
}

impl Drop for PieceSession {
    fn drop(&mut self) {
        self.abort();
    }
}

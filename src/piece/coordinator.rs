use super::{
    Bitfield, ByteRange, IntervalSet, IoControl, LeaseState, PieceLayout, PieceWriteJob,
    SelectionStrategy, Sequential, DEFAULT_CHUNK_SIZE,
};
use crate::error::{SwarmError, Result};
use crate::storage::DiskBackend;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Every byte of the download is in exactly one of these sets.
#[derive(Debug, Default)]
struct LeaseTable {
    free: IntervalSet,
    leased: IntervalSet,
    pending: IntervalSet,
    written: IntervalSet,
    /// Written pieces currently being hash checked
    verifying: IntervalSet,
    verified: IntervalSet,
}

struct Inner {
    layout: PieceLayout,
    backend: Arc<dyn DiskBackend>,
    strategy: Box<dyn SelectionStrategy>,
    lease_size: u64,
    chunk_size: usize,
    table: Mutex<LeaseTable>,
    completed: watch::Sender<bool>,
}

/// Configures a [`SwarmCoordinator`] before it is shared.
pub struct CoordinatorBuilder {
    layout: PieceLayout,
    backend: Arc<dyn DiskBackend>,
    strategy: Box<dyn SelectionStrategy>,
    lease_size: Option<u64>,
    chunk_size: usize,
    verified: Option<Bitfield>,
}

impl CoordinatorBuilder {
    pub fn strategy(mut self, strategy: Box<dyn SelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Upper bound for `lease_portion`. Defaults to one piece.
    pub fn lease_size(mut self, lease_size: u64) -> Self {
        self.lease_size = Some(lease_size.max(1));
        self
    }

    /// Largest block a write job hands to the backend at once.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Pieces already on disk and checked, e.g. when resuming.
    pub fn verified(mut self, pieces: Bitfield) -> Self {
        self.verified = Some(pieces);
        self
    }

    pub fn build(self) -> SwarmCoordinator {
        let mut table = LeaseTable {
            free: IntervalSet::singleton(self.layout.full_range()),
            ..Default::default()
        };

        if let Some(pieces) = &self.verified {
            let done = self.layout.available_ranges(pieces);
            table.free.delete_all(&done);
            table.verified = done;
        }

        let complete = table.free.is_empty();
        let (completed, _) = watch::channel(complete);

        SwarmCoordinator {
            inner: Arc::new(Inner {
                lease_size: self.lease_size.unwrap_or(self.layout.piece_length()),
                layout: self.layout,
                backend: self.backend,
                strategy: self.strategy,
                chunk_size: self.chunk_size,
                table: Mutex::new(table),
                completed,
            }),
        }
    }
}

/// The single authority over which bytes of a download are free, leased to a
/// source, being written, or done. Cloning is cheap and every clone shares
/// the same lease table.
#[derive(Clone)]
pub struct SwarmCoordinator {
    inner: Arc<Inner>,
}

impl SwarmCoordinator {
    pub fn builder(layout: PieceLayout, backend: Arc<dyn DiskBackend>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            layout,
            backend,
            strategy: Box::new(Sequential),
            lease_size: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verified: None,
        }
    }

    pub fn new(layout: PieceLayout, backend: Arc<dyn DiskBackend>) -> Self {
        Self::builder(layout, backend).build()
    }

    pub fn layout(&self) -> &PieceLayout {
        &self.inner.layout
    }

    pub fn backend(&self) -> &Arc<dyn DiskBackend> {
        &self.inner.backend
    }

    fn lock(&self) -> MutexGuard<'_, LeaseTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leases the largest stretch the default strategy offers, unbounded by
    /// the lease size.
    pub fn lease(&self) -> Option<ByteRange> {
        let block = self.inner.layout.total_length();
        self.select(None, self.inner.strategy.as_ref(), block)
    }

    /// Leases at most one lease-size block of bytes the source has.
    pub fn lease_portion(
        &self,
        available: &Bitfield,
        strategy: &dyn SelectionStrategy,
    ) -> Option<ByteRange> {
        let ranges = self.inner.layout.available_ranges(available);
        self.select(Some(&ranges), strategy, self.inner.lease_size)
    }

    /// `lease_portion` with the coordinator's own strategy.
    pub fn lease_available(&self, available: &Bitfield) -> Option<ByteRange> {
        self.lease_portion(available, self.inner.strategy.as_ref())
    }

    fn select(
        &self,
        available: Option<&IntervalSet>,
        strategy: &dyn SelectionStrategy,
        block_size: u64,
    ) -> Option<ByteRange> {
        let mut table = self.lock();
        let candidates = match available {
            Some(ranges) => table.free.intersect(ranges),
            None => table.free.clone(),
        };

        let picked = strategy.select_next(&candidates, block_size)?;
        if !candidates.contains(&picked) {
            warn!("Strategy picked {} outside of {:?}", picked, candidates);
            return None;
        }

        table.free.delete(picked);
        table.leased.add(picked);
        debug!("Leased {}", picked);
        Some(picked)
    }

    /// Shrinks a held lease to `new`, freeing the rest. Growing a lease or
    /// renewing one that isn't held is a conflict.
    pub fn renew_lease(&self, old: ByteRange, new: ByteRange) -> Result<ByteRange> {
        if !old.contains(&new) {
            return Err(SwarmError::LeaseConflict(format!(
                "cannot renew {} as {}: leases only shrink",
                old, new
            )));
        }

        let mut table = self.lock();
        if !table.leased.contains(&old) {
            return Err(SwarmError::LeaseConflict(format!("{} is not leased", old)));
        }

        table.leased.delete(old);
        table.leased.add(new);
        if new.low > old.low {
            table.free.add(ByteRange::new(old.low, new.low - 1));
        }
        if new.high < old.high {
            table.free.add(ByteRange::new(new.high + 1, old.high));
        }

        debug!("Renewed lease {} as {}", old, new);
        Ok(new)
    }

    /// Returns whatever part of `range` is still leased to the free pool.
    /// Parts that were written, or never leased, are left alone.
    pub fn unlease(&self, range: ByteRange) {
        let mut table = self.lock();
        let held = table.leased.intersect_range(&range);
        if held.is_empty() {
            trace!("Unlease of {} released nothing", range);
            return;
        }

        table.leased.delete_all(&held);
        table.free.add_all(&held);
        debug!("Unleased {:?}", held);
    }

    /// Marks leased bytes as having a flush outstanding.
    pub fn pending(&self, range: ByteRange) -> Result<()> {
        let mut table = self.lock();
        if !table.leased.contains(&range) {
            return Err(SwarmError::LeaseConflict(format!(
                "{} must be leased to become pending",
                range
            )));
        }
        table.leased.delete(range);
        table.pending.add(range);
        Ok(())
    }

    /// Undoes `pending` after a failed flush; the bytes are leased again.
    pub fn unpending(&self, range: ByteRange) -> Result<()> {
        let mut table = self.lock();
        if !table.pending.contains(&range) {
            return Err(SwarmError::LeaseConflict(format!("{} is not pending", range)));
        }
        table.pending.delete(range);
        table.leased.add(range);
        Ok(())
    }

    /// Records that pending bytes reached the backend, then verifies every
    /// piece that is now fully written.
    pub fn wrote(&self, range: ByteRange) -> Result<()> {
        let candidates = {
            let mut table = self.lock();
            if !table.pending.contains(&range) {
                return Err(SwarmError::LeaseConflict(format!("{} is not pending", range)));
            }
            table.pending.delete(range);
            table.written.add(range);

            let pieces: Vec<u32> = self.inner.layout.pieces_touching(&range).collect();
            self.take_verifiable(&mut table, pieces)
        };

        self.verify_pieces(candidates);
        Ok(())
    }

    /// Moves fully written pieces into `verifying` so only one caller checks
    /// each of them.
    fn take_verifiable(
        &self,
        table: &mut LeaseTable,
        pieces: impl IntoIterator<Item = u32>,
    ) -> Vec<(u32, ByteRange)> {
        let mut out = Vec::new();
        for index in pieces {
            let Some(range) = self.inner.layout.piece_range(index) else {
                continue;
            };
            if table.written.contains(&range) {
                table.written.delete(range);
                table.verifying.add(range);
                out.push((index, range));
            }
        }
        out
    }

    fn verify_pieces(&self, pieces: Vec<(u32, ByteRange)>) {
        if pieces.is_empty() {
            return;
        }

        // Hashing happens outside the lock.
        let results: Vec<_> = pieces
            .into_iter()
            .map(|(index, range)| (index, range, self.inner.backend.verify_piece(index)))
            .collect();

        let mut table = self.lock();
        for (index, range, result) in results {
            table.verifying.delete(range);
            match result {
                Ok(true) => {
                    table.verified.add(range);
                    info!("Piece {} verified", index);
                }
                Ok(false) => {
                    table.free.add(range);
                    warn!("Piece {} failed verification, {} bytes lost", index, range.len());
                }
                Err(e) => {
                    table.free.add(range);
                    warn!("Could not verify piece {}: {}", index, e);
                }
            }
        }

        if table.verified.byte_count() == self.inner.layout.total_length() {
            info!("Download complete");
            self.inner.completed.send_replace(true);
        }
    }

    /// Checks every fully written piece that hasn't been checked yet.
    pub fn verify(&self) {
        let candidates = {
            let mut table = self.lock();
            let pieces = 0..self.inner.layout.num_pieces() as u32;
            self.take_verifiable(&mut table, pieces)
        };
        self.verify_pieces(candidates);
    }

    /// Forgets all verification results and checks everything written again.
    pub fn reverify(&self) {
        {
            let mut table = self.lock();
            let verified = std::mem::take(&mut table.verified);
            table.written.add_all(&verified);
        }
        self.inner.completed.send_replace(false);
        self.verify();
    }

    /// Builds a job that streams bytes of a held lease into the backend.
    pub fn create_write_job(
        &self,
        range: ByteRange,
        control: Arc<dyn IoControl>,
    ) -> Result<PieceWriteJob> {
        if !self.lock().leased.contains(&range) {
            return Err(SwarmError::LeaseConflict(format!(
                "{} must be leased before writing",
                range
            )));
        }

        let intervals = self.inner.layout.to_intervals(&range)?;
        PieceWriteJob::new(self.clone(), intervals, self.inner.chunk_size, control)
    }

    /// The welcome check: true while every byte of `range` is leased.
    pub fn is_wanted(&self, range: &ByteRange) -> bool {
        self.lock().leased.contains(range)
    }

    /// The state of `range`, if all of it is in the same state.
    pub fn lease_state(&self, range: &ByteRange) -> Option<LeaseState> {
        let table = self.lock();
        if table.free.contains(range) {
            Some(LeaseState::Free)
        } else if table.leased.contains(range) {
            Some(LeaseState::Leased)
        } else if table.pending.contains(range) {
            Some(LeaseState::Pending)
        } else if table.written.contains(range) || table.verifying.contains(range) {
            Some(LeaseState::Written)
        } else if table.verified.contains(range) {
            Some(LeaseState::Verified)
        } else {
            None
        }
    }

    /// True if something inside `available` (or anywhere, for `None`) could
    /// be leased right now.
    pub fn is_range_available_for_lease(&self, available: Option<&IntervalSet>) -> bool {
        let table = self.lock();
        match available {
            Some(ranges) => !table.free.intersect(ranges).is_empty(),
            None => !table.free.is_empty(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.lock().verified.byte_count() == self.inner.layout.total_length()
    }

    /// Resolves to `true` once every piece is verified.
    pub fn subscribe_completion(&self) -> watch::Receiver<bool> {
        self.inner.completed.subscribe()
    }

    pub fn amount_verified(&self) -> u64 {
        self.lock().verified.byte_count()
    }

    /// Bytes on disk that are not verified yet.
    pub fn amount_written(&self) -> u64 {
        let table = self.lock();
        table.written.byte_count() + table.verifying.byte_count()
    }

    pub fn amount_leased(&self) -> u64 {
        let table = self.lock();
        table.leased.byte_count() + table.pending.byte_count()
    }

    /// Bytes discarded because their piece failed verification.
    pub fn amount_lost(&self) -> u64 {
        self.inner.backend.num_corrupted_bytes()
    }
}

use super::framer::{MessageFramer, MessageReceiver};
use super::source::ByteSource;
use crate::error::{Result, SwarmError};
use crate::piece::IoControl;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Smallest receive buffer that always fits a length prefix plus a piece
/// header.
pub const MIN_RECEIVE_BUFFER: usize = 16;

/// Shared read-interest switch for one connection.
///
/// Write jobs pause it for the length of each disk flush and resume it
/// after every read they take in. While it is paused the framer holds piece
/// data back and `run` stops reading. Flushes run under the driver's lock,
/// so with a synchronous backend the pause is over before `run` looks again.
#[derive(Debug, Clone, Default)]
pub struct ReadInterest {
    paused: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ReadInterest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Resolves after the next `resume`, or right away if one already
    /// happened since the last wait.
    pub async fn resumed(&self) {
        self.notify.notified().await
    }
}

impl IoControl for ReadInterest {
    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_one();
    }
}

struct DriverState<R> {
    framer: MessageFramer,
    /// Received bytes the framer hasn't taken yet
    buffer: BytesMut,
    capacity: usize,
    receiver: R,
    closed: bool,
}

impl<R: MessageReceiver> DriverState<R> {
    fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// Runs the framer until it wants more bytes, delivering every message.
    fn pump(&mut self) -> Result<()> {
        if self.closed {
            return Err(SwarmError::Shutdown);
        }

        loop {
            let next = self.framer.advance(&mut self.buffer, &mut self.receiver);
            let result = match next {
                Ok(Some(message)) => self.receiver.receive(message),
                Ok(None) => return Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                self.close();
                return Err(e);
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.framer.shutdown();
        self.buffer.clear();
    }
}

/// Owns the receive buffer of one connection and pushes it through a
/// [`MessageFramer`].
///
/// The buffer never grows past its capacity. When it is full the driver is
/// choked and stops reading from the network until the receiver is ready
/// again and the buffer has been drained. Every entry point takes the same
/// lock, so a read callback and a drain never parse at the same time.
pub struct FramerDriver<R> {
    state: Arc<Mutex<DriverState<R>>>,
    interest: ReadInterest,
}

impl<R> Clone for FramerDriver<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            interest: self.interest.clone(),
        }
    }
}

impl<R: MessageReceiver> FramerDriver<R> {
    /// Fails for buffers below [`MIN_RECEIVE_BUFFER`], which could fill up
    /// without ever holding a whole piece header.
    pub fn new(framer: MessageFramer, receiver: R, capacity: usize, interest: ReadInterest) -> Result<Self> {
        if capacity < MIN_RECEIVE_BUFFER {
            return Err(SwarmError::ConfigError(format!(
                "receive buffer of {} bytes is below the minimum of {}",
                capacity, MIN_RECEIVE_BUFFER
            )));
        }

        Ok(Self {
            state: Arc::new(Mutex::new(DriverState {
                framer,
                buffer: BytesMut::with_capacity(capacity),
                capacity,
                receiver,
                closed: false,
            })),
            interest,
        })
    }

    fn lock(&self) -> MutexGuard<'_, DriverState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interest(&self) -> &ReadInterest {
        &self.interest
    }

    /// Takes as much of `data` as fits in the buffer, then parses. Returns
    /// how many bytes were taken; the rest stay in `data`.
    pub fn on_readable<S: ByteSource + ?Sized>(&self, data: &mut S) -> Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(SwarmError::Shutdown);
        }

        let room = state.free_space();
        let taken = data.drain_into(&mut state.buffer, room);
        trace!("Took {} bytes, {} buffered", taken, state.buffer.len());

        state.pump()?;
        Ok(taken)
    }

    /// Parses whatever is still buffered, e.g. after the receiver became
    /// ready again.
    pub fn drain(&self) -> Result<()> {
        self.lock().pump()
    }

    /// True while the buffer is full.
    pub fn is_choked(&self) -> bool {
        self.lock().free_space() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.lock().framer.bytes_consumed()
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.closed {
            debug!("Driver shut down with {} bytes unparsed", state.buffer.len());
        }
        state.close();
    }

    pub fn with_receiver<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(&mut self.lock().receiver)
    }
}

impl<R: MessageReceiver + Send + 'static> FramerDriver<R> {
    /// Runs parse work on the blocking pool; receivers may write to disk.
    async fn offload<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T> + Send + 'static,
    {
        let driver = self.clone();
        tokio::task::spawn_blocking(move || f(&driver))
            .await
            .map_err(|e| SwarmError::BackendFailure(format!("parse task failed: {}", e)))?
    }

    /// Reads `stream` until end of stream or a fatal error.
    pub async fn run<S: AsyncRead + Unpin>(&self, stream: &mut S) -> Result<()> {
        let capacity = self.lock().capacity;
        let mut scratch = vec![0u8; capacity];

        loop {
            if self.interest.is_paused() {
                trace!("Reads paused, waiting for the receiver");
                self.interest.resumed().await;
                self.offload(|d| d.drain()).await?;
                continue;
            }

            if self.is_choked() {
                self.offload(|d| d.drain()).await?;
                if self.is_choked() {
                    if self.with_receiver(|r| r.is_ready()) {
                        self.shutdown();
                        return Err(SwarmError::ConfigError(format!(
                            "receive buffer of {} bytes is full and the framer cannot move",
                            capacity
                        )));
                    }
                    trace!("Buffer full, waiting for the receiver");
                    self.interest.resumed().await;
                    continue;
                }
            }

            let room = self.lock().free_space();
            let n = match stream.read(&mut scratch[..room]).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Read failed: {}", e);
                    self.shutdown();
                    return Err(e.into());
                }
            };

            if n == 0 {
                self.offload(|d| d.drain()).await?;
                debug!("End of stream after {} bytes", self.bytes_consumed());
                self.shutdown();
                return Ok(());
            }

            let chunk = Bytes::copy_from_slice(&scratch[..n]);
            self.offload(move |d| {
                let mut chunk = chunk;
                d.on_readable(&mut chunk)
            })
            .await?;
        }
    }
}

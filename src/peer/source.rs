use bytes::{Buf, Bytes, BytesMut};

/// Read access to a bounded, contiguous receive buffer.
///
/// Implemented for every contiguous `Buf` (`BytesMut`, `Bytes`, `&[u8]`), so
/// the framer and write jobs work the same on a connection's ring buffer, on
/// a slice handed over by the framer, or on an HTTP body chunk.
pub trait ByteSource {
    /// Bytes that can be read right now.
    fn available(&self) -> usize;

    /// The next big-endian u32 without consuming it.
    fn peek_u32(&self) -> Option<u32>;

    fn read_u32(&mut self) -> Option<u32>;

    fn read_u8(&mut self) -> Option<u8>;

    /// Takes up to `n` bytes.
    fn read_bytes(&mut self, n: usize) -> Bytes;

    /// Drops up to `n` bytes without copying them. Returns how many went.
    fn discard(&mut self, n: usize) -> usize;

    /// Appends up to `limit` bytes to `sink`. Returns how many moved.
    fn drain_into(&mut self, sink: &mut BytesMut, limit: usize) -> usize;
}

impl<B: Buf + AsRef<[u8]>> ByteSource for B {
    fn available(&self) -> usize {
        self.remaining()
    }

    fn peek_u32(&self) -> Option<u32> {
        let head = self.as_ref().get(..4)?;
        Some(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn read_u32(&mut self) -> Option<u32> {
        (self.remaining() >= 4).then(|| self.get_u32())
    }

    fn read_u8(&mut self) -> Option<u8> {
        (self.remaining() >= 1).then(|| self.get_u8())
    }

    fn read_bytes(&mut self, n: usize) -> Bytes {
        let n = n.min(self.remaining());
        self.copy_to_bytes(n)
    }

    fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.remaining());
        self.advance(n);
        n
    }

    fn drain_into(&mut self, sink: &mut BytesMut, limit: usize) -> usize {
        let n = limit.min(self.remaining());
        sink.extend_from_slice(&self.as_ref()[..n]);
        self.advance(n);
        n
    }
}

use bytes::Bytes;

/// Which pieces a peer has, one bit per piece, high bit of the first byte
/// first. This is the exact layout of a `BITFIELD` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Every piece available, e.g. for a web seed.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Builds a bitfield from a wire payload. Short payloads are zero padded
    /// and bits past `piece_count` are ignored.
    pub fn from_bytes(bytes: &Bytes, piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);

        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    pub fn set_piece(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    pub fn clear_piece(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] &= !(1 << bit_index);
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Indices of the pieces that are set, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has_piece(i))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFF << spare;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_order() {
        let bf = Bitfield::from_bytes(&Bytes::from_static(&[0b1000_0001, 0b0100_0000]), 10);
        assert!(bf.has_piece(0));
        assert!(bf.has_piece(7));
        assert!(bf.has_piece(9));
        assert!(!bf.has_piece(8));
        assert_eq!(bf.count(), 3);
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![0, 7, 9]);
    }

    #[test]
    fn test_spare_bits_are_cleared() {
        let bf = Bitfield::from_bytes(&Bytes::from_static(&[0xFF, 0xFF]), 10);
        assert_eq!(bf.count(), 10);
        assert!(bf.is_complete());
        assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);

        let full = Bitfield::full(10);
        assert_eq!(full, bf);
    }

    #[test]
    fn test_set_and_clear() {
        let mut bf = Bitfield::new(12);
        bf.set_piece(3);
        bf.set_piece(11);
        bf.set_piece(12);
        assert_eq!(bf.count(), 2);
        bf.clear_piece(3);
        assert!(!bf.has_piece(3));
        assert!(bf.has_piece(11));
    }

    #[test]
    fn test_short_payload_is_padded() {
        let bf = Bitfield::from_bytes(&Bytes::from_static(&[0xFF]), 20);
        assert_eq!(bf.as_bytes().len(), 3);
        assert_eq!(bf.count(), 8);
    }
}

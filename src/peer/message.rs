use crate::piece::PieceInterval;
use bytes::{BufMut, Bytes, BytesMut};

/// Peer-wire message type IDs, as assigned by BEP 3 and its extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
    Port,
    Extended,
    Other(u8),
}

impl MessageId {
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;
    const PORT: u8 = 9;
    const EXTENDED: u8 = 20;

    pub fn as_u8(self) -> u8 {
        match self {
            MessageId::Choke => Self::CHOKE,
            MessageId::Unchoke => Self::UNCHOKE,
            MessageId::Interested => Self::INTERESTED,
            MessageId::NotInterested => Self::NOT_INTERESTED,
            MessageId::Have => Self::HAVE,
            MessageId::Bitfield => Self::BITFIELD,
            MessageId::Request => Self::REQUEST,
            MessageId::Piece => Self::PIECE,
            MessageId::Cancel => Self::CANCEL,
            MessageId::Port => Self::PORT,
            MessageId::Extended => Self::EXTENDED,
            MessageId::Other(id) => id,
        }
    }
}

impl From<u8> for MessageId {
    fn from(id: u8) -> Self {
        match id {
            Self::CHOKE => MessageId::Choke,
            Self::UNCHOKE => MessageId::Unchoke,
            Self::INTERESTED => MessageId::Interested,
            Self::NOT_INTERESTED => MessageId::NotInterested,
            Self::HAVE => MessageId::Have,
            Self::BITFIELD => MessageId::Bitfield,
            Self::REQUEST => MessageId::Request,
            Self::PIECE => MessageId::Piece,
            Self::CANCEL => MessageId::Cancel,
            Self::PORT => MessageId::Port,
            Self::EXTENDED => MessageId::Extended,
            other => MessageId::Other(other),
        }
    }
}

/// A parsed peer-wire message.
///
/// `Piece` carries the piece-relative interval its bytes cover. A large
/// `PIECE` frame reaches the consumer as several consecutive `Piece` slices
/// whose intervals line up end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Raw bit-packed availability
    Bitfield(Bytes),
    Piece(PieceInterval, Bytes),
    /// Any other type, payload untouched
    Generic(MessageId, Bytes),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Piece(..) => MessageId::Piece,
            Message::Generic(id, _) => *id,
        }
    }

    pub fn have(piece_index: u32) -> Self {
        Message::Generic(MessageId::Have, Bytes::copy_from_slice(&piece_index.to_be_bytes()))
    }

    /// The piece index of a well-formed `HAVE`.
    pub fn as_have(&self) -> Option<u32> {
        match self {
            Message::Generic(MessageId::Have, payload) if payload.len() == 4 => {
                Some(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
            }
            _ => None,
        }
    }

    /// Length of the payload following the length prefix, type byte
    /// included.
    pub fn wire_length(&self) -> usize {
        match self {
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Piece(_, data) => 9 + data.len(),
            Message::Generic(_, payload) => 1 + payload.len(),
        }
    }

    /// Serialize message to bytes
    /// Format: <length prefix><message ID><payload>
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(4 + self.wire_length());
        buf.put_u32(self.wire_length() as u32);
        buf.put_u8(self.id().as_u8());

        match self {
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Piece(interval, data) => {
                buf.put_u32(interval.piece_index);
                buf.put_u32(interval.low);
                buf.put_slice(data);
            }
            Message::Generic(_, payload) => buf.put_slice(payload),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }
}

/// A keep-alive frame: a zero length prefix and nothing else.
pub const KEEP_ALIVE: [u8; 4] = [0, 0, 0, 0];

use super::message::{Message, MessageId};
use super::source::ByteSource;
use crate::error::{BadMessage, Result, SwarmError};
use crate::piece::{PieceInterval, PieceLayout};
use bytes::BytesMut;
use std::mem;
use tracing::{debug, trace, warn};

/// Largest length prefix accepted: a 32 KiB block plus the piece header.
pub const MAX_MESSAGE_LENGTH: u32 = 32 * 1024 + 9;

/// Bytes in a `PIECE` payload before the data: index and offset.
const PIECE_HEADER_LEN: usize = 8;

/// The consumer side of a [`MessageFramer`].
pub trait MessageReceiver {
    /// Asked once per incoming `PIECE`, before any of its data is read.
    /// Data for an unwanted interval is dropped.
    fn is_wanted(&mut self, interval: &PieceInterval) -> bool;

    /// While false the framer holds back wanted piece data.
    fn is_ready(&self) -> bool {
        true
    }

    /// Called once all data of a wanted `PIECE` has been handed out.
    fn piece_complete(&mut self, _interval: &PieceInterval) {}

    fn receive(&mut self, message: Message) -> Result<()>;
}

/// Progress through the data of one `PIECE` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRead {
    /// Everything the message carries
    pub interval: PieceInterval,
    /// Piece-relative offset of the next data byte
    pub next: u32,
    pub remaining: u32,
    pub accepted: bool,
}

#[derive(Debug)]
pub enum ParserState {
    AwaitingLength,
    AwaitingType,
    ReadingBitfield(BytesMut),
    ReadingPieceHeader,
    ReadingPiece(PieceRead),
    ReadingGenericPayload { id: MessageId, payload: BytesMut },
    /// Absorbing; entered on shutdown or the first framing error.
    Shutdown,
}

/// State shared by every parser state.
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Payload bytes of the current message after its type byte
    pub length: u32,
    /// Anything at all, keep-alives included, arrived
    pub data_observed: bool,
    /// Typed messages seen so far
    pub messages_observed: u64,
    pub bytes_consumed: u64,
    /// Piece data dropped by the welcome check
    pub bytes_discarded: u64,
    pub max_length: u32,
    layout: Option<PieceLayout>,
}

enum Step {
    /// Not enough bytes; park in this state.
    NeedMore(ParserState),
    Continue(ParserState),
    Emit(ParserState, Message),
}

/// Incremental peer-wire parser.
///
/// Bytes can arrive split at any point; the framer keeps just enough state to
/// pick up where it left off. Bitfields and other small payloads are
/// collected whole, while the data of a wanted `PIECE` is handed out slice by
/// slice as it arrives, each slice a `Message::Piece` covering its own part of
/// the piece.
///
/// A framing error puts the framer in the `Shutdown` state for good.
#[derive(Debug)]
pub struct MessageFramer {
    state: ParserState,
    ctx: ParseContext,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self {
            state: ParserState::AwaitingLength,
            ctx: ParseContext {
                length: 0,
                data_observed: false,
                messages_observed: 0,
                bytes_consumed: 0,
                bytes_discarded: 0,
                max_length: MAX_MESSAGE_LENGTH,
                layout: None,
            },
        }
    }

    /// Checks piece headers against `layout` and rejects out of range ones.
    pub fn with_layout(mut self, layout: PieceLayout) -> Self {
        self.ctx.layout = Some(layout);
        self
    }

    /// Lowers the largest accepted length prefix.
    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.ctx.max_length = max_length.min(MAX_MESSAGE_LENGTH);
        self
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn context(&self) -> &ParseContext {
        &self.ctx
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.ctx.bytes_consumed
    }

    pub fn bytes_discarded(&self) -> u64 {
        self.ctx.bytes_discarded
    }

    pub fn data_observed(&self) -> bool {
        self.ctx.data_observed
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(self.state, ParserState::Shutdown)
    }

    pub fn shutdown(&mut self) {
        if !self.is_shut_down() {
            debug!("Framer shut down after {} bytes", self.ctx.bytes_consumed);
        }
        self.state = ParserState::Shutdown;
    }

    /// Parses as far as `src` allows. Returns the next message, or `None`
    /// when more bytes are needed (or the receiver isn't ready for piece
    /// data).
    pub fn advance<S, R>(&mut self, src: &mut S, receiver: &mut R) -> Result<Option<Message>>
    where
        S: ByteSource + ?Sized,
        R: MessageReceiver + ?Sized,
    {
        loop {
            let step = match mem::replace(&mut self.state, ParserState::Shutdown) {
                ParserState::Shutdown => return Err(SwarmError::Shutdown),
                ParserState::AwaitingLength => awaiting_length(&mut self.ctx, src),
                ParserState::AwaitingType => awaiting_type(&mut self.ctx, src),
                ParserState::ReadingBitfield(bits) => reading_bitfield(&mut self.ctx, src, bits),
                ParserState::ReadingPieceHeader => {
                    reading_piece_header(&mut self.ctx, src, receiver)
                }
                ParserState::ReadingPiece(read) => reading_piece(&mut self.ctx, src, receiver, read),
                ParserState::ReadingGenericPayload { id, payload } => {
                    reading_generic(&mut self.ctx, src, id, payload)
                }
            };

            // On error the state stays Shutdown.
            let step = step.map_err(|e| {
                warn!("Framing error after {} bytes: {}", self.ctx.bytes_consumed, e);
                e
            })?;

            match step {
                Step::NeedMore(state) => {
                    self.state = state;
                    return Ok(None);
                }
                Step::Continue(state) => self.state = state,
                Step::Emit(state, message) => {
                    self.state = state;
                    return Ok(Some(message));
                }
            }
        }
    }
}

fn awaiting_length<S: ByteSource + ?Sized>(ctx: &mut ParseContext, src: &mut S) -> Result<Step> {
    let Some(length) = src.peek_u32() else {
        return Ok(Step::NeedMore(ParserState::AwaitingLength));
    };
    if length > ctx.max_length {
        return Err(BadMessage::Oversized(length).into());
    }

    src.discard(4);
    ctx.bytes_consumed += 4;
    ctx.data_observed = true;

    if length == 0 {
        trace!("Keep-alive");
        return Ok(Step::Continue(ParserState::AwaitingLength));
    }

    ctx.length = length - 1;
    Ok(Step::Continue(ParserState::AwaitingType))
}

fn awaiting_type<S: ByteSource + ?Sized>(ctx: &mut ParseContext, src: &mut S) -> Result<Step> {
    let Some(id) = src.read_u8() else {
        return Ok(Step::NeedMore(ParserState::AwaitingType));
    };
    ctx.bytes_consumed += 1;

    let id = MessageId::from(id);
    if id == MessageId::Bitfield && ctx.messages_observed > 0 {
        return Err(BadMessage::BitfieldNotFirst.into());
    }
    ctx.messages_observed += 1;

    let next = match id {
        MessageId::Bitfield => ParserState::ReadingBitfield(BytesMut::with_capacity(ctx.length as usize)),
        MessageId::Piece => {
            if (ctx.length as usize) < PIECE_HEADER_LEN {
                return Err(BadMessage::PieceTooShort(ctx.length + 1).into());
            }
            ParserState::ReadingPieceHeader
        }
        id => ParserState::ReadingGenericPayload {
            id,
            payload: BytesMut::with_capacity(ctx.length as usize),
        },
    };
    Ok(Step::Continue(next))
}

fn reading_bitfield<S: ByteSource + ?Sized>(
    ctx: &mut ParseContext,
    src: &mut S,
    mut bits: BytesMut,
) -> Result<Step> {
    let wanted = ctx.length as usize - bits.len();
    ctx.bytes_consumed += src.drain_into(&mut bits, wanted) as u64;

    if bits.len() < ctx.length as usize {
        return Ok(Step::NeedMore(ParserState::ReadingBitfield(bits)));
    }
    trace!("Bitfield of {} bytes", bits.len());
    Ok(Step::Emit(ParserState::AwaitingLength, Message::Bitfield(bits.freeze())))
}

fn reading_generic<S: ByteSource + ?Sized>(
    ctx: &mut ParseContext,
    src: &mut S,
    id: MessageId,
    mut payload: BytesMut,
) -> Result<Step> {
    let wanted = ctx.length as usize - payload.len();
    ctx.bytes_consumed += src.drain_into(&mut payload, wanted) as u64;

    if payload.len() < ctx.length as usize {
        return Ok(Step::NeedMore(ParserState::ReadingGenericPayload { id, payload }));
    }
    Ok(Step::Emit(ParserState::AwaitingLength, Message::Generic(id, payload.freeze())))
}

fn reading_piece_header<S, R>(ctx: &mut ParseContext, src: &mut S, receiver: &mut R) -> Result<Step>
where
    S: ByteSource + ?Sized,
    R: MessageReceiver + ?Sized,
{
    if src.available() < PIECE_HEADER_LEN {
        return Ok(Step::NeedMore(ParserState::ReadingPieceHeader));
    }

    let (Some(index), Some(offset)) = (src.read_u32(), src.read_u32()) else {
        return Ok(Step::NeedMore(ParserState::ReadingPieceHeader));
    };
    ctx.bytes_consumed += PIECE_HEADER_LEN as u64;

    let data_len = ctx.length - PIECE_HEADER_LEN as u32;
    if data_len == 0 {
        trace!("Empty piece message for {} at {}", index, offset);
        return Ok(Step::Continue(ParserState::AwaitingLength));
    }

    let interval = piece_interval(ctx, index, offset, data_len)?;
    let accepted = receiver.is_wanted(&interval);
    if !accepted {
        debug!("Discarding unsolicited {}", interval);
    }

    Ok(Step::Continue(ParserState::ReadingPiece(PieceRead {
        interval,
        next: interval.low,
        remaining: data_len,
        accepted,
    })))
}

/// The interval a piece message covers, checked against the layout if the
/// framer has one.
fn piece_interval(ctx: &ParseContext, index: u32, offset: u32, len: u32) -> Result<PieceInterval> {
    let bad_offset = || BadMessage::InvalidPieceOffset {
        index,
        offset,
        length: len,
    };
    let high = offset.checked_add(len - 1).ok_or_else(bad_offset)?;

    if let Some(layout) = &ctx.layout {
        let size = layout
            .piece_size(index)
            .ok_or(BadMessage::InvalidPieceIndex(index))?;
        if high as u64 >= size {
            return Err(bad_offset().into());
        }
    }

    Ok(PieceInterval {
        piece_index: index,
        low: offset,
        high,
    })
}

fn reading_piece<S, R>(
    ctx: &mut ParseContext,
    src: &mut S,
    receiver: &mut R,
    mut read: PieceRead,
) -> Result<Step>
where
    S: ByteSource + ?Sized,
    R: MessageReceiver + ?Sized,
{
    if read.remaining == 0 {
        if read.accepted {
            receiver.piece_complete(&read.interval);
        }
        return Ok(Step::Continue(ParserState::AwaitingLength));
    }

    if !read.accepted {
        let dropped = src.discard(read.remaining as usize) as u32;
        ctx.bytes_consumed += dropped as u64;
        ctx.bytes_discarded += dropped as u64;
        read.remaining -= dropped;
        read.next += dropped;

        return Ok(if read.remaining == 0 {
            Step::Continue(ParserState::AwaitingLength)
        } else {
            Step::NeedMore(ParserState::ReadingPiece(read))
        });
    }

    if src.available() == 0 || !receiver.is_ready() {
        return Ok(Step::NeedMore(ParserState::ReadingPiece(read)));
    }

    let data = src.read_bytes(read.remaining as usize);
    let n = data.len() as u32;
    let slice = PieceInterval {
        piece_index: read.interval.piece_index,
        low: read.next,
        high: read.next + n - 1,
    };
    ctx.bytes_consumed += n as u64;
    read.remaining -= n;
    read.next += n;

    Ok(Step::Emit(ParserState::ReadingPiece(read), Message::Piece(slice, data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Wants everything in `wanted` (or everything, if `None`) and glues
    /// piece slices back together on completion.
    #[derive(Default)]
    struct Recorder {
        wanted: Option<Vec<u32>>,
        ready: bool,
        messages: Vec<Message>,
        slices: Vec<(PieceInterval, Bytes)>,
        asked: Vec<PieceInterval>,
    }

    impl Recorder {
        fn all() -> Self {
            Self {
                ready: true,
                ..Default::default()
            }
        }

        fn only(pieces: Vec<u32>) -> Self {
            Self {
                wanted: Some(pieces),
                ready: true,
                ..Default::default()
            }
        }
    }

    impl MessageReceiver for Recorder {
        fn is_wanted(&mut self, interval: &PieceInterval) -> bool {
            self.asked.push(*interval);
            match &self.wanted {
                Some(pieces) => pieces.contains(&interval.piece_index),
                None => true,
            }
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        fn piece_complete(&mut self, interval: &PieceInterval) {
            let mut data = BytesMut::new();
            for (_, part) in self.slices.drain(..) {
                data.extend_from_slice(&part);
            }
            assert_eq!(data.len(), interval.len() as usize);
            self.messages.push(Message::Piece(*interval, data.freeze()));
        }

        fn receive(&mut self, message: Message) -> Result<()> {
            match message {
                Message::Piece(slice, data) => self.slices.push((slice, data)),
                other => self.messages.push(other),
            }
            Ok(())
        }
    }

    fn encode(messages: &[Message]) -> BytesMut {
        let mut buf = BytesMut::new();
        for msg in messages {
            msg.encode(&mut buf);
        }
        buf
    }

    /// Feeds `bytes` in chunks of `step` and delivers everything emitted.
    fn feed(framer: &mut MessageFramer, receiver: &mut Recorder, bytes: &[u8], step: usize) -> Result<()> {
        let mut src = BytesMut::new();
        for chunk in bytes.chunks(step) {
            src.extend_from_slice(chunk);
            while let Some(msg) = framer.advance(&mut src, receiver)? {
                receiver.receive(msg)?;
            }
        }
        Ok(())
    }

    fn sample() -> Vec<Message> {
        vec![
            Message::Bitfield(Bytes::from_static(&[0b1010_0000, 0x01])),
            Message::Generic(MessageId::Unchoke, Bytes::new()),
            Message::have(7),
            Message::Piece(PieceInterval::new(2, 16, 25), Bytes::from_static(b"0123456789")),
            Message::Generic(MessageId::Other(42), Bytes::from_static(b"opaque")),
            Message::Piece(PieceInterval::new(0, 0, 2), Bytes::from_static(b"abc")),
        ]
    }

    #[test]
    fn test_round_trip_any_chunking() {
        let messages = sample();
        let wire = encode(&messages);

        for step in [1, 2, 3, 5, 7, 13, wire.len()] {
            let mut framer = MessageFramer::new();
            let mut receiver = Recorder::all();
            feed(&mut framer, &mut receiver, &wire, step).unwrap();
            assert_eq!(receiver.messages, messages, "chunk size {}", step);
            assert_eq!(framer.bytes_consumed(), wire.len() as u64);
        }
    }

    #[test]
    fn test_slices_cover_the_piece_in_order() {
        let msg = Message::Piece(PieceInterval::new(1, 4, 11), Bytes::from_static(b"abcdefgh"));
        let wire = encode(&[msg]);
        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();

        let mut src = BytesMut::from(&wire[..16]);
        let first = framer.advance(&mut src, &mut receiver).unwrap();
        assert_eq!(
            first,
            Some(Message::Piece(PieceInterval::new(1, 4, 6), Bytes::from_static(b"abc")))
        );
        assert_eq!(framer.advance(&mut src, &mut receiver).unwrap(), None);

        src.extend_from_slice(&wire[16..]);
        let second = framer.advance(&mut src, &mut receiver).unwrap();
        assert_eq!(
            second,
            Some(Message::Piece(PieceInterval::new(1, 7, 11), Bytes::from_static(b"defgh")))
        );
        assert_eq!(receiver.asked, vec![PieceInterval::new(1, 4, 11)]);
    }

    #[test]
    fn test_bitfield_fragments() {
        let bits: Vec<u8> = (0..37).map(|i| i * 7).collect();
        let wire = encode(&[Message::Bitfield(Bytes::from(bits.clone()))]);

        for step in 1..=wire.len() {
            let mut framer = MessageFramer::new();
            let mut receiver = Recorder::all();
            feed(&mut framer, &mut receiver, &wire, step).unwrap();
            assert_eq!(receiver.messages, vec![Message::Bitfield(Bytes::from(bits.clone()))]);
        }
    }

    #[test]
    fn test_bitfield_must_come_first() {
        let late = encode(&[
            Message::Generic(MessageId::Interested, Bytes::new()),
            Message::Bitfield(Bytes::from_static(&[0xff])),
        ]);
        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();
        let err = feed(&mut framer, &mut receiver, &late, 1).unwrap_err();
        assert!(matches!(err, SwarmError::MalformedMessage(BadMessage::BitfieldNotFirst)));
        assert!(err.is_connection_fatal());

        // a keep-alive ahead of it doesn't count as a message
        let mut early = BytesMut::from(&[0u8, 0, 0, 0][..]);
        early.extend_from_slice(&encode(&[Message::Bitfield(Bytes::from_static(&[0xff]))]));
        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();
        feed(&mut framer, &mut receiver, &early, 3).unwrap();
        assert_eq!(receiver.messages.len(), 1);
        assert!(framer.data_observed());
    }

    #[test]
    fn test_oversized_rejected_before_consuming() {
        let mut src = BytesMut::new();
        src.extend_from_slice(&(MAX_MESSAGE_LENGTH + 1).to_be_bytes());
        src.extend_from_slice(&[7, 0, 0, 0, 0]);

        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();
        let err = framer.advance(&mut src, &mut receiver).unwrap_err();
        assert!(matches!(
            err,
            SwarmError::MalformedMessage(BadMessage::Oversized(l)) if l == MAX_MESSAGE_LENGTH + 1
        ));
        assert_eq!(src.len(), 9);
        assert_eq!(framer.bytes_consumed(), 0);
    }

    #[test]
    fn test_lowered_max_length() {
        let wire = encode(&[Message::Generic(MessageId::Other(99), Bytes::from(vec![0u8; 64]))]);
        let mut framer = MessageFramer::new().with_max_length(32);
        let mut receiver = Recorder::all();
        assert!(feed(&mut framer, &mut receiver, &wire, wire.len()).is_err());

        let framer = MessageFramer::new().with_max_length(u32::MAX);
        assert_eq!(framer.context().max_length, MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn test_unsolicited_piece_is_discarded() {
        let data = vec![9u8; 300];
        let wire = encode(&[
            Message::Piece(PieceInterval::new(3, 0, 299), Bytes::from(data)),
            Message::have(1),
        ]);
        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::only(vec![1]);

        let mut src = BytesMut::from(&wire[..4 + 309]);
        assert_eq!(framer.advance(&mut src, &mut receiver).unwrap(), None);
        assert_eq!(framer.bytes_consumed(), 4 + 309);
        assert_eq!(framer.bytes_discarded(), 300);
        assert!(receiver.slices.is_empty());

        src.extend_from_slice(&wire[4 + 309..]);
        assert_eq!(framer.advance(&mut src, &mut receiver).unwrap(), Some(Message::have(1)));
    }

    #[test]
    fn test_keep_alives_are_invisible() {
        let mut wire = BytesMut::new();
        for msg in sample() {
            wire.extend_from_slice(&[0, 0, 0, 0]);
            msg.encode(&mut wire);
            wire.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        }

        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();
        feed(&mut framer, &mut receiver, &wire, 5).unwrap();
        assert_eq!(receiver.messages, sample());
    }

    #[test]
    fn test_piece_too_short() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 5, 7, 0, 0, 0, 1][..]);
        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();
        assert!(matches!(
            framer.advance(&mut src, &mut receiver),
            Err(SwarmError::MalformedMessage(BadMessage::PieceTooShort(5)))
        ));
    }

    #[test]
    fn test_piece_outside_layout() {
        let layout = PieceLayout::single_file("f", 16, 40).unwrap();
        let cases = [
            (Message::Piece(PieceInterval::new(3, 0, 0), Bytes::from_static(b"x")), false),
            (Message::Piece(PieceInterval::new(2, 4, 8), Bytes::from_static(b"hello")), false),
            (Message::Piece(PieceInterval::new(2, 0, 7), Bytes::from_static(b"12345678")), true),
        ];

        for (msg, ok) in cases {
            let mut framer = MessageFramer::new().with_layout(layout.clone());
            let mut receiver = Recorder::all();
            let result = feed(&mut framer, &mut receiver, &encode(&[msg]), 64);
            assert_eq!(result.is_ok(), ok);
        }
    }

    #[test]
    fn test_shutdown_is_absorbing() {
        let mut src = BytesMut::from(&[0xffu8, 0xff, 0xff, 0xff][..]);
        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();
        assert!(framer.advance(&mut src, &mut receiver).is_err());
        assert!(framer.is_shut_down());

        let mut good = encode(&[Message::have(1)]);
        assert!(matches!(framer.advance(&mut good, &mut receiver), Err(SwarmError::Shutdown)));
        assert_eq!(good.len(), 9);
    }

    #[test]
    fn test_holds_piece_data_until_ready() {
        let wire = encode(&[Message::Piece(PieceInterval::new(0, 0, 3), Bytes::from_static(b"wxyz"))]);
        let mut src = BytesMut::from(&wire[..]);
        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();
        receiver.ready = false;

        assert_eq!(framer.advance(&mut src, &mut receiver).unwrap(), None);
        assert_eq!(src.len(), 4);

        receiver.ready = true;
        let slice = framer.advance(&mut src, &mut receiver).unwrap();
        assert_eq!(
            slice,
            Some(Message::Piece(PieceInterval::new(0, 0, 3), Bytes::from_static(b"wxyz")))
        );
    }

    #[test]
    fn test_empty_piece_produces_nothing() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 9, 7, 0, 0, 0, 1, 0, 0, 0, 0][..]);
        src.extend_from_slice(&encode(&[Message::have(2)]));
        let mut framer = MessageFramer::new();
        let mut receiver = Recorder::all();
        assert_eq!(framer.advance(&mut src, &mut receiver).unwrap(), Some(Message::have(2)));
        assert!(receiver.asked.is_empty());
    }
}

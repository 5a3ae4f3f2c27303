//! Receive side of the peer-wire protocol: framing, flow control and the
//! per-connection piece handler.

mod driver;
mod framer;
mod message;
mod session;
mod source;

pub use driver::{FramerDriver, ReadInterest, MIN_RECEIVE_BUFFER};
pub use framer::{MessageFramer, MessageReceiver, ParseContext, ParserState, PieceRead, MAX_MESSAGE_LENGTH};
pub use message::{Message, MessageId, KEEP_ALIVE};
pub use session::{PieceSession, SessionStats};
pub use source::ByteSource;

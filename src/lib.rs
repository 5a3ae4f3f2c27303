//! Peer-wire message framing and swarm piece leasing for BitTorrent
//! downloads.

pub mod cli;
pub mod client;
pub mod error;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod webseed;

pub use error::{BadMessage, Result, SwarmError};

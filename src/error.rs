use thiserror::Error;

/// Reasons a peer-wire frame is rejected. Every one of these is fatal to the
/// connection that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BadMessage {
    #[error("oversized message: declared length {0}")]
    Oversized(u32),

    #[error("bitfield must be first")]
    BitfieldNotFirst,

    #[error("piece too short: declared length {0}")]
    PieceTooShort(u32),

    #[error("piece index {0} out of range")]
    InvalidPieceIndex(u32),

    #[error("piece {index}: block at offset {offset} with {length} bytes exceeds the piece")]
    InvalidPieceOffset { index: u32, offset: u32, length: u32 },

    #[error("bitfield of {actual} bytes, expected {expected}")]
    InvalidBitfieldLength { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] BadMessage),

    #[error("Incomplete write: expected {expected} bytes, wrote {written}")]
    IncompleteWrite { expected: u64, written: u64 },

    #[error("Lease conflict: {0}")]
    LeaseConflict(String),

    #[error("Disk backend failure: {0}")]
    BackendFailure(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Write job was cancelled")]
    Cancelled,

    #[error("Connection is shut down")]
    Shutdown,

    #[error("Web seed error: {0}")]
    WebSeedError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(String),
}

impl From<url::ParseError> for SwarmError {
    fn from(err: url::ParseError) -> Self {
        SwarmError::UrlParseError(err.to_string())
    }
}

impl SwarmError {
    /// Errors after which the owning connection must be torn down.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SwarmError::MalformedMessage(_) | SwarmError::Shutdown | SwarmError::IoError(_)
        )
    }

    /// Errors that only cost one source its lease; the range can be handed
    /// to another source after `unlease`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SwarmError::IncompleteWrite { .. }
                | SwarmError::BackendFailure(_)
                | SwarmError::Cancelled
                | SwarmError::WebSeedError(_)
                | SwarmError::HttpError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;

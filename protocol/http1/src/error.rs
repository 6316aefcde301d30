//! Parse errors. All of them are fatal to the connection.

use protocol_headers::HeaderError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A byte that is not allowed where it appeared.
    #[error("invalid byte 0x{byte:02x} in state {state}")]
    Invalid { byte: u8, state: &'static str },

    /// A token or line outgrew the scratch buffer.
    #[error("{state} exceeds the {limit} byte limit")]
    TooLarge { state: &'static str, limit: usize },

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("message has both transfer-encoding and content-length")]
    ConflictingLength,

    #[error("chunk size overflows 64 bits")]
    ChunkSizeOverflow,

    #[error("status code longer than 3 digits")]
    StatusTooLong,

    #[error("unsupported HTTP version {0:?}")]
    UnsupportedVersion(String),

    /// The peer closed the stream in the middle of a message.
    #[error("unexpected end of stream in state {state}")]
    UnexpectedEof { state: &'static str },

    #[error(transparent)]
    Header(#[from] HeaderError),
}

//! HTTP/2 connection state machine.
//!
//! This module implements the server side of the HTTP/2 connection layer:
//! - Connection preface and settings exchange
//! - Stream lifecycle and the concurrent stream table
//! - Flow control (connection and stream level)
//! - GOAWAY draining and error mapping to GOAWAY / RST_STREAM
//!
//! One reader drives [`ServerConnection`]; workers answer streams through
//! [`StreamWriter`], which shares the connection's write lock.

mod server;
mod settings;
mod stream;

pub use server::{ConnectionOptions, ServerConnection, ServerEvent, Shared, StreamWriter};
pub use settings::{PendingSettings, Settings, SettingsError};
pub use stream::{
    Request, RequestHead, Stream, StreamId, StreamState, validate_request, validate_trailers,
};

use std::io;

use crate::flow::FlowError;
use crate::frame::{ErrorCode, FrameError};
use crate::hpack::HpackError;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// We sent GOAWAY; existing streams drain, new ones are discarded.
    HalfClosedLocal,
    /// The peer sent GOAWAY or closed its side of the socket.
    HalfClosedRemote,
    Closed,
}

/// A protocol violation, classified by how much must be torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum H2Error {
    /// Answered with GOAWAY, the connection closes.
    #[error("connection error {code}: {reason}")]
    Connection { code: ErrorCode, reason: String },
    /// Answered with RST_STREAM, other streams continue.
    #[error("stream {id} error {code}: {reason}")]
    Stream {
        id: StreamId,
        code: ErrorCode,
        reason: String,
    },
}

impl H2Error {
    pub fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        H2Error::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub fn stream(id: StreamId, code: ErrorCode, reason: impl Into<String>) -> Self {
        H2Error::Stream {
            id,
            code,
            reason: reason.into(),
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, H2Error::Connection { .. })
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            H2Error::Connection { code, .. } | H2Error::Stream { code, .. } => *code,
        }
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            H2Error::Stream { id, .. } => Some(*id),
            H2Error::Connection { .. } => None,
        }
    }
}

impl From<FrameError> for H2Error {
    fn from(e: FrameError) -> Self {
        H2Error::connection(e.error_code(), e.to_string())
    }
}

impl From<HpackError> for H2Error {
    fn from(e: HpackError) -> Self {
        H2Error::connection(e.error_code(), e.to_string())
    }
}

impl From<SettingsError> for H2Error {
    fn from(e: SettingsError) -> Self {
        H2Error::connection(e.error_code(), e.to_string())
    }
}

/// Errors surfaced to the owner of a connection or to a stream worker.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The connection was torn down after sending GOAWAY with `code`.
    #[error("protocol error {code}: {reason}")]
    Protocol { code: ErrorCode, reason: String },
    /// The peer closed the socket before the connection finished.
    #[error("connection closed by peer")]
    UnexpectedEof,
    #[error("stream {0} is not writable")]
    StreamClosed(StreamId),
    #[error("timed out waiting for flow control credit on stream {0}")]
    FlowTimeout(StreamId),
    #[error("flow control: {0}")]
    Flow(#[from] FlowError),
    #[error("connection is closed")]
    Closed,
}

impl ConnectionError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ConnectionError::Protocol { code, .. } => *code,
            ConnectionError::Flow(e) => e.error_code(),
            ConnectionError::FlowTimeout(_) => ErrorCode::FlowControlError,
            ConnectionError::StreamClosed(_) => ErrorCode::StreamClosed,
            _ => ErrorCode::InternalError,
        }
    }
}

/// Application side of an HTTP/2 connection.
///
/// Called once per complete request, on a worker of the caller's choosing.
/// The handler owns the stream until it ends the response or resets it;
/// dropping the writer without ending the stream resets it with CANCEL.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request, writer: StreamWriter);
}

impl<F> RequestHandler for F
where
    F: Fn(Request, StreamWriter) + Send + Sync + 'static,
{
    fn handle(&self, request: Request, writer: StreamWriter) {
        self(request, writer)
    }
}

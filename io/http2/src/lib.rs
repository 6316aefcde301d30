//! http2 - HTTP/2 server engine over blocking byte channels.
//!
//! Threads, not async: one reader per connection drives the protocol state
//! machine, and any number of workers write responses through a shared,
//! lock-protected encoder.
//!
//! # Features
//!
//! - HTTP/2 frame encoding and decoding, with CONTINUATION reassembly
//! - HPACK header compression, including Huffman coding and never-indexed
//!   literals for sensitive headers
//! - Connection and stream state management with GOAWAY draining
//! - Blocking flow control at connection and stream level
//!
//! # Architecture
//!
//! - `frame`: HTTP/2 frame types, encoding, and decoding
//! - `hpack`: HPACK header compression
//! - `flow`: send and receive windows
//! - `connection`: HTTP/2 connection state machine
//! - `transport`: the byte channel the connection runs over

pub mod connection;
pub mod flow;
pub mod frame;
pub mod hpack;
pub mod transport;

pub use frame::{
    CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_FRAME_SIZE, DataFrame, ErrorCode,
    FRAME_HEADER_SIZE, Frame, FrameDecoder, FrameEncoder, FrameError, FrameType, GoAwayFrame,
    HeadersFrame, PingFrame, Priority, RstStreamFrame, Setting, SettingId, SettingsFrame, StreamId,
    WindowUpdateFrame,
};

pub use hpack::{HeaderField, HpackDecoder, HpackEncoder, HpackError};

pub use flow::{FlowError, IncomingWindow, OutgoingWindow};

pub use transport::{ByteChannel, MemoryChannel};

pub use connection::{
    ConnectionError, ConnectionOptions, ConnectionState, H2Error, Request, RequestHandler,
    RequestHead, ServerConnection, ServerEvent, Settings, StreamState, StreamWriter,
};

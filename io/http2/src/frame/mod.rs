//! HTTP/2 frame types and parsing.
//!
//! HTTP/2 frames have a common 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```

mod assembler;
mod decode;
mod encode;
mod error;
mod types;

pub use assembler::{
    Action, AssembledHeaders, BlockKind, DEFAULT_MAX_HEADER_BLOCK_SIZE, HeaderBlockAssembler,
};
pub use decode::FrameDecoder;
pub(crate) use decode::validate_setting;
pub use encode::FrameEncoder;
pub use error::{ErrorCode, FrameError};
pub use types::*;

/// Maximum frame size allowed by RFC 7540 (2^24 - 1).
pub const MAX_FRAME_SIZE: u32 = 16_777_215;

/// Default and minimum `SETTINGS_MAX_FRAME_SIZE` (16 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Connection preface sent by clients.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size for flow control.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Largest flow-control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Default header table size for HPACK.
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;

/// Maximum concurrent streams advertised by default.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Default `SETTINGS_MAX_HEADER_LIST_SIZE` advertised by the server.
pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 8_192;

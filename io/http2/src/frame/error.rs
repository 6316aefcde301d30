//! HTTP/2 error codes and frame-level errors.

use std::fmt;

use super::types::FrameType;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Map a wire value to a known code. Unknown codes are treated as
    /// `INTERNAL_ERROR` (RFC 7540 Section 7).
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    #[inline]
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// The RFC name of this code, e.g. `PROTOCOL_ERROR`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding frames or reassembling header blocks.
///
/// Every variant is a connection error; [`FrameError::error_code`] gives the
/// code to put in the GOAWAY.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("frame type 0x{frame_type:02x} must be sent on stream 0")]
    InvalidStreamZero { frame_type: u8 },

    #[error("frame type 0x{frame_type:02x} requires a non-zero stream id")]
    StreamIdRequired { frame_type: u8 },

    #[error("frame type 0x{frame_type:02x} expected {expected} bytes, got {actual}")]
    InvalidPayloadLength {
        frame_type: u8,
        expected: usize,
        actual: usize,
    },

    #[error("padding length {pad_length} exceeds payload length {payload_length}")]
    InvalidPadding {
        pad_length: u8,
        payload_length: usize,
    },

    #[error("invalid value {value} for setting 0x{id:04x}")]
    InvalidSettingValue { id: u16, value: u32 },

    #[error("expected CONTINUATION for stream {expected}, got frame type 0x{frame_type:02x} on stream {actual}")]
    ContinuationExpected {
        expected: u32,
        actual: u32,
        frame_type: u8,
    },

    #[error("CONTINUATION on stream {0} without a preceding HEADERS")]
    UnexpectedContinuation(u32),

    #[error("header block of {size} bytes exceeds limit {max}")]
    HeaderBlockTooLarge { size: usize, max: usize },
}

impl FrameError {
    /// Error code to report to the peer for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FrameError::FrameTooLarge { .. } => ErrorCode::FrameSizeError,
            FrameError::InvalidPayloadLength { .. } => ErrorCode::FrameSizeError,
            FrameError::InvalidSettingValue { id, .. }
                if *id == super::SettingId::InitialWindowSize.to_u16() =>
            {
                ErrorCode::FlowControlError
            }
            FrameError::HeaderBlockTooLarge { .. } => ErrorCode::EnhanceYourCalm,
            _ => ErrorCode::ProtocolError,
        }
    }

    pub(crate) fn payload_length(frame_type: FrameType, expected: usize, actual: usize) -> Self {
        FrameError::InvalidPayloadLength {
            frame_type: frame_type as u8,
            expected,
            actual,
        }
    }
}

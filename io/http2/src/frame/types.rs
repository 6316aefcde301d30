//! HTTP/2 frame type definitions.

use bytes::{BufMut, Bytes};

use super::FRAME_HEADER_SIZE;

/// HTTP/2 frame types (RFC 7540 Section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::GoAway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }
}

/// Frame flags.
pub mod flags {
    /// DATA/HEADERS: last frame the sender will send on this stream.
    pub const END_STREAM: u8 = 0x1;
    /// SETTINGS/PING: acknowledgment.
    pub const ACK: u8 = 0x1;
    /// HEADERS/PUSH_PROMISE/CONTINUATION: header block is complete.
    pub const END_HEADERS: u8 = 0x4;
    /// DATA/HEADERS/PUSH_PROMISE: pad length byte and padding present.
    pub const PADDED: u8 = 0x8;
    /// HEADERS: exclusive flag, dependency and weight present.
    pub const PRIORITY: u8 = 0x20;
}

/// Stream identifier (31 bits, high bit reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream 0, used for connection-level frames.
    pub const CONNECTION: StreamId = StreamId(0);

    /// Largest legal stream id.
    pub const MAX: StreamId = StreamId(0x7FFF_FFFF);

    /// Create a stream id, masking the reserved bit.
    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & 0x7FFF_FFFF)
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_connection_level(self) -> bool {
        self.0 == 0
    }

    /// Client-initiated streams use odd ids.
    #[inline]
    pub fn is_client_initiated(self) -> bool {
        self.0 % 2 == 1
    }

    /// Server-initiated streams use even, non-zero ids.
    #[inline]
    pub fn is_server_initiated(self) -> bool {
        self.0 != 0 && self.0.is_multiple_of(2)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        StreamId::new(id)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 9-byte header that precedes every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length (24 bits).
    pub length: u32,
    /// Raw frame type; unknown types are preserved.
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: StreamId,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, flags: u8, stream_id: StreamId, length: u32) -> Self {
        Self {
            length,
            frame_type: frame_type as u8,
            flags,
            stream_id,
        }
    }

    /// Read a header from the first [`FRAME_HEADER_SIZE`] bytes of `buf`.
    ///
    /// Returns `None` if fewer than nine bytes are available. The reserved
    /// bit of the stream id is ignored.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let stream_id = StreamId::new(u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]));
        Some(Self {
            length,
            frame_type: buf[3],
            flags: buf[4],
            stream_id,
        })
    }

    /// Append the 9 header bytes to `buf`.
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        let len = self.length.to_be_bytes();
        buf.put_slice(&len[1..]);
        buf.put_u8(self.frame_type);
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id.value());
    }

    /// The frame type, if it is one this crate knows.
    pub fn get_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }

    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A decoded HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    /// Extension or unknown frame; read and discarded by the connection.
    Unknown(UnknownFrame),
}

impl Frame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::Settings(_) => StreamId::CONNECTION,
            Frame::PushPromise(f) => f.stream_id,
            Frame::Ping(_) => StreamId::CONNECTION,
            Frame::GoAway(_) => StreamId::CONNECTION,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Continuation(f) => f.stream_id,
            Frame::Unknown(f) => f.stream_id,
        }
    }

    /// Raw type byte of this frame.
    pub fn type_byte(&self) -> u8 {
        match self {
            Frame::Data(_) => FrameType::Data as u8,
            Frame::Headers(_) => FrameType::Headers as u8,
            Frame::Priority(_) => FrameType::Priority as u8,
            Frame::RstStream(_) => FrameType::RstStream as u8,
            Frame::Settings(_) => FrameType::Settings as u8,
            Frame::PushPromise(_) => FrameType::PushPromise as u8,
            Frame::Ping(_) => FrameType::Ping as u8,
            Frame::GoAway(_) => FrameType::GoAway as u8,
            Frame::WindowUpdate(_) => FrameType::WindowUpdate as u8,
            Frame::Continuation(_) => FrameType::Continuation as u8,
            Frame::Unknown(f) => f.frame_type,
        }
    }
}

/// DATA frame (type=0x0). Padding has already been removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub end_stream: bool,
    pub data: Bytes,
    /// Bytes of padding (including the pad length octet) that counted
    /// against flow control but were stripped from `data`.
    pub padding: u32,
}

impl DataFrame {
    /// Bytes this frame consumes from the flow-control window.
    pub fn flow_len(&self) -> u32 {
        self.data.len() as u32 + self.padding
    }
}

/// HEADERS frame (type=0x1). Padding and priority fields are stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<Priority>,
    /// HPACK-encoded header block fragment.
    pub header_block: Bytes,
}

/// Stream priority information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: StreamId,
    /// Weight minus one (wire value 0-255 means 1-256).
    pub weight: u8,
}

/// PRIORITY frame (type=0x2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: StreamId,
    pub priority: Priority,
}

/// RST_STREAM frame (type=0x3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: u32,
}

/// SETTINGS frame (type=0x4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Vec<Setting>,
}

impl SettingsFrame {
    pub fn ack() -> Self {
        Self {
            ack: true,
            settings: Vec::new(),
        }
    }
}

/// Individual setting in a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}

/// Setting identifiers (RFC 7540 Section 6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    /// Unknown identifiers must be ignored.
    Unknown(u16),
}

impl SettingId {
    pub fn from_u16(id: u16) -> Self {
        match id {
            0x1 => SettingId::HeaderTableSize,
            0x2 => SettingId::EnablePush,
            0x3 => SettingId::MaxConcurrentStreams,
            0x4 => SettingId::InitialWindowSize,
            0x5 => SettingId::MaxFrameSize,
            0x6 => SettingId::MaxHeaderListSize,
            _ => SettingId::Unknown(id),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            SettingId::HeaderTableSize => 0x1,
            SettingId::EnablePush => 0x2,
            SettingId::MaxConcurrentStreams => 0x3,
            SettingId::InitialWindowSize => 0x4,
            SettingId::MaxFrameSize => 0x5,
            SettingId::MaxHeaderListSize => 0x6,
            SettingId::Unknown(id) => id,
        }
    }
}

/// PUSH_PROMISE frame (type=0x5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    pub stream_id: StreamId,
    pub end_headers: bool,
    pub promised_stream_id: StreamId,
    pub header_block: Bytes,
}

/// PING frame (type=0x6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

/// GOAWAY frame (type=0x7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: StreamId,
    pub error_code: u32,
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    /// Debug data interpreted as UTF-8, with invalid sequences replaced.
    pub fn debug_data_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.debug_data)
    }
}

/// WINDOW_UPDATE frame (type=0x8).
///
/// An increment of zero is decoded as-is; whether it is a stream or a
/// connection error depends on the stream id and is decided by the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub increment: u32,
}

/// CONTINUATION frame (type=0x9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: StreamId,
    pub end_headers: bool,
    pub header_block: Bytes,
}

/// Unknown frame type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_frame_type_from_u8() {
        assert_eq!(FrameType::from_u8(0x0), Some(FrameType::Data));
        assert_eq!(FrameType::from_u8(0x4), Some(FrameType::Settings));
        assert_eq!(FrameType::from_u8(0x9), Some(FrameType::Continuation));
        assert_eq!(FrameType::from_u8(0xa), None);
        assert_eq!(FrameType::from_u8(0xff), None);
    }

    #[test]
    fn test_stream_id_masks_reserved_bit() {
        assert_eq!(StreamId::new(0x8000_0001).value(), 1);
        assert_eq!(StreamId::from(0xFFFF_FFFF), StreamId::MAX);
    }

    #[test]
    fn test_stream_id_initiator() {
        assert!(StreamId(1).is_client_initiated());
        assert!(!StreamId(1).is_server_initiated());
        assert!(StreamId(2).is_server_initiated());
        assert!(!StreamId(0).is_server_initiated());
        assert!(!StreamId(0).is_client_initiated());
        assert!(StreamId::CONNECTION.is_connection_level());
    }

    #[test]
    fn test_frame_header_parse() {
        let bytes = [0x00, 0x01, 0x02, 0x01, 0x05, 0x80, 0x00, 0x00, 0x03];
        let header = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(header.length, 258);
        assert_eq!(header.get_type(), Some(FrameType::Headers));
        assert!(header.has_flag(flags::END_STREAM));
        assert!(header.has_flag(flags::END_HEADERS));
        assert!(!header.has_flag(flags::PADDED));
        assert_eq!(header.stream_id, StreamId(3));
    }

    #[test]
    fn test_frame_header_parse_short() {
        assert!(FrameHeader::parse(&[0; 8]).is_none());
    }

    #[test]
    fn test_frame_header_write() {
        let header = FrameHeader::new(FrameType::Data, flags::END_STREAM, StreamId(7), 16_384);
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert_eq!(
            &buf[..],
            &[0x00, 0x40, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x07]
        );
        assert_eq!(FrameHeader::parse(&buf), Some(header));
    }

    #[test]
    fn test_setting_id_mapping() {
        for id in 1u16..=6 {
            assert_eq!(SettingId::from_u16(id).to_u16(), id);
        }
        assert_eq!(SettingId::from_u16(0x42), SettingId::Unknown(0x42));
        assert_eq!(SettingId::Unknown(0x42).to_u16(), 0x42);
    }

    #[test]
    fn test_goaway_debug_data() {
        let frame = GoAwayFrame {
            last_stream_id: StreamId(5),
            error_code: 0,
            debug_data: Bytes::from("Multilingual 文字"),
        };
        assert_eq!(frame.debug_data_lossy(), "Multilingual 文字");
    }

    #[test]
    fn test_data_flow_len_counts_padding() {
        let frame = DataFrame {
            stream_id: StreamId(1),
            end_stream: false,
            data: Bytes::from_static(b"hello"),
            padding: 4,
        };
        assert_eq!(frame.flow_len(), 9);
    }
}

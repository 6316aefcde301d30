//! HTTP/2 frame decoding.

use bytes::{Buf, Bytes, BytesMut};

use super::error::FrameError;
use super::types::*;
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, MAX_WINDOW_SIZE, flags};

/// Parses frames from the front of a receive buffer.
///
/// The decoder is stateless apart from the local `SETTINGS_MAX_FRAME_SIZE`;
/// header block reassembly across CONTINUATION frames is done by
/// [`super::HeaderBlockAssembler`].
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the largest payload this endpoint accepts.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Try to decode one frame.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame; no
    /// bytes are consumed in that case. On success the frame's bytes are
    /// split off the front of `buf`.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(header) = FrameHeader::parse(buf) else {
            return Ok(None);
        };

        if header.length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: header.length,
                max: self.max_frame_size,
            });
        }

        let total_len = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize).freeze();

        parse_frame(header, payload).map(Some)
    }
}

fn parse_frame(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    let Some(frame_type) = header.get_type() else {
        return Ok(Frame::Unknown(UnknownFrame {
            frame_type: header.frame_type,
            flags: header.flags,
            stream_id: header.stream_id,
            payload,
        }));
    };

    match frame_type {
        FrameType::Settings | FrameType::Ping | FrameType::GoAway => {
            if !header.stream_id.is_connection_level() {
                return Err(FrameError::InvalidStreamZero {
                    frame_type: header.frame_type,
                });
            }
        }
        FrameType::WindowUpdate => {}
        _ => {
            if header.stream_id.is_connection_level() {
                return Err(FrameError::StreamIdRequired {
                    frame_type: header.frame_type,
                });
            }
        }
    }

    match frame_type {
        FrameType::Data => parse_data(header, payload),
        FrameType::Headers => parse_headers(header, payload),
        FrameType::Priority => parse_priority(header, payload),
        FrameType::RstStream => parse_rst_stream(header, payload),
        FrameType::Settings => parse_settings(header, payload),
        FrameType::PushPromise => parse_push_promise(header, payload),
        FrameType::Ping => parse_ping(header, payload),
        FrameType::GoAway => parse_goaway(header, payload),
        FrameType::WindowUpdate => parse_window_update(header, payload),
        FrameType::Continuation => Ok(Frame::Continuation(ContinuationFrame {
            stream_id: header.stream_id,
            end_headers: header.has_flag(flags::END_HEADERS),
            header_block: payload,
        })),
    }
}

fn parse_data(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    let full_len = payload.len();
    let data = if header.has_flag(flags::PADDED) {
        remove_padding(payload)?
    } else {
        payload
    };

    Ok(Frame::Data(DataFrame {
        stream_id: header.stream_id,
        end_stream: header.has_flag(flags::END_STREAM),
        padding: (full_len - data.len()) as u32,
        data,
    }))
}

fn parse_headers(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    let mut payload = if header.has_flag(flags::PADDED) {
        remove_padding(payload)?
    } else {
        payload
    };

    let priority = if header.has_flag(flags::PRIORITY) {
        if payload.len() < 5 {
            return Err(FrameError::payload_length(
                FrameType::Headers,
                5,
                payload.len(),
            ));
        }
        Some(read_priority(&mut payload))
    } else {
        None
    };

    Ok(Frame::Headers(HeadersFrame {
        stream_id: header.stream_id,
        end_stream: header.has_flag(flags::END_STREAM),
        end_headers: header.has_flag(flags::END_HEADERS),
        priority,
        header_block: payload,
    }))
}

fn read_priority(payload: &mut Bytes) -> Priority {
    let first = payload.get_u32();
    Priority {
        exclusive: first & 0x8000_0000 != 0,
        dependency: StreamId::new(first),
        weight: payload.get_u8(),
    }
}

fn parse_priority(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if payload.len() != 5 {
        return Err(FrameError::payload_length(
            FrameType::Priority,
            5,
            payload.len(),
        ));
    }

    Ok(Frame::Priority(PriorityFrame {
        stream_id: header.stream_id,
        priority: read_priority(&mut payload),
    }))
}

fn parse_rst_stream(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if payload.len() != 4 {
        return Err(FrameError::payload_length(
            FrameType::RstStream,
            4,
            payload.len(),
        ));
    }

    Ok(Frame::RstStream(RstStreamFrame {
        stream_id: header.stream_id,
        error_code: payload.get_u32(),
    }))
}

fn parse_settings(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    let ack = header.has_flag(flags::ACK);

    if ack && !payload.is_empty() {
        return Err(FrameError::payload_length(
            FrameType::Settings,
            0,
            payload.len(),
        ));
    }

    if !payload.len().is_multiple_of(6) {
        return Err(FrameError::payload_length(
            FrameType::Settings,
            payload.len() - payload.len() % 6,
            payload.len(),
        ));
    }

    let mut settings = Vec::with_capacity(payload.len() / 6);
    while payload.has_remaining() {
        let id = SettingId::from_u16(payload.get_u16());
        let value = payload.get_u32();
        validate_setting(id, value)?;
        settings.push(Setting { id, value });
    }

    Ok(Frame::Settings(SettingsFrame { ack, settings }))
}

/// Range checks from RFC 7540 Section 6.5.2.
pub(crate) fn validate_setting(id: SettingId, value: u32) -> Result<(), FrameError> {
    let valid = match id {
        SettingId::EnablePush => value <= 1,
        SettingId::InitialWindowSize => value <= MAX_WINDOW_SIZE,
        SettingId::MaxFrameSize => {
            (DEFAULT_MAX_FRAME_SIZE..=super::MAX_FRAME_SIZE).contains(&value)
        }
        _ => true,
    };
    if valid {
        Ok(())
    } else {
        Err(FrameError::InvalidSettingValue {
            id: id.to_u16(),
            value,
        })
    }
}

fn parse_push_promise(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    let mut payload = if header.has_flag(flags::PADDED) {
        remove_padding(payload)?
    } else {
        payload
    };

    if payload.len() < 4 {
        return Err(FrameError::payload_length(
            FrameType::PushPromise,
            4,
            payload.len(),
        ));
    }

    let promised_stream_id = StreamId::new(payload.get_u32());

    Ok(Frame::PushPromise(PushPromiseFrame {
        stream_id: header.stream_id,
        end_headers: header.has_flag(flags::END_HEADERS),
        promised_stream_id,
        header_block: payload,
    }))
}

fn parse_ping(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    let data: [u8; 8] = payload
        .as_ref()
        .try_into()
        .map_err(|_| FrameError::payload_length(FrameType::Ping, 8, payload.len()))?;

    Ok(Frame::Ping(PingFrame {
        ack: header.has_flag(flags::ACK),
        data,
    }))
}

fn parse_goaway(_header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if payload.len() < 8 {
        return Err(FrameError::payload_length(
            FrameType::GoAway,
            8,
            payload.len(),
        ));
    }

    let last_stream_id = StreamId::new(payload.get_u32());
    let error_code = payload.get_u32();

    Ok(Frame::GoAway(GoAwayFrame {
        last_stream_id,
        error_code,
        debug_data: payload,
    }))
}

fn parse_window_update(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    if payload.len() != 4 {
        return Err(FrameError::payload_length(
            FrameType::WindowUpdate,
            4,
            payload.len(),
        ));
    }

    Ok(Frame::WindowUpdate(WindowUpdateFrame {
        stream_id: header.stream_id,
        increment: payload.get_u32() & 0x7FFF_FFFF,
    }))
}

/// Strip the pad length octet and trailing padding.
fn remove_padding(mut payload: Bytes) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::InvalidPadding {
            pad_length: 0,
            payload_length: 0,
        });
    }

    let pad_length = payload.get_u8();
    if pad_length as usize > payload.len() {
        return Err(FrameError::InvalidPadding {
            pad_length,
            payload_length: payload.len() + 1,
        });
    }

    let data_len = payload.len() - pad_length as usize;
    Ok(payload.slice(..data_len))
}

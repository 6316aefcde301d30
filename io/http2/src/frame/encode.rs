//! HTTP/2 frame encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::types::*;
use super::{FRAME_HEADER_SIZE, flags};

/// Serialises frames into a send buffer.
///
/// `max_frame_size` is the peer's `SETTINGS_MAX_FRAME_SIZE`; it bounds the
/// fragments produced by [`FrameEncoder::encode_header_block`]. Frames passed
/// to [`FrameEncoder::encode`] are written as given.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        match frame {
            Frame::Data(f) => {
                let fl = if f.end_stream { flags::END_STREAM } else { 0 };
                put_frame(buf, FrameType::Data as u8, fl, f.stream_id, &[&f.data]);
            }
            Frame::Headers(f) => self.encode_headers(f, buf),
            Frame::Priority(f) => {
                let mut p = [0u8; 5];
                write_priority(&f.priority, &mut p);
                put_frame(buf, FrameType::Priority as u8, 0, f.stream_id, &[&p]);
            }
            Frame::RstStream(f) => {
                put_frame(
                    buf,
                    FrameType::RstStream as u8,
                    0,
                    f.stream_id,
                    &[&f.error_code.to_be_bytes()],
                );
            }
            Frame::Settings(f) => {
                let mut payload = Vec::with_capacity(f.settings.len() * 6);
                if !f.ack {
                    for setting in &f.settings {
                        payload.put_u16(setting.id.to_u16());
                        payload.put_u32(setting.value);
                    }
                }
                let fl = if f.ack { flags::ACK } else { 0 };
                put_frame(
                    buf,
                    FrameType::Settings as u8,
                    fl,
                    StreamId::CONNECTION,
                    &[&payload],
                );
            }
            Frame::PushPromise(f) => {
                let fl = if f.end_headers { flags::END_HEADERS } else { 0 };
                put_frame(
                    buf,
                    FrameType::PushPromise as u8,
                    fl,
                    f.stream_id,
                    &[&f.promised_stream_id.value().to_be_bytes(), &f.header_block],
                );
            }
            Frame::Ping(f) => {
                let fl = if f.ack { flags::ACK } else { 0 };
                put_frame(
                    buf,
                    FrameType::Ping as u8,
                    fl,
                    StreamId::CONNECTION,
                    &[&f.data],
                );
            }
            Frame::GoAway(f) => {
                put_frame(
                    buf,
                    FrameType::GoAway as u8,
                    0,
                    StreamId::CONNECTION,
                    &[
                        &f.last_stream_id.value().to_be_bytes(),
                        &f.error_code.to_be_bytes(),
                        &f.debug_data,
                    ],
                );
            }
            Frame::WindowUpdate(f) => {
                put_frame(
                    buf,
                    FrameType::WindowUpdate as u8,
                    0,
                    f.stream_id,
                    &[&(f.increment & 0x7FFF_FFFF).to_be_bytes()],
                );
            }
            Frame::Continuation(f) => {
                let fl = if f.end_headers { flags::END_HEADERS } else { 0 };
                put_frame(
                    buf,
                    FrameType::Continuation as u8,
                    fl,
                    f.stream_id,
                    &[&f.header_block],
                );
            }
            Frame::Unknown(f) => {
                put_frame(buf, f.frame_type, f.flags, f.stream_id, &[&f.payload]);
            }
        }
    }

    fn encode_headers(&self, frame: &HeadersFrame, buf: &mut BytesMut) {
        let mut fl = 0u8;
        if frame.end_stream {
            fl |= flags::END_STREAM;
        }
        if frame.end_headers {
            fl |= flags::END_HEADERS;
        }
        match &frame.priority {
            Some(priority) => {
                let mut p = [0u8; 5];
                write_priority(priority, &mut p);
                put_frame(
                    buf,
                    FrameType::Headers as u8,
                    fl | flags::PRIORITY,
                    frame.stream_id,
                    &[&p, &frame.header_block],
                );
            }
            None => put_frame(
                buf,
                FrameType::Headers as u8,
                fl,
                frame.stream_id,
                &[&frame.header_block],
            ),
        }
    }

    /// Write a complete HPACK block as one HEADERS frame followed by as many
    /// CONTINUATION frames as `max_frame_size` requires.
    ///
    /// END_HEADERS is set only on the last fragment; END_STREAM (if
    /// requested) is carried by the HEADERS frame. Returns the number of
    /// frames written.
    pub fn encode_header_block(
        &self,
        stream_id: StreamId,
        block: Bytes,
        end_stream: bool,
        buf: &mut BytesMut,
    ) -> usize {
        let max = self.max_frame_size.max(1) as usize;
        let mut rest = block;
        let first = rest.split_to(rest.len().min(max));

        self.encode_headers(
            &HeadersFrame {
                stream_id,
                end_stream,
                end_headers: rest.is_empty(),
                priority: None,
                header_block: first,
            },
            buf,
        );

        let mut frames = 1;
        while !rest.is_empty() {
            let fragment = rest.split_to(rest.len().min(max));
            self.encode(
                &Frame::Continuation(ContinuationFrame {
                    stream_id,
                    end_headers: rest.is_empty(),
                    header_block: fragment,
                }),
                buf,
            );
            frames += 1;
        }
        frames
    }

    pub fn encode_settings_ack(&self, buf: &mut BytesMut) {
        self.encode(&Frame::Settings(SettingsFrame::ack()), buf);
    }

    pub fn encode_ping_ack(&self, data: [u8; 8], buf: &mut BytesMut) {
        self.encode(&Frame::Ping(PingFrame { ack: true, data }), buf);
    }

    pub fn write_window_update(&self, stream_id: StreamId, increment: u32, buf: &mut BytesMut) {
        self.encode(
            &Frame::WindowUpdate(WindowUpdateFrame {
                stream_id,
                increment,
            }),
            buf,
        );
    }

    pub fn write_rst_stream(&self, stream_id: StreamId, error_code: u32, buf: &mut BytesMut) {
        self.encode(
            &Frame::RstStream(RstStreamFrame {
                stream_id,
                error_code,
            }),
            buf,
        );
    }

    pub fn write_goaway(
        &self,
        last_stream_id: StreamId,
        error_code: u32,
        debug_data: &[u8],
        buf: &mut BytesMut,
    ) {
        self.encode(
            &Frame::GoAway(GoAwayFrame {
                last_stream_id,
                error_code,
                debug_data: Bytes::copy_from_slice(debug_data),
            }),
            buf,
        );
    }
}

fn write_priority(priority: &Priority, out: &mut [u8; 5]) {
    let mut dep = priority.dependency.value();
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    out[..4].copy_from_slice(&dep.to_be_bytes());
    out[4] = priority.weight;
}

/// Header plus payload parts, written with a single reservation.
fn put_frame(buf: &mut BytesMut, frame_type: u8, flags: u8, stream_id: StreamId, parts: &[&[u8]]) {
    let length: usize = parts.iter().map(|p| p.len()).sum();
    buf.reserve(FRAME_HEADER_SIZE + length);
    FrameHeader {
        length: length as u32,
        frame_type,
        flags,
        stream_id,
    }
    .write(buf);
    for part in parts {
        buf.extend_from_slice(part);
    }
}

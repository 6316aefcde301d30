//! Reassembly of header blocks split across CONTINUATION frames.
//!
//! HEADERS and PUSH_PROMISE frames without END_HEADERS must be followed
//! immediately by CONTINUATION frames on the same stream until one carries
//! END_HEADERS (RFC 7540 Section 6.10). Any other frame in between is a
//! connection error.

use bytes::{Bytes, BytesMut};

use super::error::FrameError;
use super::types::*;

/// Default cap on a reassembled header block.
pub const DEFAULT_MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// What the caller should do after feeding a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// The frame is not part of a header block; handle it normally.
    Pass(Frame),
    /// A header block is being assembled; keep reading frames.
    NeedMore,
    /// A complete header block is ready for HPACK decoding.
    Deliver(AssembledHeaders),
    /// Protocol violation. The connection must be closed.
    Error(FrameError),
}

/// Which frame started the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Headers,
    PushPromise { promised_stream_id: StreamId },
}

/// A complete, still HPACK-encoded header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledHeaders {
    pub stream_id: StreamId,
    pub kind: BlockKind,
    pub end_stream: bool,
    pub priority: Option<Priority>,
    pub block: Bytes,
}

#[derive(Debug)]
struct Pending {
    stream_id: StreamId,
    kind: BlockKind,
    end_stream: bool,
    priority: Option<Priority>,
    buf: BytesMut,
}

impl Pending {
    fn finish(self) -> AssembledHeaders {
        AssembledHeaders {
            stream_id: self.stream_id,
            kind: self.kind,
            end_stream: self.end_stream,
            priority: self.priority,
            block: self.buf.freeze(),
        }
    }
}

/// Finite-state reassembler fed one decoded frame at a time.
#[derive(Debug)]
pub struct HeaderBlockAssembler {
    pending: Option<Pending>,
    max_block_size: usize,
}

impl Default for HeaderBlockAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BLOCK_SIZE)
    }
}

impl HeaderBlockAssembler {
    pub fn new(max_block_size: usize) -> Self {
        Self {
            pending: None,
            max_block_size,
        }
    }

    /// Returns true while waiting for CONTINUATION frames.
    pub fn is_assembling(&self) -> bool {
        self.pending.is_some()
    }

    pub fn feed(&mut self, frame: Frame) -> Action {
        if let Some(mut pending) = self.pending.take() {
            let cont = match frame {
                Frame::Continuation(cont) => cont,
                other => {
                    return Action::Error(FrameError::ContinuationExpected {
                        expected: pending.stream_id.value(),
                        actual: other.stream_id().value(),
                        frame_type: other.type_byte(),
                    });
                }
            };
            if cont.stream_id != pending.stream_id {
                return Action::Error(FrameError::ContinuationExpected {
                    expected: pending.stream_id.value(),
                    actual: cont.stream_id.value(),
                    frame_type: FrameType::Continuation as u8,
                });
            }
            if let Err(e) = self.check_size(pending.buf.len() + cont.header_block.len()) {
                return Action::Error(e);
            }
            pending.buf.extend_from_slice(&cont.header_block);
            if cont.end_headers {
                return Action::Deliver(pending.finish());
            }
            self.pending = Some(pending);
            return Action::NeedMore;
        }

        let (pending, end_headers) = match frame {
            Frame::Headers(h) => (
                Pending {
                    stream_id: h.stream_id,
                    kind: BlockKind::Headers,
                    end_stream: h.end_stream,
                    priority: h.priority,
                    buf: BytesMut::from(&h.header_block[..]),
                },
                h.end_headers,
            ),
            Frame::PushPromise(p) => (
                Pending {
                    stream_id: p.stream_id,
                    kind: BlockKind::PushPromise {
                        promised_stream_id: p.promised_stream_id,
                    },
                    end_stream: false,
                    priority: None,
                    buf: BytesMut::from(&p.header_block[..]),
                },
                p.end_headers,
            ),
            Frame::Continuation(c) => {
                return Action::Error(FrameError::UnexpectedContinuation(c.stream_id.value()));
            }
            other => return Action::Pass(other),
        };

        if let Err(e) = self.check_size(pending.buf.len()) {
            return Action::Error(e);
        }
        if end_headers {
            Action::Deliver(pending.finish())
        } else {
            self.pending = Some(pending);
            Action::NeedMore
        }
    }

    fn check_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.max_block_size {
            Err(FrameError::HeaderBlockTooLarge {
                size,
                max: self.max_block_size,
            })
        } else {
            Ok(())
        }
    }
}

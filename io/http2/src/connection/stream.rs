//! HTTP/2 stream state tracking and request validation.

use bytes::Bytes;
use parking_lot::Mutex;
use protocol_headers::{HeaderBlock, HeaderLine};

use super::H2Error;
use crate::flow::{IncomingWindow, OutgoingWindow};
use crate::frame::ErrorCode;
use crate::hpack::HeaderField;

pub use crate::frame::StreamId;

/// Stream state (RFC 7540 Section 5.1), without the push states a server
/// never enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// We have sent END_STREAM.
    HalfClosedLocal,
    /// The peer has sent END_STREAM.
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub fn can_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_recv(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    fn send_end_stream(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    fn recv_end_stream(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }
}

/// The part of a stream shared between the connection reader and the worker
/// writing its response.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: Mutex<StreamState>,
    outgoing: OutgoingWindow,
}

impl Stream {
    pub fn new(id: StreamId, initial_window_size: u32) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState::Open),
            outgoing: OutgoingWindow::new(initial_window_size),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Send-side credit for this stream.
    pub fn outgoing(&self) -> &OutgoingWindow {
        &self.outgoing
    }

    /// Record that we sent END_STREAM. Returns the new state.
    pub fn send_end_stream(&self) -> StreamState {
        let mut state = self.state.lock();
        *state = state.send_end_stream();
        *state
    }

    /// Record that the peer sent END_STREAM. Returns the new state.
    pub fn recv_end_stream(&self) -> StreamState {
        let mut state = self.state.lock();
        *state = state.recv_end_stream();
        *state
    }

    /// Close both directions and fail any writer waiting for credit.
    pub fn reset(&self) {
        *self.state.lock() = StreamState::Closed;
        self.outgoing.close();
    }
}

/// Receive-side bookkeeping owned by the connection reader.
#[derive(Debug)]
pub(crate) struct RecvStream {
    pub incoming: IncomingWindow,
    /// Declared `content-length`, checked at END_STREAM.
    pub content_length: Option<u64>,
    pub received: u64,
}

impl RecvStream {
    pub fn new(initial_window_size: u32, content_length: Option<u64>) -> Self {
        Self {
            incoming: IncomingWindow::new(initial_window_size),
            content_length,
            received: 0,
        }
    }
}

/// A validated request head from a HEADERS block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub stream_id: StreamId,
    pub method: String,
    pub path: String,
    pub scheme: String,
    /// `:authority`, or `host` when the pseudo-header is absent.
    pub authority: Option<String>,
    /// Regular headers, pseudo-headers removed.
    pub headers: HeaderBlock,
    pub content_length: Option<u64>,
}

/// A complete request handed to a [`super::RequestHandler`].
#[derive(Debug, Clone)]
pub struct Request {
    pub head: RequestHead,
    pub body: Bytes,
    pub trailers: Option<HeaderBlock>,
}

fn malformed(id: StreamId, reason: impl Into<String>) -> H2Error {
    H2Error::stream(id, ErrorCode::ProtocolError, reason)
}

fn utf8(id: StreamId, name: &str, value: &Bytes) -> Result<String, H2Error> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| malformed(id, format!("{name} is not valid utf-8")))
}

/// Check a regular (non-pseudo) field and convert it to a header line.
fn regular_field(id: StreamId, field: &HeaderField) -> Result<HeaderLine, H2Error> {
    if field.name.iter().any(u8::is_ascii_uppercase) {
        return Err(malformed(id, "upper-case header name"));
    }
    let line = HeaderLine::from_bytes(field.name.clone(), field.value.clone())
        .map_err(|e| malformed(id, e.to_string()))?;
    if line.name_eq("connection") || line.name_eq("transfer-encoding") {
        return Err(malformed(
            id,
            format!("connection-specific header {}", line.name_str()),
        ));
    }
    if line.name_eq("te") && !line.value().eq_ignore_ascii_case(b"trailers") {
        return Err(malformed(id, "te other than trailers"));
    }
    Ok(line)
}

/// Parse and reconcile every `content-length` in a block.
fn content_length(id: StreamId, headers: &HeaderBlock) -> Result<Option<u64>, H2Error> {
    let mut length = None;
    for value in headers.get_all("content-length") {
        let parsed = std::str::from_utf8(value)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| malformed(id, "invalid content-length"))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(malformed(id, "conflicting content-length values"));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

/// Validate a request header block.
///
/// Every failure is a stream-level PROTOCOL_ERROR: the block has already
/// been HPACK-decoded, so the connection stays usable.
pub fn validate_request(id: StreamId, fields: Vec<HeaderField>) -> Result<RequestHead, H2Error> {
    let mut method = None;
    let mut path = None;
    let mut scheme = None;
    let mut authority = None;
    let mut headers = HeaderBlock::with_capacity(fields.len());

    for field in &fields {
        if field.name.first() == Some(&b':') {
            if !headers.is_empty() {
                return Err(malformed(id, "pseudo-header after regular header"));
            }
            let slot = match &field.name[..] {
                b":method" => &mut method,
                b":path" => &mut path,
                b":scheme" => &mut scheme,
                b":authority" => &mut authority,
                other => {
                    return Err(malformed(
                        id,
                        format!("unknown pseudo-header {}", String::from_utf8_lossy(other)),
                    ));
                }
            };
            if slot.is_some() {
                return Err(malformed(
                    id,
                    format!("duplicate {}", String::from_utf8_lossy(&field.name)),
                ));
            }
            *slot = Some(&field.value);
        } else {
            headers.add(regular_field(id, field)?);
        }
    }

    let (Some(method), Some(path), Some(scheme)) = (method, path, scheme) else {
        return Err(malformed(id, "missing :method, :path or :scheme"));
    };
    if path.is_empty() {
        return Err(malformed(id, "empty :path"));
    }

    let authority = match authority {
        Some(value) => Some(utf8(id, ":authority", value)?),
        None => headers.get_str("host").map(str::to_owned),
    };
    let content_length = content_length(id, &headers)?;

    Ok(RequestHead {
        stream_id: id,
        method: utf8(id, ":method", method)?,
        path: utf8(id, ":path", path)?,
        scheme: utf8(id, ":scheme", scheme)?,
        authority,
        headers,
        content_length,
    })
}

/// Validate a trailer block: regular fields only.
pub fn validate_trailers(id: StreamId, fields: Vec<HeaderField>) -> Result<HeaderBlock, H2Error> {
    fields
        .iter()
        .map(|field| {
            if field.name.first() == Some(&b':') {
                Err(malformed(id, "pseudo-header in trailers"))
            } else {
                regular_field(id, field)
            }
        })
        .collect()
}

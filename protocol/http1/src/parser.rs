//! The parser state machine.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use protocol_headers::{HeaderBlock, HeaderLine, is_tchar};
use tracing::{debug, trace};

use crate::error::ParseError;
use crate::message::{BodyLength, Method, ParseEvent, RequestHead, ResponseHead, Version};

const SP: u8 = b' ';
const HTAB: u8 = b'\t';
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Limits applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserConfig {
    /// Total bytes of header lines before the request is flagged for 431.
    pub max_headers_length: usize,
    /// Request-target length before the request is flagged for 414.
    pub max_url_length: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_headers_length: 8192,
            max_url_length: 8192,
        }
    }
}

impl ParserConfig {
    /// Bound on the scratch buffer for any single token or line.
    pub fn max_buffer_size(&self) -> usize {
        self.max_headers_length.max(self.max_url_length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Position within the message being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    RequestStart,
    Method,
    RequestTarget,
    HttpVersion,
    RequestLineEnding,
    ResponseStart,
    StatusCode,
    ReasonPhrase,
    StatusLineEnding,
    HeaderStart,
    HeaderName,
    HeaderNameEnded,
    HeaderValue,
    HeaderValueEnding,
    HeadersEnding,
    FixedBody,
    UnspecifiedBody,
    ChunkStart,
    ChunkSize,
    ChunkExtensions,
    ChunkHeaderEnding,
    ChunkData,
    ChunkDataRead,
    ChunkDataEnding,
    LastChunk,
    /// The message is complete; the next call reports end of body.
    MessageEnd,
    /// Pass-through after a protocol upgrade.
    Websocket,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::RequestStart => "request_start",
            State::Method => "method",
            State::RequestTarget => "request_target",
            State::HttpVersion => "http_version",
            State::RequestLineEnding => "request_line_ending",
            State::ResponseStart => "response_start",
            State::StatusCode => "status_code",
            State::ReasonPhrase => "reason_phrase",
            State::StatusLineEnding => "status_line_ending",
            State::HeaderStart => "header_start",
            State::HeaderName => "header_name",
            State::HeaderNameEnded => "header_name_ended",
            State::HeaderValue => "header_value",
            State::HeaderValueEnding => "header_value_ending",
            State::HeadersEnding => "headers_ending",
            State::FixedBody => "fixed_body",
            State::UnspecifiedBody => "unspecified_body",
            State::ChunkStart => "chunk_start",
            State::ChunkSize => "chunk_size",
            State::ChunkExtensions => "chunk_extensions",
            State::ChunkHeaderEnding => "chunk_header_ending",
            State::ChunkData => "chunk_data",
            State::ChunkDataRead => "chunk_data_read",
            State::ChunkDataEnding => "chunk_data_ending",
            State::LastChunk => "last_chunk",
            State::MessageEnd => "message_end",
            State::Websocket => "websocket",
        }
    }

    /// States that hand body bytes straight through.
    fn is_body(self) -> bool {
        matches!(
            self,
            State::FixedBody | State::UnspecifiedBody | State::ChunkData | State::Websocket
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_vchar(b: u8) -> bool {
    (0x21..=0x7e).contains(&b)
}

fn is_ows(b: u8) -> bool {
    b == SP || b == HTAB
}

/// Field value bytes: visible characters, whitespace and obs-text.
fn is_field_char(b: u8) -> bool {
    is_vchar(b) || is_ows(b) || b >= 0x80
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes
        && is_ows(*first)
    {
        bytes = rest;
    }
    while let [rest @ .., last] = bytes
        && is_ows(*last)
    {
        bytes = rest;
    }
    bytes
}

fn hex_value(b: u8) -> Option<u64> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u64),
        b'a'..=b'f' => Some((b - b'a' + 10) as u64),
        b'A'..=b'F' => Some((b - b'A' + 10) as u64),
        _ => None,
    }
}

/// The head under construction.
#[derive(Debug)]
struct Partial {
    method: Method,
    target: String,
    version: Version,
    status: u16,
    reason: String,
    rejection: Option<u16>,
    target_too_long: bool,
}

impl Default for Partial {
    fn default() -> Self {
        Self {
            method: Method::Get,
            target: String::new(),
            version: Version::Http11,
            status: 0,
            reason: String::new(),
            rejection: None,
            target_too_long: false,
        }
    }
}

/// Incremental HTTP/1.1 parser for one direction of one connection.
#[derive(Debug)]
pub struct Http1Parser {
    kind: MessageKind,
    config: ParserConfig,
    state: State,
    scratch: Vec<u8>,
    header_name: Vec<u8>,
    /// Header bytes seen in the current block.
    headers_len: usize,
    fields: HeaderBlock,
    in_trailers: bool,
    trailers: Option<HeaderBlock>,
    partial: Partial,
    /// Bytes left in the fixed body or the current chunk.
    remaining: u64,
    upgrade_after_message: bool,
    /// Methods of requests whose responses have not been parsed yet.
    requests: VecDeque<Method>,
}

impl Http1Parser {
    pub fn new(kind: MessageKind, config: ParserConfig) -> Self {
        let state = match kind {
            MessageKind::Request => State::RequestStart,
            MessageKind::Response => State::ResponseStart,
        };
        Self {
            kind,
            config,
            state,
            scratch: Vec::new(),
            header_name: Vec::new(),
            headers_len: 0,
            fields: HeaderBlock::new(),
            in_trailers: false,
            trailers: None,
            partial: Partial::default(),
            remaining: 0,
            upgrade_after_message: false,
            requests: VecDeque::new(),
        }
    }

    /// A request parser with default limits.
    pub fn request() -> Self {
        Self::new(MessageKind::Request, ParserConfig::default())
    }

    /// A response parser with default limits.
    pub fn response() -> Self {
        Self::new(MessageKind::Response, ParserConfig::default())
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// True between messages, when closing the stream loses nothing.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::RequestStart | State::ResponseStart) && self.scratch.is_empty()
    }

    /// For response parsing: record the method of a request sent on this
    /// connection, so the matching response body can be delimited. Without
    /// one, a response is treated as answering GET.
    pub fn expect_response(&mut self, method: Method) {
        self.requests.push_back(method);
    }

    /// Ready the parser for the next message. Called automatically after
    /// each end of body.
    pub fn reset(&mut self) {
        self.state = match self.kind {
            MessageKind::Request => State::RequestStart,
            MessageKind::Response => State::ResponseStart,
        };
        self.scratch.clear();
        self.header_name.clear();
        self.headers_len = 0;
        self.fields = HeaderBlock::new();
        self.in_trailers = false;
        self.trailers = None;
        self.partial = Partial::default();
        self.remaining = 0;
        self.upgrade_after_message = false;
    }

    /// Consume bytes from the front of `buf` and return the next event, or
    /// `Ok(None)` once `buf` is exhausted without completing one.
    pub fn offer(&mut self, buf: &mut BytesMut) -> Result<Option<ParseEvent>, ParseError> {
        loop {
            if self.state == State::MessageEnd {
                return Ok(Some(self.end_message()));
            }
            if self.state.is_body() {
                return Ok(self.body_chunk(buf));
            }

            let mut consumed = 0;
            let mut event = None;
            for &b in buf.iter() {
                consumed += 1;
                event = self.step(b)?;
                if event.is_some() || self.state.is_body() || self.state == State::MessageEnd {
                    break;
                }
            }
            buf.advance(consumed);

            if event.is_some() {
                return Ok(event);
            }
            if buf.is_empty() && !self.state.is_body() && self.state != State::MessageEnd {
                return Ok(None);
            }
        }
    }

    /// The peer closed the stream.
    pub fn eof(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        match self.state {
            State::UnspecifiedBody | State::MessageEnd => Ok(Some(self.end_message())),
            State::Websocket => Ok(None),
            _ if self.is_idle() => Ok(None),
            state => Err(ParseError::UnexpectedEof {
                state: state.as_str(),
            }),
        }
    }

    fn body_chunk(&mut self, buf: &mut BytesMut) -> Option<ParseEvent> {
        if buf.is_empty() {
            return None;
        }
        let n = match self.state {
            State::UnspecifiedBody | State::Websocket => buf.len(),
            _ => (buf.len() as u64).min(self.remaining) as usize,
        };
        let data = buf.split_to(n).freeze();
        match self.state {
            State::FixedBody => {
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.state = State::MessageEnd;
                }
            }
            State::ChunkData => {
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.state = State::ChunkDataRead;
                }
            }
            _ => {}
        }
        Some(ParseEvent::Body(data))
    }

    fn end_message(&mut self) -> ParseEvent {
        let trailers = self.trailers.take();
        let upgrade = self.upgrade_after_message;
        self.reset();
        if upgrade {
            debug!("switching to pass-through after upgrade");
            self.state = State::Websocket;
        }
        ParseEvent::EndOfBody { trailers }
    }

    fn invalid(&self, byte: u8) -> ParseError {
        ParseError::Invalid {
            byte,
            state: self.state.as_str(),
        }
    }

    fn append(&mut self, b: u8) -> Result<(), ParseError> {
        let limit = self.config.max_buffer_size();
        if self.scratch.len() >= limit {
            return Err(ParseError::TooLarge {
                state: self.state.as_str(),
                limit,
            });
        }
        self.scratch.push(b);
        Ok(())
    }

    fn take_scratch(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.scratch).into_owned();
        self.scratch.clear();
        s
    }

    fn reject(&mut self, status: u16) {
        if self.kind == MessageKind::Request && self.partial.rejection.is_none() {
            debug!(status, "request will be rejected");
            self.partial.rejection = Some(status);
        }
    }

    /// Count a header byte against the limit. Past it, nothing more is
    /// stored and the request is flagged for 431.
    fn count_header_byte(&mut self) -> bool {
        self.headers_len += 1;
        if self.headers_len <= self.config.max_headers_length {
            return true;
        }
        if !self.in_trailers {
            self.reject(431);
        }
        false
    }

    fn step(&mut self, b: u8) -> Result<Option<ParseEvent>, ParseError> {
        match self.state {
            State::RequestStart => {
                if !b.is_ascii_uppercase() {
                    return Err(self.invalid(b));
                }
                self.append(b)?;
                self.state = State::Method;
            }

            State::Method => {
                if b.is_ascii_uppercase() {
                    self.append(b)?;
                } else if b == SP {
                    let method = Method::from_bytes(&self.scratch);
                    self.scratch.clear();
                    if !method.is_known() {
                        self.reject(405);
                    }
                    self.partial.method = method;
                    self.state = State::RequestTarget;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::RequestTarget => {
                if is_vchar(b) {
                    if self.partial.target_too_long {
                        // keep consuming, the placeholder stays
                    } else if self.scratch.len() < self.config.max_url_length {
                        self.append(b)?;
                    } else {
                        self.scratch.clear();
                        self.scratch.push(b'/');
                        self.partial.target_too_long = true;
                        self.reject(414);
                    }
                } else if b == SP {
                    self.partial.target = self.take_scratch();
                    self.state = State::HttpVersion;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::HttpVersion => {
                if b == CR {
                    self.state = State::RequestLineEnding;
                } else if is_vchar(b) {
                    self.append(b)?;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::RequestLineEnding => {
                if b != LF {
                    return Err(self.invalid(b));
                }
                match Version::from_bytes(&self.scratch) {
                    Some(version) => self.partial.version = version,
                    None => {
                        trace!(version = %String::from_utf8_lossy(&self.scratch), "unsupported version");
                        self.reject(505);
                    }
                }
                self.scratch.clear();
                self.state = State::HeaderStart;
            }

            State::ResponseStart => {
                if b == SP {
                    let version = Version::from_bytes(&self.scratch)
                        .ok_or_else(|| ParseError::UnsupportedVersion(self.take_scratch()))?;
                    self.scratch.clear();
                    self.partial.version = version;
                    self.state = State::StatusCode;
                } else if is_vchar(b) {
                    self.append(b)?;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::StatusCode => {
                if b.is_ascii_digit() {
                    if self.scratch.len() == 3 {
                        return Err(ParseError::StatusTooLong);
                    }
                    self.append(b)?;
                } else if (b == SP || b == CR) && !self.scratch.is_empty() {
                    self.partial.status = self
                        .scratch
                        .iter()
                        .fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
                    self.scratch.clear();
                    self.state = if b == SP {
                        State::ReasonPhrase
                    } else {
                        State::StatusLineEnding
                    };
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::ReasonPhrase => {
                if b == CR {
                    self.state = State::StatusLineEnding;
                } else if is_field_char(b) {
                    self.append(b)?;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::StatusLineEnding => {
                if b != LF {
                    return Err(self.invalid(b));
                }
                self.partial.reason = self.take_scratch();
                self.state = State::HeaderStart;
            }

            State::HeaderStart => {
                if b == CR {
                    self.state = State::HeadersEnding;
                } else if is_tchar(b) {
                    if self.count_header_byte() {
                        self.append(b.to_ascii_lowercase())?;
                    }
                    self.state = State::HeaderName;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::HeaderName => {
                let keep = self.count_header_byte();
                if is_tchar(b) {
                    if keep {
                        self.append(b.to_ascii_lowercase())?;
                    }
                } else if b == b':' {
                    self.header_name = std::mem::take(&mut self.scratch);
                    self.state = State::HeaderNameEnded;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::HeaderNameEnded => {
                let keep = self.count_header_byte();
                if is_ows(b) {
                    // leading whitespace
                } else if b == CR {
                    self.state = State::HeaderValueEnding;
                } else if is_field_char(b) {
                    if keep {
                        self.append(b)?;
                    }
                    self.state = State::HeaderValue;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::HeaderValue => {
                let keep = self.count_header_byte();
                if b == CR {
                    self.state = State::HeaderValueEnding;
                } else if is_field_char(b) {
                    if keep {
                        self.append(b)?;
                    }
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::HeaderValueEnding => {
                if b != LF {
                    return Err(self.invalid(b));
                }
                let keep = self.count_header_byte();
                let value = trim_ows(&self.scratch);
                if keep && !self.header_name.is_empty() && !value.is_empty() {
                    let line = HeaderLine::new(&self.header_name, value)?;
                    self.fields.add(line);
                }
                self.scratch.clear();
                self.header_name.clear();
                self.state = State::HeaderStart;
            }

            State::HeadersEnding => {
                if b != LF {
                    return Err(self.invalid(b));
                }
                if self.in_trailers {
                    let trailers = std::mem::take(&mut self.fields);
                    self.trailers = (!trailers.is_empty()).then_some(trailers);
                    self.state = State::MessageEnd;
                    return Ok(None);
                }
                return self.finish_head().map(Some);
            }

            State::ChunkStart => {
                let Some(digit) = hex_value(b) else {
                    return Err(self.invalid(b));
                };
                self.remaining = digit;
                self.state = State::ChunkSize;
            }

            State::ChunkSize => {
                if let Some(digit) = hex_value(b) {
                    self.remaining = self
                        .remaining
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(digit))
                        .ok_or(ParseError::ChunkSizeOverflow)?;
                } else if b == b';' {
                    self.state = State::ChunkExtensions;
                } else if b == CR {
                    self.state = State::ChunkHeaderEnding;
                } else {
                    return Err(self.invalid(b));
                }
            }

            State::ChunkExtensions => {
                if b == CR {
                    self.state = State::ChunkHeaderEnding;
                } else if !is_field_char(b) {
                    return Err(self.invalid(b));
                }
            }

            State::ChunkHeaderEnding => {
                if b != LF {
                    return Err(self.invalid(b));
                }
                self.state = if self.remaining == 0 {
                    State::LastChunk
                } else {
                    State::ChunkData
                };
            }

            State::ChunkDataRead => {
                if b != CR {
                    return Err(self.invalid(b));
                }
                self.state = State::ChunkDataEnding;
            }

            State::ChunkDataEnding => {
                if b != LF {
                    return Err(self.invalid(b));
                }
                self.state = State::ChunkStart;
            }

            State::LastChunk => {
                // trailers reuse the header states
                self.in_trailers = true;
                self.headers_len = 0;
                self.fields = HeaderBlock::new();
                if b == CR {
                    self.state = State::HeadersEnding;
                } else if is_tchar(b) {
                    self.count_header_byte();
                    self.append(b.to_ascii_lowercase())?;
                    self.state = State::HeaderName;
                } else {
                    return Err(self.invalid(b));
                }
            }

            // handled in offer
            State::FixedBody
            | State::UnspecifiedBody
            | State::ChunkData
            | State::Websocket
            | State::MessageEnd => {}
        }
        Ok(None)
    }

    fn finish_head(&mut self) -> Result<ParseEvent, ParseError> {
        let headers = std::mem::take(&mut self.fields);
        let partial = std::mem::take(&mut self.partial);
        let event = match self.kind {
            MessageKind::Request => {
                let body = request_body_length(&headers)?;
                let head = RequestHead {
                    method: partial.method,
                    target: partial.target,
                    version: partial.version,
                    headers,
                    body,
                    rejection: partial.rejection,
                };
                self.upgrade_after_message = head.is_websocket_upgrade();
                trace!(
                    method = %head.method,
                    target = %head.target,
                    rejection = ?head.rejection,
                    "request head parsed"
                );
                self.enter_body(body);
                ParseEvent::Request(head)
            }
            MessageKind::Response => {
                let status = partial.status;
                // interim responses do not consume the request
                let method = if status >= 200 || status == 101 {
                    self.requests.pop_front().unwrap_or(Method::Get)
                } else {
                    Method::Get
                };
                let body = response_body_length(status, &method, &headers)?;
                self.upgrade_after_message =
                    status == 101 && headers.contains_value("upgrade", "websocket");
                trace!(status, "response head parsed");
                self.enter_body(body);
                ParseEvent::Response(ResponseHead {
                    version: partial.version,
                    status,
                    reason: partial.reason,
                    headers,
                    body,
                })
            }
        };
        Ok(event)
    }

    fn enter_body(&mut self, body: BodyLength) {
        self.state = match body {
            BodyLength::None => State::MessageEnd,
            BodyLength::Fixed(len) => {
                self.remaining = len;
                State::FixedBody
            }
            BodyLength::Chunked => State::ChunkStart,
            BodyLength::Unspecified => State::UnspecifiedBody,
        };
    }
}

fn is_chunked(headers: &HeaderBlock) -> bool {
    headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(|&b| b == b','))
        .map(trim_ows)
        .filter(|v| !v.is_empty())
        .last()
        .is_some_and(|last| last.eq_ignore_ascii_case(b"chunked"))
}

fn content_length(headers: &HeaderBlock) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.get_all("content-length") {
        let parsed = std::str::from_utf8(value)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(ParseError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => return Err(ParseError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

fn fixed_or_none(len: u64) -> BodyLength {
    if len == 0 {
        BodyLength::None
    } else {
        BodyLength::Fixed(len)
    }
}

fn request_body_length(headers: &HeaderBlock) -> Result<BodyLength, ParseError> {
    let chunked = is_chunked(headers);
    let length = content_length(headers)?;
    match (chunked, length) {
        (true, Some(_)) => Err(ParseError::ConflictingLength),
        (true, None) => Ok(BodyLength::Chunked),
        (false, Some(len)) => Ok(fixed_or_none(len)),
        (false, None) => Ok(BodyLength::None),
    }
}

fn response_body_length(
    status: u16,
    method: &Method,
    headers: &HeaderBlock,
) -> Result<BodyLength, ParseError> {
    if status / 100 == 1 || status == 204 || status == 304 || *method == Method::Head {
        return Ok(BodyLength::None);
    }
    if *method == Method::Connect && status / 100 == 2 {
        return Ok(BodyLength::Unspecified);
    }
    let chunked = is_chunked(headers);
    let length = content_length(headers)?;
    match (chunked, length) {
        (true, Some(_)) => Err(ParseError::ConflictingLength),
        (true, None) => Ok(BodyLength::Chunked),
        (false, Some(len)) => Ok(fixed_or_none(len)),
        (false, None) => Ok(BodyLength::Unspecified),
    }
}

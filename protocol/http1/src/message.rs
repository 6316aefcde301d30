use std::fmt;

use bytes::Bytes;
use protocol_headers::HeaderBlock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
    /// An upper-case token that is not a supported method. The request is
    /// flagged for 405.
    Other(String),
}

impl Method {
    /// Parse an upper-case method token.
    pub fn from_bytes(token: &[u8]) -> Method {
        match token {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"HEAD" => Method::Head,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"OPTIONS" => Method::Options,
            b"PATCH" => Method::Patch,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            other => Method::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Other(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Method::Other(_))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_bytes(token: &[u8]) -> Option<Version> {
        match token {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    None,
    Fixed(u64),
    Chunked,
    /// Everything until the peer closes the stream.
    Unspecified,
}

impl BodyLength {
    pub fn has_body(self) -> bool {
        !matches!(self, BodyLength::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Replaced by `/` when the request is flagged for 414.
    pub target: String,
    pub version: Version,
    /// Names lowercased, values trimmed, empty values dropped.
    pub headers: HeaderBlock,
    pub body: BodyLength,
    /// Status the request must be answered with (405, 414, 431 or 505)
    /// instead of being dispatched.
    pub rejection: Option<u16>,
}

impl RequestHead {
    /// True if the client asked to keep the connection open after this
    /// exchange.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.contains_value("connection", "close"),
            Version::Http10 => self.headers.contains_value("connection", "keep-alive"),
        }
    }

    /// A WebSocket upgrade request.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.contains_value("upgrade", "websocket")
            && self.headers.contains_value("connection", "upgrade")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderBlock,
    pub body: BodyLength,
}

impl ResponseHead {
    pub fn is_informational(&self) -> bool {
        self.status / 100 == 1
    }
}

/// One step of a parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Request(RequestHead),
    Response(ResponseHead),
    /// Body bytes, de-chunked. After a protocol upgrade every later byte is
    /// delivered this way.
    Body(Bytes),
    EndOfBody { trailers: Option<HeaderBlock> },
}

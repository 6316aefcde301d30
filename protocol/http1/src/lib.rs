//! Incremental HTTP/1.1 message parser.
//!
//! [`Http1Parser`] consumes bytes as they arrive and yields one
//! [`ParseEvent`] at a time: a message head, body chunks, then end of body.
//! It never needs the whole message in memory; body bytes are split off the
//! input buffer without copying, and the scratch space used for the request
//! line and each header line is bounded by [`ParserConfig`].
//!
//! ```
//! use bytes::BytesMut;
//! use protocol_http1::{Http1Parser, ParseEvent};
//!
//! let mut parser = Http1Parser::request();
//! let mut buf = BytesMut::from(&b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n"[..]);
//! let Some(ParseEvent::Request(head)) = parser.offer(&mut buf).unwrap() else {
//!     panic!("expected a request head");
//! };
//! assert_eq!(head.target, "/index.html");
//! assert!(matches!(parser.offer(&mut buf).unwrap(), Some(ParseEvent::EndOfBody { .. })));
//! ```

mod error;
mod message;
mod parser;

pub use error::ParseError;
pub use message::{BodyLength, Method, ParseEvent, RequestHead, ResponseHead, Version};
pub use parser::{Http1Parser, MessageKind, ParserConfig, State};

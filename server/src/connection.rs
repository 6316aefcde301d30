//! Protocol detection and the per-connection entry point.
//!
//! A connection starts unclassified. Bytes are buffered until they either
//! match the HTTP/2 client preface or diverge from it, then the whole buffer
//! is handed to the matching driver.

use std::sync::Arc;

use bytes::BytesMut;
use http2::transport::is_timeout;
use http2::{ByteChannel, CONNECTION_PREFACE, ConnectionError, RequestHandler};
use protocol_http1::ParseError;
use tracing::{debug, trace};

use crate::config::Config;
use crate::h1::{self, Dispatcher};
use crate::h2;
use crate::metrics::{ActiveConnection, BYTES_RECEIVED};

/// Protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http/1.1: {0}")]
    Http1(#[from] ParseError),
    #[error("h2: {0}")]
    Http2(#[from] ConnectionError),
}

/// Classify a connection from its first bytes. `None` means the bytes so
/// far are a strict prefix of the HTTP/2 preface and more are needed.
pub fn detect(prefix: &[u8]) -> Option<Protocol> {
    let n = prefix.len().min(CONNECTION_PREFACE.len());
    if prefix[..n] != CONNECTION_PREFACE[..n] {
        return Some(Protocol::Http1);
    }
    if n == CONNECTION_PREFACE.len() {
        Some(Protocol::Http2)
    } else {
        None
    }
}

/// Read until the protocol is known. Returns `None` if the client went away
/// or idled first.
fn read_prefix(
    channel: &mut dyn ByteChannel,
    config: &Config,
) -> Result<Option<(Protocol, BytesMut)>, DriverError> {
    let mut buf = BytesMut::with_capacity(config.http1.read_buffer_size);
    let mut chunk = vec![0u8; config.http1.read_buffer_size];
    loop {
        if !buf.is_empty()
            && let Some(protocol) = detect(&buf)
        {
            return Ok(Some((protocol, buf)));
        }
        match channel.read(&mut chunk, config.timeouts.read()) {
            Ok(0) => return Ok(None),
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) if is_timeout(&e) => {
                debug!("no request before read timeout");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Serve one accepted connection to completion with the matching driver.
/// Returns the detected protocol, or `None` if no request arrived.
pub fn serve(
    mut channel: Box<dyn ByteChannel>,
    config: &Config,
    dispatcher: &dyn Dispatcher,
    handler: Arc<dyn RequestHandler>,
) -> Result<Option<Protocol>, DriverError> {
    let _active = ActiveConnection::new();

    let Some((protocol, buf)) = read_prefix(channel.as_mut(), config)? else {
        let _ = channel.shutdown();
        return Ok(None);
    };
    trace!(protocol = protocol.as_str(), "protocol detected");

    match protocol {
        Protocol::Http1 => h1::serve(channel.as_mut(), buf, config, dispatcher)?,
        Protocol::Http2 => h2::serve(channel, &buf, config, handler)?,
    }
    Ok(Some(protocol))
}

//! Blocking HTTP/1.1 connection driver.
//!
//! Reads from the channel into a buffer, runs it through [`Http1Parser`] and
//! answers each complete request in order. Requests the parser flagged for
//! rejection are answered without reaching the dispatcher; the connection
//! stays usable because the parser keeps framing intact.

use bytes::{BufMut, Bytes, BytesMut};
use http2::transport::{ByteChannel, is_timeout};
use protocol_headers::HeaderBlock;
use protocol_http1::{Http1Parser, MessageKind, Method, ParseEvent, RequestHead, State, Version};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::connection::DriverError;
use crate::metrics::{
    BODIES_TOO_LARGE, BYTES_RECEIVED, HTTP1_REJECTED, HTTP1_REQUESTS, PROTOCOL_ERRORS,
};

/// Application side of an HTTP/1.1 connection.
pub trait Dispatcher: Send + Sync + 'static {
    /// Answer one request. `body` holds the complete, de-chunked body.
    fn on_http1(&self, head: &RequestHead, body: Bytes) -> Response;
}

impl<F> Dispatcher for F
where
    F: Fn(&RequestHead, Bytes) -> Response + Send + Sync + 'static,
{
    fn on_http1(&self, head: &RequestHead, body: Bytes) -> Response {
        self(head, body)
    }
}

/// An HTTP/1.1 response to be serialized by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderBlock,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderBlock::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// The canned answer for a request the parser refused.
    pub fn rejection(status: u16) -> Self {
        Self::new(status).with_body(reason_phrase(status))
    }

    /// Responses to HEAD and these statuses never carry a body.
    fn allows_body(&self) -> bool {
        !(self.status / 100 == 1 || self.status == 204 || self.status == 304)
    }

    /// Serialize the status line, headers and body into `out`. Framing
    /// headers are computed here; any the caller set are replaced.
    pub fn encode(&self, version: Version, method: &Method, keep_alive: bool, out: &mut BytesMut) {
        out.reserve(128 + self.body.len());
        out.put_slice(version.as_str().as_bytes());
        out.put_slice(format!(" {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes());

        for line in self.headers.iter() {
            if line.name_eq("content-length")
                || line.name_eq("transfer-encoding")
                || line.name_eq("connection")
            {
                continue;
            }
            out.put_slice(line.name());
            out.put_slice(b": ");
            out.put_slice(line.value());
            out.put_slice(b"\r\n");
        }

        if self.allows_body() {
            out.put_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        if !keep_alive {
            out.put_slice(b"connection: close\r\n");
        } else if version == Version::Http10 {
            out.put_slice(b"connection: keep-alive\r\n");
        }
        out.put_slice(b"\r\n");

        if self.allows_body() && *method != Method::Head {
            out.put_slice(&self.body);
        }
    }
}

/// Standard reason phrase, or an empty string for unregistered codes.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// Drive one HTTP/1.1 connection until the client closes it, asks for
/// `connection: close`, idles past the read timeout or sends garbage.
/// `buf` holds bytes already read during protocol detection.
pub fn serve<C>(
    channel: &mut C,
    mut buf: BytesMut,
    config: &Config,
    dispatcher: &dyn Dispatcher,
) -> Result<(), DriverError>
where
    C: ByteChannel + ?Sized,
{
    let mut parser = Http1Parser::new(MessageKind::Request, config.parser_config());
    let mut read_buf = vec![0u8; config.http1.read_buffer_size];
    let mut current: Option<(RequestHead, BytesMut)> = None;
    let mut out = BytesMut::new();

    loop {
        loop {
            let event = match parser.offer(&mut buf) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    PROTOCOL_ERRORS.increment();
                    debug!(error = %e, "malformed request, closing connection");
                    out.clear();
                    Response::rejection(400).encode(
                        Version::Http11,
                        &Method::Get,
                        false,
                        &mut out,
                    );
                    channel.write_all(&out, config.timeouts.write())?;
                    let _ = channel.shutdown();
                    return Err(e.into());
                }
            };

            match event {
                ParseEvent::Request(head) => {
                    HTTP1_REQUESTS.increment();
                    trace!(method = %head.method, target = %head.target, "request");
                    current = Some((head, BytesMut::new()));
                }
                ParseEvent::Body(data) => {
                    let Some((head, body)) = current.as_mut() else {
                        continue;
                    };
                    // a rejected request is answered without its body
                    if head.rejection.is_some() {
                        continue;
                    }
                    if body.len() + data.len() > config.http1.max_request_body_size {
                        BODIES_TOO_LARGE.increment();
                        debug!(
                            limit = config.http1.max_request_body_size,
                            target = %head.target,
                            "request body too large, closing connection"
                        );
                        out.clear();
                        Response::rejection(413).encode(head.version, &head.method, false, &mut out);
                        channel.write_all(&out, config.timeouts.write())?;
                        let _ = channel.shutdown();
                        return Ok(());
                    }
                    body.extend_from_slice(&data);
                }
                ParseEvent::EndOfBody { .. } => {
                    let Some((head, body)) = current.take() else {
                        continue;
                    };
                    let response = match head.rejection {
                        Some(status) => {
                            HTTP1_REJECTED.increment();
                            debug!(status, target = %head.target, "rejecting request");
                            Response::rejection(status)
                        }
                        None => dispatcher.on_http1(&head, body.freeze()),
                    };
                    let keep_alive = head.keep_alive()
                        && !response.headers.contains_value("connection", "close")
                        && parser.state() != State::Websocket;

                    out.clear();
                    response.encode(head.version, &head.method, keep_alive, &mut out);
                    channel.write_all(&out, config.timeouts.write())?;

                    if !keep_alive {
                        trace!("closing connection after response");
                        let _ = channel.shutdown();
                        return Ok(());
                    }
                }
                ParseEvent::Response(_) => {}
            }
        }

        match channel.read(&mut read_buf, config.timeouts.read()) {
            Ok(0) => {
                if parser.is_idle() {
                    return Ok(());
                }
                return match parser.eof() {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        debug!(error = %e, "client closed mid-request");
                        Err(e.into())
                    }
                };
            }
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                buf.extend_from_slice(&read_buf[..n]);
            }
            Err(e) if is_timeout(&e) => {
                debug!(idle = parser.is_idle(), "read timed out, closing connection");
                let _ = channel.shutdown();
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "read failed");
                return Err(e.into());
            }
        }
    }
}

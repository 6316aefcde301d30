//! Blocking HTTP/2 connection driver.
//!
//! One reader thread owns the [`ServerConnection`]: it feeds socket bytes in,
//! buffers request bodies, and hands each complete request to the handler
//! on its own worker thread. Workers write through the connection's shared
//! write lock, so responses interleave at frame granularity.
//!
//! Receive credit is returned as body bytes are copied into a buffer capped
//! at `http2.max_request_body_size`; a stream whose body outgrows it is
//! answered with 413.

use std::sync::Arc;
use std::thread;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use protocol_headers::HeaderBlock;
use http2::transport::is_timeout;
use http2::{
    ByteChannel, ConnectionState, Request, RequestHandler, ServerConnection, ServerEvent, StreamId,
};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::connection::DriverError;
use crate::metrics::{
    BODIES_TOO_LARGE, BYTES_RECEIVED, HTTP2_STREAM_RESETS, HTTP2_STREAMS, PROTOCOL_ERRORS,
};

/// What a connection event meant for the request it belongs to.
#[derive(Debug)]
enum Progress {
    Waiting,
    Complete(Request),
    TooLarge(StreamId),
}

/// Requests whose body is still arriving.
struct Pending {
    requests: AHashMap<StreamId, (Request, BytesMut)>,
    max_body: usize,
}

impl Pending {
    fn new(max_body: usize) -> Self {
        Self {
            requests: AHashMap::new(),
            max_body,
        }
    }

    /// Fold one event into the pending set.
    fn on_event(&mut self, event: ServerEvent) -> Progress {
        match event {
            ServerEvent::Request { head, end_stream } => {
                let id = head.stream_id;
                let request = Request {
                    head,
                    body: Bytes::new(),
                    trailers: None,
                };
                if end_stream {
                    return Progress::Complete(request);
                }
                self.requests.insert(id, (request, BytesMut::new()));
                Progress::Waiting
            }
            ServerEvent::Data {
                stream_id,
                data,
                end_stream,
            } => {
                let Some((_, body)) = self.requests.get_mut(&stream_id) else {
                    return Progress::Waiting;
                };
                if body.len() + data.len() > self.max_body {
                    self.requests.remove(&stream_id);
                    return Progress::TooLarge(stream_id);
                }
                body.extend_from_slice(&data);
                if !end_stream {
                    return Progress::Waiting;
                }
                match self.requests.remove(&stream_id) {
                    Some((mut request, body)) => {
                        request.body = body.freeze();
                        Progress::Complete(request)
                    }
                    None => Progress::Waiting,
                }
            }
            ServerEvent::Trailers {
                stream_id,
                trailers,
            } => match self.requests.remove(&stream_id) {
                Some((mut request, body)) => {
                    request.body = body.freeze();
                    request.trailers = Some(trailers);
                    Progress::Complete(request)
                }
                None => Progress::Waiting,
            },
            ServerEvent::StreamReset {
                stream_id,
                error_code,
            } => {
                HTTP2_STREAM_RESETS.increment();
                trace!(stream_id = %stream_id, code = %error_code, "stream reset");
                self.requests.remove(&stream_id);
                Progress::Waiting
            }
            ServerEvent::GoAway {
                last_stream_id,
                error_code,
                ..
            } => {
                debug!(last_stream_id = %last_stream_id, code = %error_code, "client sent GOAWAY");
                Progress::Waiting
            }
        }
    }
}

/// Answer a stream whose body outgrew the buffer. Later DATA for it is
/// still accepted and dropped.
fn refuse_too_large(conn: &ServerConnection, id: StreamId) {
    BODIES_TOO_LARGE.increment();
    debug!(stream_id = %id, "request body too large");
    let Some(mut writer) = conn.writer(id) else {
        return;
    };
    if let Err(e) = writer.send_headers(413, &HeaderBlock::new(), true) {
        debug!(stream_id = %id, error = %e, "failed to send 413");
    }
}

fn dispatch(conn: &ServerConnection, request: Request, handler: &Arc<dyn RequestHandler>) {
    let id = request.head.stream_id;
    let Some(writer) = conn.writer(id) else {
        trace!(stream_id = %id, "stream no longer writable, dropping request");
        return;
    };
    HTTP2_STREAMS.increment();
    let handler = handler.clone();
    let spawned = thread::Builder::new()
        .name(format!("h2-stream-{}", id.0))
        .spawn(move || handler.handle(request, writer));
    if let Err(e) = spawned {
        // the writer was moved into the failed closure and its drop resets
        // the stream
        warn!(stream_id = %id, error = %e, "failed to spawn stream worker");
    }
}

/// Drive one HTTP/2 connection. `initial` holds bytes already read during
/// protocol detection, starting with the client preface.
pub fn serve(
    mut channel: Box<dyn ByteChannel>,
    initial: &[u8],
    config: &Config,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), DriverError> {
    let mut conn = ServerConnection::new(config.http2_settings(), config.connection_options());
    conn.attach(channel.try_clone()?)?;

    let mut pending = Pending::new(config.http2.max_request_body_size);
    let mut read_buf = vec![0u8; config.http1.read_buffer_size];
    let mut data = initial;

    loop {
        if !data.is_empty()
            && let Err(e) = conn.feed_data(data)
        {
            PROTOCOL_ERRORS.increment();
            debug!(error = %e, "connection failed");
            let _ = channel.shutdown();
            return Err(e.into());
        }

        for event in conn.poll_events() {
            let consumed = match &event {
                ServerEvent::Data {
                    stream_id, data, ..
                } => Some((*stream_id, data.len() as u32)),
                _ => None,
            };
            match pending.on_event(event) {
                Progress::Waiting => {}
                Progress::Complete(request) => dispatch(&conn, request, &handler),
                Progress::TooLarge(id) => refuse_too_large(&conn, id),
            }
            // body bytes are buffered or dropped by now
            if let Some((id, n)) = consumed
                && let Err(e) = conn.release(id, n)
            {
                debug!(error = %e, "connection failed");
                let _ = channel.shutdown();
                return Err(e.into());
            }
        }
        if conn.state() == ConnectionState::Closed {
            trace!("connection closed");
            let _ = channel.shutdown();
            return Ok(());
        }

        match channel.read(&mut read_buf, config.timeouts.read()) {
            Ok(0) => {
                let result = conn.on_eof();
                // let workers finish the responses already in flight
                if !conn.shared().wait_closed(config.timeouts.write()) {
                    debug!(
                        active = conn.shared().active_streams(),
                        "streams still open after client EOF"
                    );
                }
                let _ = channel.shutdown();
                return result.map_err(DriverError::from);
            }
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                data = &read_buf[..n];
            }
            Err(e) if is_timeout(&e) => {
                data = &[];
                if conn.shared().active_streams() == 0 && !conn.shared().goaway_sent() {
                    debug!("idle timeout, sending GOAWAY");
                    conn.shutdown()?;
                }
            }
            Err(e) => {
                warn!(error = %e, "read failed");
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http2::RequestHead;

    fn head(id: u32) -> RequestHead {
        RequestHead {
            stream_id: StreamId(id),
            method: "POST".to_string(),
            path: "/upload".to_string(),
            scheme: "https".to_string(),
            authority: None,
            headers: HeaderBlock::new(),
            content_length: None,
        }
    }

    fn data(id: u32, bytes: &'static [u8], end_stream: bool) -> ServerEvent {
        ServerEvent::Data {
            stream_id: StreamId(id),
            data: Bytes::from_static(bytes),
            end_stream,
        }
    }

    #[test]
    fn test_pending_collects_body() {
        let mut pending = Pending::new(16);
        let request = ServerEvent::Request {
            head: head(1),
            end_stream: false,
        };
        assert!(matches!(pending.on_event(request), Progress::Waiting));
        assert!(matches!(pending.on_event(data(1, b"abc", false)), Progress::Waiting));
        let Progress::Complete(request) = pending.on_event(data(1, b"def", true)) else {
            panic!("expected a complete request");
        };
        assert_eq!(request.body, "abcdef");
        assert!(pending.requests.is_empty());
    }

    #[test]
    fn test_pending_body_limit() {
        let mut pending = Pending::new(4);
        let request = ServerEvent::Request {
            head: head(1),
            end_stream: false,
        };
        pending.on_event(request);
        assert!(matches!(pending.on_event(data(1, b"abcd", false)), Progress::Waiting));
        assert!(matches!(
            pending.on_event(data(1, b"e", false)),
            Progress::TooLarge(StreamId(1))
        ));
        assert!(pending.requests.is_empty());

        // the rest of the refused body is dropped
        assert!(matches!(pending.on_event(data(1, b"fgh", true)), Progress::Waiting));
    }
}

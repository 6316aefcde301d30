//! Offline decoding of captured client byte streams.

use bytes::BytesMut;
use http2::{ServerConnection, ServerEvent};
use protocol_http1::{Http1Parser, MessageKind, ParseEvent};
use tracing::info;

use crate::config::Config;
use crate::connection::{DriverError, Protocol, detect};
use crate::metrics::PROTOCOL_ERRORS;

/// What a capture contained.
#[derive(Debug, Default)]
pub struct Decoded {
    pub protocol: Option<Protocol>,
    /// One line per parse event, in order.
    pub events: Vec<String>,
}

impl Decoded {
    fn push(&mut self, line: String) {
        info!(event = %line);
        self.events.push(line);
    }
}

/// Run a capture of client-to-server bytes through protocol detection and
/// the matching parser, logging every event. Stops at the first fatal
/// error, after recording the events that preceded it.
pub fn decode(data: &[u8], config: &Config) -> (Decoded, Result<(), DriverError>) {
    let mut decoded = Decoded::default();
    let Some(protocol) = detect(data) else {
        return (decoded, Ok(()));
    };
    decoded.protocol = Some(protocol);
    info!(protocol = protocol.as_str(), bytes = data.len(), "decoding capture");

    let result = match protocol {
        Protocol::Http1 => decode_http1(data, config, &mut decoded),
        Protocol::Http2 => decode_http2(data, config, &mut decoded),
    };
    if result.is_err() {
        PROTOCOL_ERRORS.increment();
    }
    (decoded, result)
}

fn decode_http1(data: &[u8], config: &Config, out: &mut Decoded) -> Result<(), DriverError> {
    let mut parser = Http1Parser::new(MessageKind::Request, config.parser_config());
    let mut buf = BytesMut::from(data);
    loop {
        match parser.offer(&mut buf)? {
            Some(event) => out.push(describe_http1(&event)),
            None => break,
        }
    }
    if let Some(event) = parser.eof()? {
        out.push(describe_http1(&event));
    }
    Ok(())
}

fn describe_http1(event: &ParseEvent) -> String {
    match event {
        ParseEvent::Request(head) => {
            let mut line = format!("request {} {} {}", head.method, head.target, head.version);
            if let Some(status) = head.rejection {
                line.push_str(&format!(" rejected={}", status));
            }
            for header in head.headers.iter() {
                line.push_str(&format!(" [{}]", header));
            }
            line
        }
        ParseEvent::Response(head) => format!("response {} {}", head.status, head.reason),
        ParseEvent::Body(data) => format!("body {} bytes", data.len()),
        ParseEvent::EndOfBody { trailers } => match trailers {
            Some(trailers) => format!("end trailers={}", trailers.len()),
            None => "end".to_string(),
        },
    }
}

fn decode_http2(data: &[u8], config: &Config, out: &mut Decoded) -> Result<(), DriverError> {
    let mut conn = ServerConnection::new(config.http2_settings(), config.connection_options());
    // fed in socket-sized pieces so body credit is returned as a live
    // reader would
    for chunk in data.chunks(config.http1.read_buffer_size) {
        let result = conn.feed_data(chunk);
        for event in conn.poll_events() {
            out.push(describe_http2(&event));
            if let ServerEvent::Data {
                stream_id, data, ..
            } = &event
            {
                conn.release(*stream_id, data.len() as u32)?;
            }
        }
        result?;
    }
    Ok(())
}

fn describe_http2(event: &ServerEvent) -> String {
    match event {
        ServerEvent::Request { head, end_stream } => {
            let mut line = format!(
                "stream {} request {} {} end_stream={}",
                head.stream_id, head.method, head.path, end_stream
            );
            for header in head.headers.iter() {
                line.push_str(&format!(" [{}]", header));
            }
            line
        }
        ServerEvent::Data {
            stream_id,
            data,
            end_stream,
        } => format!(
            "stream {} data {} bytes end_stream={}",
            stream_id,
            data.len(),
            end_stream
        ),
        ServerEvent::Trailers {
            stream_id,
            trailers,
        } => format!("stream {} trailers={}", stream_id, trailers.len()),
        ServerEvent::StreamReset {
            stream_id,
            error_code,
        } => format!("stream {} reset {}", stream_id, error_code),
        ServerEvent::GoAway {
            last_stream_id,
            error_code,
            ..
        } => format!("goaway last_stream_id={} {}", last_stream_id, error_code),
    }
}

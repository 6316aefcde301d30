//! End-to-end tests for the HTTP/2 server connection over an in-memory
//! byte channel, with handlers running on their own threads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http2::frame::{ContinuationFrame, SettingsFrame};
use http2::hpack::HeaderField;
use http2::transport::is_timeout;
use http2::{
    ByteChannel, CONNECTION_PREFACE, ConnectionOptions, ConnectionState, ErrorCode, Frame,
    FrameDecoder, FrameEncoder, HeadersFrame, HpackDecoder, HpackEncoder, MemoryChannel, Request,
    RequestHandler, RstStreamFrame, ServerConnection, ServerEvent, Setting, SettingId, Settings,
    StreamId, StreamWriter, WindowUpdateFrame,
};
use protocol_headers::HeaderBlock;

const WAIT: Duration = Duration::from_secs(2);

/// Minimal reader loop: buffers bodies, hands complete requests to workers.
fn serve(
    conn: ServerConnection,
    mut channel: MemoryChannel,
    handler: Arc<dyn RequestHandler>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut conn = conn;
        conn.attach(Box::new(channel.clone())).unwrap();
        let mut pending: HashMap<StreamId, (Request, BytesMut)> = HashMap::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match channel.read(&mut buf, Duration::from_millis(20)) {
                Ok(0) => {
                    let _ = conn.on_eof();
                    return;
                }
                Ok(n) => n,
                Err(e) if is_timeout(&e) => {
                    if conn.state() == ConnectionState::Closed {
                        return;
                    }
                    continue;
                }
                Err(_) => return,
            };
            if conn.feed_data(&buf[..n]).is_err() {
                return;
            }
            let mut ready = Vec::new();
            for event in conn.poll_events() {
                match event {
                    ServerEvent::Request { head, end_stream } => {
                        let id = head.stream_id;
                        let request = Request {
                            head,
                            body: Bytes::new(),
                            trailers: None,
                        };
                        if end_stream {
                            ready.push(request);
                        } else {
                            pending.insert(id, (request, BytesMut::new()));
                        }
                    }
                    ServerEvent::Data {
                        stream_id,
                        data,
                        end_stream,
                    } => {
                        if let Some((_, body)) = pending.get_mut(&stream_id) {
                            body.extend_from_slice(&data);
                        }
                        // buffered, so the credit can go back to the client
                        if conn.release(stream_id, data.len() as u32).is_err() {
                            return;
                        }
                        if end_stream && let Some((mut request, body)) = pending.remove(&stream_id)
                        {
                            request.body = body.freeze();
                            ready.push(request);
                        }
                    }
                    ServerEvent::Trailers {
                        stream_id,
                        trailers,
                    } => {
                        if let Some((mut request, body)) = pending.remove(&stream_id) {
                            request.body = body.freeze();
                            request.trailers = Some(trailers);
                            ready.push(request);
                        }
                    }
                    ServerEvent::StreamReset { stream_id, .. } => {
                        pending.remove(&stream_id);
                    }
                    ServerEvent::GoAway { .. } => {}
                }
            }
            for request in ready {
                if let Some(writer) = conn.writer(request.head.stream_id) {
                    let handler = handler.clone();
                    thread::spawn(move || handler.handle(request, writer));
                }
            }
            if conn.state() == ConnectionState::Closed {
                return;
            }
        }
    })
}

/// Client end of the connection, speaking raw frames.
struct Client {
    channel: MemoryChannel,
    frames: FrameEncoder,
    decoder: FrameDecoder,
    hpack: HpackEncoder,
    hpack_decoder: HpackDecoder,
    buf: BytesMut,
}

impl Client {
    fn new(channel: MemoryChannel) -> Self {
        Self {
            channel,
            frames: FrameEncoder::new(),
            decoder: FrameDecoder::new(),
            hpack: HpackEncoder::default(),
            hpack_decoder: HpackDecoder::default(),
            buf: BytesMut::new(),
        }
    }

    fn send(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        self.frames.encode(&frame, &mut out);
        self.channel.write_all(&out, WAIT).unwrap();
    }

    /// Preface and SETTINGS, then ACK the server's SETTINGS and wait for ours
    /// to be acknowledged.
    fn handshake(&mut self, settings: Vec<Setting>) {
        self.channel.write_all(CONNECTION_PREFACE, WAIT).unwrap();
        self.send(Frame::Settings(SettingsFrame {
            ack: false,
            settings,
        }));
        let mut got_settings = false;
        let mut got_ack = false;
        while !(got_settings && got_ack) {
            match self.next_frame() {
                Frame::Settings(s) if s.ack => got_ack = true,
                Frame::Settings(_) => {
                    got_settings = true;
                    self.send(Frame::Settings(SettingsFrame::ack()));
                }
                Frame::WindowUpdate(_) => {}
                other => panic!("unexpected frame during handshake: {other:?}"),
            }
        }
    }

    fn request(&mut self, stream_id: u32, path: &str, extra: &[HeaderField], end_stream: bool) {
        let mut fields = vec![
            HeaderField::new(":method", if end_stream { "GET" } else { "POST" }),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":path", path.to_string()),
            HeaderField::new(":authority", "example.com"),
        ];
        fields.extend_from_slice(extra);
        let mut block = Vec::new();
        self.hpack.encode(&fields, &mut block);
        self.send(Frame::Headers(HeadersFrame {
            stream_id: StreamId(stream_id),
            end_stream,
            end_headers: true,
            priority: None,
            header_block: Bytes::from(block),
        }));
    }

    fn try_next_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                return Some(frame);
            }
            match self.channel.read(&mut chunk, timeout) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return None,
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    fn next_frame(&mut self) -> Frame {
        self.try_next_frame(WAIT).expect("timed out waiting for a frame")
    }

    fn decode_headers(&mut self, block: &[u8]) -> Vec<HeaderField> {
        self.hpack_decoder.decode(block).unwrap()
    }
}

fn start(
    settings: Settings,
    handler: Arc<dyn RequestHandler>,
) -> (Client, Arc<http2::connection::Shared>, thread::JoinHandle<()>) {
    let (client, server) = MemoryChannel::pair();
    let conn = ServerConnection::new(settings, ConnectionOptions::default());
    let shared = conn.shared().clone();
    let reader = serve(conn, server, handler);
    (Client::new(client), shared, reader)
}

fn echo_handler() -> Arc<dyn RequestHandler> {
    Arc::new(|request: Request, mut writer: StreamWriter| {
        let mut head = HeaderBlock::new();
        head.insert("content-type", "application/octet-stream")
            .unwrap();
        writer.send_headers(200, &head, false).unwrap();
        writer.send_data(request.body, true).unwrap();
    })
}

#[test]
fn test_get_roundtrip() {
    let handler: Arc<dyn RequestHandler> = Arc::new(|request: Request, mut writer: StreamWriter| {
        assert_eq!(request.head.method, "GET");
        assert_eq!(request.head.authority.as_deref(), Some("example.com"));
        writer
            .send_headers(200, &HeaderBlock::new(), false)
            .unwrap();
        writer
            .send_data(Bytes::from(request.head.path.clone()), true)
            .unwrap();
    });
    let (mut client, _shared, _reader) = start(Settings::server(), handler);
    client.handshake(vec![]);
    client.request(1, "/hello", &[], true);

    let Frame::Headers(headers) = client.next_frame() else {
        panic!("expected HEADERS");
    };
    assert_eq!(headers.stream_id, StreamId(1));
    let fields = client.decode_headers(&headers.header_block);
    assert_eq!(fields[0], HeaderField::new(":status", "200"));

    let Frame::Data(data) = client.next_frame() else {
        panic!("expected DATA");
    };
    assert!(data.end_stream);
    assert_eq!(data.data, "/hello");
}

#[test]
fn test_post_body_and_trailers() {
    let handler: Arc<dyn RequestHandler> = Arc::new(|request: Request, mut writer: StreamWriter| {
        let trailers = request.trailers.expect("trailers");
        assert_eq!(trailers.get_str("x-digest"), Some("abc"));
        writer
            .send_headers(200, &HeaderBlock::new(), false)
            .unwrap();
        writer.send_data(request.body, false).unwrap();
        let mut out = HeaderBlock::new();
        out.insert("grpc-status", "0").unwrap();
        writer.send_trailers(&out).unwrap();
    });
    let (mut client, _shared, _reader) = start(Settings::server(), handler);
    client.handshake(vec![]);
    client.request(1, "/upload", &[], false);
    client.send(Frame::Data(http2::DataFrame {
        stream_id: StreamId(1),
        end_stream: false,
        data: Bytes::from_static(b"part1-"),
        padding: 0,
    }));
    client.send(Frame::Data(http2::DataFrame {
        stream_id: StreamId(1),
        end_stream: false,
        data: Bytes::from_static(b"part2"),
        padding: 0,
    }));
    let mut block = Vec::new();
    client
        .hpack
        .encode(&[HeaderField::new("x-digest", "abc")], &mut block);
    client.send(Frame::Headers(HeadersFrame {
        stream_id: StreamId(1),
        end_stream: true,
        end_headers: true,
        priority: None,
        header_block: Bytes::from(block),
    }));

    assert!(matches!(client.next_frame(), Frame::Headers(h) if !h.end_stream));
    let Frame::Data(data) = client.next_frame() else {
        panic!("expected DATA");
    };
    assert_eq!(data.data, "part1-part2");
    let Frame::Headers(trailers) = client.next_frame() else {
        panic!("expected trailers");
    };
    assert!(trailers.end_stream);
    let fields = client.decode_headers(&trailers.header_block);
    assert_eq!(fields, vec![HeaderField::new("grpc-status", "0")]);
}

#[test]
fn test_duplicate_method_resets_stream_connection_stays_open() {
    let (mut client, shared, _reader) = start(Settings::server(), echo_handler());
    client.handshake(vec![]);
    client.request(1, "/", &[HeaderField::new(":method", "GET")], true);

    assert_eq!(
        client.next_frame(),
        Frame::RstStream(RstStreamFrame {
            stream_id: StreamId(1),
            error_code: ErrorCode::ProtocolError.to_u32(),
        })
    );
    assert_eq!(shared.state(), ConnectionState::Open);

    client.request(3, "/", &[], true);
    assert!(matches!(client.next_frame(), Frame::Headers(h) if h.stream_id == StreamId(3)));
}

#[test]
fn test_flow_control_blocks_until_window_update() {
    let handler: Arc<dyn RequestHandler> = Arc::new(|_request: Request, mut writer: StreamWriter| {
        writer
            .send_headers(200, &HeaderBlock::new(), false)
            .unwrap();
        writer.send_data(Bytes::from_static(b"hello"), true).unwrap();
    });
    let (mut client, _shared, _reader) = start(Settings::server(), handler);
    client.handshake(vec![Setting {
        id: SettingId::InitialWindowSize,
        value: 0,
    }]);
    client.request(1, "/", &[], true);

    assert!(matches!(client.next_frame(), Frame::Headers(_)));
    assert_eq!(client.try_next_frame(Duration::from_millis(100)), None);

    client.send(Frame::WindowUpdate(WindowUpdateFrame {
        stream_id: StreamId(1),
        increment: 3,
    }));
    let Frame::Data(first) = client.next_frame() else {
        panic!("expected DATA");
    };
    assert_eq!(first.data, "hel");
    assert!(!first.end_stream);

    client.send(Frame::WindowUpdate(WindowUpdateFrame {
        stream_id: StreamId(1),
        increment: 10,
    }));
    let Frame::Data(rest) = client.next_frame() else {
        panic!("expected DATA");
    };
    assert_eq!(rest.data, "lo");
    assert!(rest.end_stream);
}

#[test]
fn test_settings_ack_fifo() {
    let mut conn = ServerConnection::new(Settings::server(), ConnectionOptions::default());
    let mut input = BytesMut::from(CONNECTION_PREFACE);
    FrameEncoder::new().encode(
        &Frame::Settings(SettingsFrame {
            ack: false,
            settings: vec![],
        }),
        &mut input,
    );
    conn.feed_data(&input).unwrap();

    let first = Settings::server().max_concurrent_streams(10);
    let second = first.max_frame_size(32_768);
    conn.update_settings(first).unwrap();
    conn.update_settings(second).unwrap();
    assert_eq!(conn.pending_settings(), 3);

    // the second update only carries what changed since the first
    let mut out = conn.shared().take_output();
    let decoder = FrameDecoder::new();
    let mut sent = Vec::new();
    while let Some(frame) = decoder.decode(&mut out).unwrap() {
        if let Frame::Settings(s) = frame
            && !s.ack
        {
            sent.push(s.settings);
        }
    }
    assert_eq!(sent.len(), 3);
    assert_eq!(
        sent[2],
        vec![Setting {
            id: SettingId::MaxFrameSize,
            value: 32_768
        }]
    );

    let mut ack = BytesMut::new();
    FrameEncoder::new().encode(&Frame::Settings(SettingsFrame::ack()), &mut ack);
    conn.feed_data(&ack).unwrap();
    assert_eq!(conn.local_settings(), &Settings::server());
    conn.feed_data(&ack).unwrap();
    assert_eq!(conn.local_settings(), &first);
    conn.feed_data(&ack).unwrap();
    assert_eq!(conn.local_settings(), &second);
    assert_eq!(conn.pending_settings(), 0);

    // one ACK too many
    assert!(conn.feed_data(&ack).is_err());
}

#[test]
fn test_goaway_drains_in_flight_streams() {
    let (release, gate) = mpsc::channel::<()>();
    let gate = Arc::new(parking_lot::Mutex::new(gate));
    let handler: Arc<dyn RequestHandler> = Arc::new(move |_request: Request, mut writer: StreamWriter| {
        gate.lock().recv().unwrap();
        writer.send_headers(204, &HeaderBlock::new(), true).unwrap();
    });
    let (mut client, shared, _reader) = start(Settings::server(), handler);
    client.handshake(vec![]);
    client.request(1, "/slow", &[], true);

    // wait for the stream to be accepted before draining
    for _ in 0..100 {
        if shared.active_streams() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    shared.shutdown().unwrap();

    let Frame::GoAway(goaway) = client.next_frame() else {
        panic!("expected GOAWAY");
    };
    assert_eq!(goaway.last_stream_id, StreamId(1));
    assert_eq!(goaway.error_code, ErrorCode::NoError.to_u32());

    // streams above the announced id are ignored, along with their DATA
    client.request(3, "/late", &[], false);
    client.send(Frame::Data(http2::DataFrame {
        stream_id: StreamId(3),
        end_stream: true,
        data: Bytes::from_static(b"ignored"),
        padding: 0,
    }));
    assert_eq!(client.try_next_frame(Duration::from_millis(50)), None);
    assert!(!shared.wait_closed(Duration::from_millis(10)));

    release.send(()).unwrap();
    assert!(matches!(client.next_frame(), Frame::Headers(h) if h.stream_id == StreamId(1) && h.end_stream));
    assert!(shared.wait_closed(WAIT));
}

#[test]
fn test_upload_larger_than_window_waits_for_credit() {
    let handler: Arc<dyn RequestHandler> = Arc::new(|request: Request, mut writer: StreamWriter| {
        writer
            .send_headers(200, &HeaderBlock::new(), false)
            .unwrap();
        writer
            .send_data(Bytes::from(request.body.len().to_string()), true)
            .unwrap();
    });
    let (mut client, _shared, _reader) = start(Settings::server(), handler);
    client.handshake(vec![]);
    client.request(1, "/upload", &[], false);

    // send 200,000 bytes without ever exceeding the advertised windows
    let total = 200_000usize;
    let chunk = 16_000usize;
    let (mut conn_window, mut stream_window) = (65_535i64, 65_535i64);
    let mut sent = 0;
    let mut updates = 0;
    while sent < total {
        let len = chunk.min(total - sent);
        if conn_window >= len as i64 && stream_window >= len as i64 {
            sent += len;
            client.send(Frame::Data(http2::DataFrame {
                stream_id: StreamId(1),
                end_stream: sent == total,
                data: Bytes::from(vec![7u8; len]),
                padding: 0,
            }));
            conn_window -= len as i64;
            stream_window -= len as i64;
            continue;
        }
        match client.next_frame() {
            Frame::WindowUpdate(w) if w.stream_id == StreamId::CONNECTION => {
                conn_window += w.increment as i64;
                updates += 1;
            }
            Frame::WindowUpdate(w) => {
                stream_window += w.increment as i64;
                updates += 1;
            }
            other => panic!("unexpected frame while uploading: {other:?}"),
        }
    }
    assert!(updates >= 2);

    let Frame::Headers(_) = next_non_window_update(&mut client) else {
        panic!("expected HEADERS");
    };
    let Frame::Data(data) = next_non_window_update(&mut client) else {
        panic!("expected DATA");
    };
    assert_eq!(data.data, "200000");
}

fn next_non_window_update(client: &mut Client) -> Frame {
    loop {
        match client.next_frame() {
            Frame::WindowUpdate(_) => continue,
            frame => return frame,
        }
    }
}

#[test]
fn test_large_response_headers_use_continuation() {
    let handler: Arc<dyn RequestHandler> = Arc::new(|_request: Request, mut writer: StreamWriter| {
        let mut head = HeaderBlock::new();
        for i in 0..40 {
            head.insert(format!("x-filler-{i}"), "v".repeat(1000)).unwrap();
        }
        writer.send_headers(200, &head, true).unwrap();
    });
    let (mut client, _shared, _reader) = start(Settings::server(), handler);
    client.handshake(vec![]);
    client.request(1, "/", &[], true);

    let Frame::Headers(first) = client.next_frame() else {
        panic!("expected HEADERS");
    };
    assert!(!first.end_headers);
    let mut block = BytesMut::from(&first.header_block[..]);
    loop {
        match client.next_frame() {
            Frame::Continuation(ContinuationFrame {
                end_headers,
                header_block,
                ..
            }) => {
                block.extend_from_slice(&header_block);
                if end_headers {
                    break;
                }
            }
            other => panic!("expected CONTINUATION, got {other:?}"),
        }
    }
    let fields = client.decode_headers(&block);
    assert_eq!(fields.len(), 41);
}

#[test]
fn test_peer_eof_closes_idle_connection() {
    let (mut client, shared, reader) = start(Settings::server(), echo_handler());
    client.handshake(vec![]);
    client.channel.shutdown().unwrap();
    reader.join().unwrap();
    assert!(shared.wait_closed(WAIT));
}

//! HTTP/2 server connection.
//!
//! [`ServerConnection`] is the reader side: it is fed bytes from the socket,
//! validates the preface, decodes frames and header blocks, enforces stream
//! and flow-control rules, and queues [`ServerEvent`]s. It never blocks.
//!
//! Everything written to the peer goes through [`Shared`], which holds the
//! single write lock (HPACK encoder, frame encoder and socket), the stream
//! table and the connection send window. Workers answering requests hold a
//! [`StreamWriter`] that shares it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, RwLock};
use protocol_headers::HeaderBlock;
use tracing::{debug, trace, warn};

use super::settings::{PendingSettings, Settings};
use super::stream::{RecvStream, RequestHead, Stream, validate_request, validate_trailers};
use super::{ConnectionError, ConnectionState, H2Error, StreamId, StreamState};
use crate::flow::{self, FlowError, IncomingWindow, OutgoingWindow};
use crate::frame::{
    self, Action, AssembledHeaders, BlockKind, DataFrame, ErrorCode, Frame, FrameDecoder,
    FrameEncoder, FrameError, GoAwayFrame, HeaderBlockAssembler, PingFrame, RstStreamFrame,
    SettingsFrame, WindowUpdateFrame,
};
use crate::hpack::{HeaderField, HpackDecoder, HpackEncoder, HpackError};
use crate::transport::ByteChannel;

/// Tunables that are not negotiated with the peer.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long a worker waits for send credit before giving up.
    pub flow_control_timeout: Duration,
    /// Bound on each socket write.
    pub write_timeout: Duration,
    /// Largest header block accepted across HEADERS and CONTINUATION.
    pub max_header_block_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            flow_control_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_header_block_size: frame::DEFAULT_MAX_HEADER_BLOCK_SIZE,
        }
    }
}

/// Events produced by the server connection.
#[derive(Debug)]
pub enum ServerEvent {
    /// A client opened a stream with a valid request head.
    Request {
        head: RequestHead,
        end_stream: bool,
    },
    /// Request body bytes.
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// Trailers, which always end the request.
    Trailers {
        stream_id: StreamId,
        trailers: HeaderBlock,
    },
    /// The stream was reset by either side.
    StreamReset {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// The client sent GOAWAY.
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
}

/// Everything behind the write lock.
pub struct Writer {
    frames: FrameEncoder,
    hpack: HpackEncoder,
    buf: BytesMut,
    sink: Option<Box<dyn ByteChannel>>,
    write_timeout: Duration,
}

impl Writer {
    /// Push buffered frames to the socket. Without a socket the bytes stay
    /// buffered for [`Shared::take_output`].
    fn flush(&mut self) -> io::Result<()> {
        if let Some(sink) = self.sink.as_mut()
            && !self.buf.is_empty()
        {
            sink.write_all(&self.buf, self.write_timeout)?;
            self.buf.clear();
        }
        Ok(())
    }

    fn encode_headers(
        &mut self,
        stream_id: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> io::Result<()> {
        let mut block = Vec::new();
        self.hpack.encode(fields, &mut block);
        self.frames
            .encode_header_block(stream_id, Bytes::from(block), end_stream, &mut self.buf);
        self.flush()
    }
}

#[derive(Debug)]
struct ConnState {
    state: ConnectionState,
    goaway_sent: bool,
}

/// Connection state shared by the reader and every stream worker.
pub struct Shared {
    writer: Mutex<Writer>,
    streams: RwLock<AHashMap<u32, Arc<Stream>>>,
    send_window: OutgoingWindow,
    state: Mutex<ConnState>,
    state_changed: Condvar,
    /// Highest client stream id processed, announced in GOAWAY.
    last_stream_id: AtomicU32,
    peer_max_frame_size: AtomicU32,
    flow_timeout: Duration,
}

impl Shared {
    fn new(options: &ConnectionOptions) -> Self {
        Self {
            writer: Mutex::new(Writer {
                frames: FrameEncoder::new(),
                hpack: HpackEncoder::default(),
                buf: BytesMut::with_capacity(16384),
                sink: None,
                write_timeout: options.write_timeout,
            }),
            streams: RwLock::new(AHashMap::new()),
            send_window: OutgoingWindow::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            state: Mutex::new(ConnState {
                state: ConnectionState::Open,
                goaway_sent: false,
            }),
            state_changed: Condvar::new(),
            last_stream_id: AtomicU32::new(0),
            peer_max_frame_size: AtomicU32::new(frame::DEFAULT_MAX_FRAME_SIZE),
            flow_timeout: options.flow_control_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    pub fn goaway_sent(&self) -> bool {
        self.state.lock().goaway_sent
    }

    pub fn last_stream_id(&self) -> StreamId {
        StreamId(self.last_stream_id.load(Ordering::Acquire))
    }

    pub fn active_streams(&self) -> usize {
        self.streams.read().len()
    }

    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.read().get(&id.value()).cloned()
    }

    /// Connection-level send credit.
    pub fn send_window(&self) -> &OutgoingWindow {
        &self.send_window
    }

    /// Drain frames buffered while no socket is attached.
    pub fn take_output(&self) -> BytesMut {
        self.writer.lock().buf.split()
    }

    /// Send GOAWAY with the last processed stream id and stop accepting new
    /// streams. Streams already open run to completion.
    pub fn shutdown(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock();
            if state.goaway_sent || state.state == ConnectionState::Closed {
                return Ok(());
            }
            state.goaway_sent = true;
            if state.state == ConnectionState::Open {
                state.state = ConnectionState::HalfClosedLocal;
            }
        }
        let last = self.last_stream_id();
        debug!(last_stream_id = %last, "sending GOAWAY");
        self.write(|w| {
            w.frames
                .write_goaway(last, ErrorCode::NoError.to_u32(), &[], &mut w.buf)
        })?;
        self.maybe_close();
        Ok(())
    }

    /// Block until the connection is closed or `timeout` elapses. Returns
    /// true if closed.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.state != ConnectionState::Closed {
            if self
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.state == ConnectionState::Closed
    }

    fn write<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut Writer),
    {
        let mut writer = self.writer.lock();
        f(&mut writer);
        writer.flush()
    }

    fn attach(&self, sink: Box<dyn ByteChannel>) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.sink = Some(sink);
        writer.flush()
    }

    fn insert_stream(&self, stream: Arc<Stream>) {
        self.streams.write().insert(stream.id().value(), stream);
    }

    /// Remove a stream from the table. Safe to call more than once.
    fn remove_stream(&self, id: StreamId) {
        let removed = self.streams.write().remove(&id.value());
        if removed.is_some() {
            trace!(stream_id = %id, "stream removed");
            self.maybe_close();
        }
    }

    /// Snapshot of the open streams; iteration never holds the table lock.
    fn streams_snapshot(&self) -> Vec<Arc<Stream>> {
        self.streams.read().values().cloned().collect()
    }

    fn remote_closed(&self) {
        let mut state = self.state.lock();
        if state.state == ConnectionState::Open {
            state.state = ConnectionState::HalfClosedRemote;
        }
        drop(state);
        self.maybe_close();
    }

    fn maybe_close(&self) {
        let mut state = self.state.lock();
        if matches!(
            state.state,
            ConnectionState::HalfClosedLocal | ConnectionState::HalfClosedRemote
        ) && self.streams.read().is_empty()
        {
            debug!("connection drained");
            state.state = ConnectionState::Closed;
            self.state_changed.notify_all();
        }
    }

    /// Tear everything down and wake all blocked writers.
    fn close_all(&self) {
        {
            let mut state = self.state.lock();
            state.state = ConnectionState::Closed;
            state.goaway_sent = true;
        }
        self.send_window.close();
        let streams: Vec<_> = self.streams.write().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.reset();
        }
        self.state_changed.notify_all();
    }
}

/// Failure while handling a frame: a protocol error to answer, or a socket
/// that stopped accepting writes.
#[derive(Debug)]
enum Fault {
    H2(H2Error),
    Io(io::Error),
}

impl From<H2Error> for Fault {
    fn from(e: H2Error) -> Self {
        Fault::H2(e)
    }
}

impl From<io::Error> for Fault {
    fn from(e: io::Error) -> Self {
        Fault::Io(e)
    }
}

impl From<FrameError> for Fault {
    fn from(e: FrameError) -> Self {
        Fault::H2(e.into())
    }
}

impl From<super::SettingsError> for Fault {
    fn from(e: super::SettingsError) -> Self {
        Fault::H2(e.into())
    }
}

fn conn_error(code: ErrorCode, reason: impl Into<String>) -> Fault {
    Fault::H2(H2Error::connection(code, reason))
}

fn stream_error(id: StreamId, code: ErrorCode, reason: impl Into<String>) -> Fault {
    Fault::H2(H2Error::stream(id, code, reason))
}

/// HTTP/2 server connection, reader side.
pub struct ServerConnection {
    shared: Arc<Shared>,
    /// Settings the peer has acknowledged.
    local: Settings,
    /// Latest settings we sent.
    advertised: Settings,
    /// Settings the peer has sent us.
    remote: Settings,
    pending: PendingSettings,
    got_preface: bool,
    got_settings: bool,
    decoder: FrameDecoder,
    assembler: HeaderBlockAssembler,
    hpack: HpackDecoder,
    recv_streams: AHashMap<u32, RecvStream>,
    recv_window: IncomingWindow,
    read_buf: BytesMut,
    events: Vec<ServerEvent>,
}

impl ServerConnection {
    /// A connection that will advertise `settings` once the client preface
    /// arrives.
    pub fn new(settings: Settings, options: ConnectionOptions) -> Self {
        let local = Settings::default();
        Self {
            shared: Arc::new(Shared::new(&options)),
            local,
            advertised: settings,
            remote: Settings::default(),
            pending: PendingSettings::new(),
            got_preface: false,
            got_settings: false,
            decoder: FrameDecoder::new(),
            assembler: HeaderBlockAssembler::new(options.max_header_block_size),
            hpack: HpackDecoder::new(local.header_table_size as usize),
            recv_streams: AHashMap::new(),
            recv_window: IncomingWindow::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            read_buf: BytesMut::with_capacity(16384),
            events: Vec::new(),
        }
    }

    /// Write frames straight to `sink` instead of buffering them.
    pub fn attach(&self, sink: Box<dyn ByteChannel>) -> Result<(), ConnectionError> {
        Ok(self.shared.attach(sink)?)
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Settings acknowledged by the peer.
    pub fn local_settings(&self) -> &Settings {
        &self.local
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote
    }

    /// SETTINGS frames still awaiting an ACK.
    pub fn pending_settings(&self) -> usize {
        self.pending.len()
    }

    /// Feed bytes read from the client and process every complete frame.
    pub fn feed_data(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.read_buf.extend_from_slice(data);
        self.process()
    }

    /// Process buffered bytes. A connection error has already been answered
    /// with GOAWAY when it is returned.
    pub fn process(&mut self) -> Result<(), ConnectionError> {
        if self.shared.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.process_frames().map_err(|fault| self.answer(fault))
    }

    /// Return `n` bytes of received DATA on `stream_id` to the peer once the
    /// application has consumed them. WINDOW_UPDATE frames go out when half
    /// of a window has been consumed. Until then the peer can send no more
    /// than the advertised windows allow.
    pub fn release(&mut self, stream_id: StreamId, n: u32) -> Result<(), ConnectionError> {
        if n == 0 || self.shared.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.release_credit(stream_id, n)
            .map_err(|fault| self.answer(fault))
    }

    /// Drain queued events.
    pub fn poll_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Writer for a stream that is still open for sending.
    pub fn writer(&self, stream_id: StreamId) -> Option<StreamWriter> {
        let stream = self.shared.stream(stream_id)?;
        if !stream.state().can_send() {
            return None;
        }
        Some(StreamWriter {
            shared: self.shared.clone(),
            stream,
            finished: false,
        })
    }

    /// Start a graceful shutdown with GOAWAY.
    pub fn shutdown(&self) -> Result<(), ConnectionError> {
        self.shared.shutdown()
    }

    /// Advertise new settings. They take full effect once acknowledged.
    pub fn update_settings(&mut self, settings: Settings) -> Result<(), ConnectionError> {
        settings
            .validate()
            .map_err(|e| ConnectionError::Protocol {
                code: e.error_code(),
                reason: e.to_string(),
            })?;
        if !self.got_preface {
            self.advertised = settings;
            return Ok(());
        }
        self.send_settings(settings)
            .map_err(|fault| self.answer(fault))
    }

    /// The client closed its side of the socket.
    pub fn on_eof(&mut self) -> Result<(), ConnectionError> {
        let incomplete = !self.got_preface || self.assembler.is_assembling();
        let waiting: Vec<u32> = self.recv_streams.keys().copied().collect();
        for id in waiting {
            // a request body that can never complete
            let _ = self.reset_stream(StreamId(id), ErrorCode::Cancel);
        }
        self.shared.remote_closed();
        if incomplete && self.shared.state() != ConnectionState::Closed {
            self.shared.close_all();
            return Err(ConnectionError::UnexpectedEof);
        }
        Ok(())
    }

    /// Turn a fault into the error returned to the caller, closing the
    /// connection on the way.
    fn answer(&mut self, fault: Fault) -> ConnectionError {
        match fault {
            Fault::Io(e) => {
                warn!(error = %e, "write failed, closing connection");
                self.shared.close_all();
                e.into()
            }
            Fault::H2(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: H2Error) -> ConnectionError {
        let code = e.code();
        let reason = match e {
            H2Error::Connection { reason, .. } | H2Error::Stream { reason, .. } => reason,
        };
        warn!(code = %code, reason = %reason, "connection error");
        let last = self.shared.last_stream_id();
        let _ = self.shared.write(|w| {
            w.frames
                .write_goaway(last, code.to_u32(), reason.as_bytes(), &mut w.buf)
        });
        self.shared.close_all();
        ConnectionError::Protocol { code, reason }
    }

    fn process_frames(&mut self) -> Result<(), Fault> {
        if !self.got_preface {
            let n = self.read_buf.len().min(frame::CONNECTION_PREFACE.len());
            if self.read_buf[..n] != frame::CONNECTION_PREFACE[..n] {
                return Err(conn_error(
                    ErrorCode::ProtocolError,
                    "invalid connection preface",
                ));
            }
            if n < frame::CONNECTION_PREFACE.len() {
                return Ok(());
            }
            self.read_buf.advance(n);
            self.got_preface = true;
            debug!("client preface received");
            self.send_settings(self.advertised)?;
            self.grow_connection_window()?;
        }

        while let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
            if !self.got_settings && !matches!(&frame, Frame::Settings(s) if !s.ack) {
                return Err(conn_error(
                    ErrorCode::ProtocolError,
                    "first frame is not SETTINGS",
                ));
            }
            match self.on_frame(frame) {
                Ok(()) => {}
                Err(Fault::H2(H2Error::Stream { id, code, reason })) => {
                    debug!(stream_id = %id, code = %code, reason = %reason, "stream error");
                    self.reset_stream(id, code)?;
                }
                Err(fault) => return Err(fault),
            }
            if self.shared.state() == ConnectionState::Closed {
                break;
            }
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), Fault> {
        match self.assembler.feed(frame) {
            Action::Pass(frame) => self.handle_frame(frame),
            Action::NeedMore => Ok(()),
            Action::Deliver(block) => self.handle_header_block(block),
            Action::Error(e) => Err(e.into()),
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Fault> {
        match frame {
            Frame::Data(f) => self.handle_data(f),
            Frame::Settings(f) => self.handle_settings(f),
            Frame::Ping(f) => self.handle_ping(f),
            Frame::GoAway(f) => self.handle_goaway(f),
            Frame::WindowUpdate(f) => self.handle_window_update(f),
            Frame::RstStream(f) => self.handle_rst_stream(f),
            Frame::Priority(f) => {
                trace!(stream_id = %f.stream_id, "ignoring PRIORITY");
                if f.priority.dependency == f.stream_id {
                    return Err(stream_error(
                        f.stream_id,
                        ErrorCode::ProtocolError,
                        "stream depends on itself",
                    ));
                }
                Ok(())
            }
            Frame::Unknown(f) => {
                trace!(frame_type = f.frame_type, "discarding unknown frame");
                Ok(())
            }
            // header blocks are routed through the assembler
            Frame::Headers(_) | Frame::PushPromise(_) | Frame::Continuation(_) => Ok(()),
        }
    }

    fn send_settings(&mut self, settings: Settings) -> Result<(), Fault> {
        let frame = self.pending.push(&self.local, settings);
        debug!(settings = ?frame.settings, "sending SETTINGS");
        self.advertised = settings;
        self.apply_local_limits();
        self.shared
            .write(|w| w.frames.encode(&Frame::Settings(frame), &mut w.buf))?;
        Ok(())
    }

    /// The connection window is only grown by WINDOW_UPDATE, so match it to
    /// the advertised stream window once, right after the first SETTINGS.
    fn grow_connection_window(&mut self) -> Result<(), Fault> {
        let target = self.advertised.initial_window_size;
        let current = self.recv_window.initial();
        if target <= current {
            return Ok(());
        }
        self.shared.write(|w| {
            w.frames
                .write_window_update(StreamId::CONNECTION, target - current, &mut w.buf)
        })?;
        self.recv_window = IncomingWindow::new(target);
        Ok(())
    }

    /// Limits whose violation is connection-fatal use the more permissive of
    /// the acknowledged and advertised values until the ACK arrives; limits
    /// that only refuse a stream apply as soon as they are sent.
    fn apply_local_limits(&mut self) {
        let (acked, sent) = (self.local, self.advertised);
        self.decoder
            .set_max_frame_size(acked.max_frame_size.max(sent.max_frame_size));
        self.hpack
            .set_max_table_size(acked.header_table_size.max(sent.header_table_size) as usize);
        self.hpack
            .set_max_header_list_size(sent.max_header_list_size as usize);

        let initial = self.recv_initial_window();
        for recv in self.recv_streams.values_mut() {
            if recv.incoming.initial() != initial {
                recv.incoming.apply_settings_change(initial);
            }
        }
    }

    fn recv_initial_window(&self) -> u32 {
        self.local
            .initial_window_size
            .max(self.advertised.initial_window_size)
    }

    fn handle_settings(&mut self, frame: SettingsFrame) -> Result<(), Fault> {
        if frame.ack {
            self.local = self.pending.ack()?;
            if self.pending.is_empty() {
                self.advertised = self.local;
            }
            self.apply_local_limits();
            debug!("SETTINGS acknowledged");
            return Ok(());
        }

        let old = self.remote;
        self.remote.apply(&frame.settings)?;
        self.got_settings = true;
        let new = self.remote;
        trace!(settings = ?frame.settings, "peer SETTINGS");

        if new.initial_window_size != old.initial_window_size {
            for stream in self.shared.streams_snapshot() {
                stream
                    .outgoing()
                    .apply_settings_change(old.initial_window_size, new.initial_window_size)
                    .map_err(|e| conn_error(ErrorCode::FlowControlError, e.to_string()))?;
            }
        }
        self.shared
            .peer_max_frame_size
            .store(new.max_frame_size, Ordering::Release);

        self.shared.write(|w| {
            if new.header_table_size != old.header_table_size {
                w.hpack.set_max_table_size(new.header_table_size as usize);
            }
            w.frames.set_max_frame_size(new.max_frame_size);
            w.frames.encode_settings_ack(&mut w.buf);
        })?;
        Ok(())
    }

    fn handle_ping(&mut self, frame: PingFrame) -> Result<(), Fault> {
        if !frame.ack {
            self.shared
                .write(|w| w.frames.encode_ping_ack(frame.data, &mut w.buf))?;
        }
        Ok(())
    }

    fn handle_goaway(&mut self, frame: GoAwayFrame) -> Result<(), Fault> {
        let error_code = ErrorCode::from_u32(frame.error_code);
        debug!(
            last_stream_id = %frame.last_stream_id,
            code = %error_code,
            debug = %frame.debug_data_lossy(),
            "GOAWAY received"
        );
        self.events.push(ServerEvent::GoAway {
            last_stream_id: frame.last_stream_id,
            error_code,
            debug_data: frame.debug_data,
        });
        self.shared.remote_closed();
        Ok(())
    }

    fn handle_window_update(&mut self, frame: WindowUpdateFrame) -> Result<(), Fault> {
        let id = frame.stream_id;
        if id.is_connection_level() {
            if frame.increment == 0 {
                return Err(conn_error(
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE with zero increment",
                ));
            }
            return self
                .shared
                .send_window
                .apply_window_update(frame.increment)
                .map_err(|e| conn_error(ErrorCode::FlowControlError, e.to_string()));
        }

        if self.discarded_after_goaway(id) {
            return Ok(());
        }
        self.check_not_idle(id)?;
        let Some(stream) = self.shared.stream(id) else {
            trace!(stream_id = %id, "WINDOW_UPDATE for closed stream");
            return Ok(());
        };
        if frame.increment == 0 {
            return Err(stream_error(
                id,
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE with zero increment",
            ));
        }
        match stream.outgoing().apply_window_update(frame.increment) {
            Ok(()) | Err(FlowError::Closed) => Ok(()),
            Err(e) => Err(stream_error(id, ErrorCode::FlowControlError, e.to_string())),
        }
    }

    fn handle_rst_stream(&mut self, frame: RstStreamFrame) -> Result<(), Fault> {
        let id = frame.stream_id;
        if self.discarded_after_goaway(id) {
            return Ok(());
        }
        self.check_not_idle(id)?;
        let error_code = ErrorCode::from_u32(frame.error_code);
        debug!(stream_id = %id, code = %error_code, "stream reset by peer");
        self.recv_streams.remove(&id.value());
        if let Some(stream) = self.shared.stream(id) {
            stream.reset();
            self.shared.remove_stream(id);
        }
        self.events.push(ServerEvent::StreamReset {
            stream_id: id,
            error_code,
        });
        Ok(())
    }

    fn handle_data(&mut self, frame: DataFrame) -> Result<(), Fault> {
        let id = frame.stream_id;
        let len = frame.flow_len();
        let payload = frame.data.len() as u32;

        // connection credit is consumed whatever happens to the stream
        self.recv_window
            .receive(len)
            .map_err(|e| conn_error(ErrorCode::FlowControlError, e.to_string()))?;

        if self.discarded_after_goaway(id) {
            return self.release_connection(len);
        }
        self.check_not_idle(id)?;
        match self.accept_data(frame) {
            // padding never reaches the application
            Ok(()) => self.release_connection(len - payload),
            Err(fault) => {
                self.release_connection(len)?;
                Err(fault)
            }
        }
    }

    /// Stream-level checks for DATA. On success the payload is queued and
    /// its credit stays withheld until [`ServerConnection::release`].
    fn accept_data(&mut self, frame: DataFrame) -> Result<(), Fault> {
        let id = frame.stream_id;
        let len = frame.flow_len();
        let padding = len - frame.data.len() as u32;

        let Some(recv) = self.recv_streams.get_mut(&id.value()) else {
            return Err(stream_error(id, ErrorCode::StreamClosed, "DATA on closed stream"));
        };
        recv.incoming
            .receive(len)
            .map_err(|e| stream_error(id, ErrorCode::FlowControlError, e.to_string()))?;
        recv.received += frame.data.len() as u64;

        if let Some(expected) = recv.content_length {
            let received = recv.received;
            if received > expected || (frame.end_stream && received != expected) {
                return Err(stream_error(
                    id,
                    ErrorCode::ProtocolError,
                    format!("content-length {expected} but received {received}"),
                ));
            }
        }

        if padding > 0
            && !frame.end_stream
            && let Some(increment) = recv.incoming.release(padding)
        {
            self.shared
                .write(|w| w.frames.write_window_update(id, increment, &mut w.buf))?;
        }

        self.events.push(ServerEvent::Data {
            stream_id: id,
            data: frame.data,
            end_stream: frame.end_stream,
        });
        if frame.end_stream {
            self.finish_remote(id);
        }
        Ok(())
    }

    fn release_connection(&mut self, n: u32) -> Result<(), Fault> {
        if n == 0 {
            return Ok(());
        }
        if let Some(increment) = self.recv_window.release(n) {
            self.shared.write(|w| {
                w.frames
                    .write_window_update(StreamId::CONNECTION, increment, &mut w.buf)
            })?;
        }
        Ok(())
    }

    fn release_credit(&mut self, id: StreamId, n: u32) -> Result<(), Fault> {
        self.release_connection(n)?;
        // a finished or reset stream needs no more credit
        if let Some(recv) = self.recv_streams.get_mut(&id.value())
            && let Some(increment) = recv.incoming.release(n)
        {
            self.shared
                .write(|w| w.frames.write_window_update(id, increment, &mut w.buf))?;
        }
        Ok(())
    }

    fn handle_header_block(&mut self, block: AssembledHeaders) -> Result<(), Fault> {
        let id = block.stream_id;
        if let BlockKind::PushPromise { .. } = block.kind {
            return Err(conn_error(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE from client",
            ));
        }
        if !id.is_client_initiated() {
            return Err(conn_error(
                ErrorCode::ProtocolError,
                format!("invalid client stream id {id}"),
            ));
        }

        // decode first so the HPACK context stays in sync whatever happens
        let decoded = match self.hpack.decode(&block.block) {
            Ok(fields) => Ok(fields),
            Err(e) if e.is_connection_fatal() => return Err(H2Error::from(e).into()),
            Err(e) => Err(e),
        };

        if self.recv_streams.contains_key(&id.value()) {
            return self.handle_trailers(id, decoded, block.end_stream);
        }

        let last = self.shared.last_stream_id();
        if id <= last {
            return if self.shared.stream(id).is_some() {
                Err(stream_error(
                    id,
                    ErrorCode::StreamClosed,
                    "HEADERS on half-closed stream",
                ))
            } else {
                Err(conn_error(
                    ErrorCode::ProtocolError,
                    format!("stream id {id} is not greater than {last}"),
                ))
            };
        }

        if self.shared.goaway_sent() {
            trace!(stream_id = %id, "discarding stream opened after GOAWAY");
            return Ok(());
        }
        self.shared.last_stream_id.store(id.value(), Ordering::Release);

        if self.shared.active_streams() >= self.advertised.max_concurrent_streams as usize {
            return Err(stream_error(
                id,
                ErrorCode::RefusedStream,
                "max concurrent streams exceeded",
            ));
        }

        let fields = decoded.map_err(|e| stream_error(id, e.error_code(), e.to_string()))?;
        let head = validate_request(id, fields).map_err(Fault::H2)?;
        if block.end_stream && head.content_length.is_some_and(|n| n != 0) {
            return Err(stream_error(
                id,
                ErrorCode::ProtocolError,
                "content-length on a request without body",
            ));
        }

        let stream = Arc::new(Stream::new(id, self.remote.initial_window_size));
        self.shared.insert_stream(stream.clone());
        if block.end_stream {
            stream.recv_end_stream();
        } else {
            self.recv_streams.insert(
                id.value(),
                RecvStream::new(self.recv_initial_window(), head.content_length),
            );
        }
        debug!(
            stream_id = %id,
            method = %head.method,
            path = %head.path,
            end_stream = block.end_stream,
            "stream opened"
        );
        self.events.push(ServerEvent::Request {
            head,
            end_stream: block.end_stream,
        });
        Ok(())
    }

    fn handle_trailers(
        &mut self,
        id: StreamId,
        decoded: Result<Vec<HeaderField>, HpackError>,
        end_stream: bool,
    ) -> Result<(), Fault> {
        if !end_stream {
            return Err(stream_error(
                id,
                ErrorCode::ProtocolError,
                "trailers without END_STREAM",
            ));
        }
        let fields = decoded.map_err(|e| stream_error(id, e.error_code(), e.to_string()))?;
        let trailers = validate_trailers(id, fields).map_err(Fault::H2)?;
        if let Some(recv) = self.recv_streams.get(&id.value())
            && let Some(expected) = recv.content_length
            && expected != recv.received
        {
            return Err(stream_error(
                id,
                ErrorCode::ProtocolError,
                format!("content-length {expected} but received {}", recv.received),
            ));
        }
        self.events.push(ServerEvent::Trailers {
            stream_id: id,
            trailers,
        });
        self.finish_remote(id);
        Ok(())
    }

    /// The peer ended its side of a stream.
    fn finish_remote(&mut self, id: StreamId) {
        self.recv_streams.remove(&id.value());
        if let Some(stream) = self.shared.stream(id)
            && stream.recv_end_stream() == StreamState::Closed
        {
            self.shared.remove_stream(id);
        }
    }

    /// Once GOAWAY is out, streams above the announced id are never opened
    /// and every frame for them is dropped unanswered.
    fn discarded_after_goaway(&self, id: StreamId) -> bool {
        if id > self.shared.last_stream_id() && self.shared.goaway_sent() {
            trace!(stream_id = %id, "discarding frame for stream after GOAWAY");
            return true;
        }
        false
    }

    /// Frames for stream ids the client never opened are connection errors.
    fn check_not_idle(&self, id: StreamId) -> Result<(), Fault> {
        if id > self.shared.last_stream_id() {
            return Err(conn_error(
                ErrorCode::ProtocolError,
                format!("frame for idle stream {id}"),
            ));
        }
        Ok(())
    }

    fn reset_stream(&mut self, id: StreamId, code: ErrorCode) -> Result<(), Fault> {
        self.shared
            .write(|w| w.frames.write_rst_stream(id, code.to_u32(), &mut w.buf))?;
        self.recv_streams.remove(&id.value());
        if let Some(stream) = self.shared.stream(id) {
            stream.reset();
            self.shared.remove_stream(id);
        }
        self.events.push(ServerEvent::StreamReset {
            stream_id: id,
            error_code: code,
        });
        Ok(())
    }
}

/// Headers that have no meaning in HTTP/2 and are dropped from responses.
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

fn response_fields(status: Option<u16>, headers: &HeaderBlock) -> Vec<HeaderField> {
    let mut fields = Vec::with_capacity(headers.len() + 1);
    if let Some(status) = status {
        fields.push(HeaderField::new(":status", status.to_string()));
    }
    for line in headers {
        if CONNECTION_SPECIFIC.iter().any(|h| line.name_eq(h)) {
            continue;
        }
        let name = Bytes::from(line.name().to_ascii_lowercase());
        let mut field = HeaderField::new(name, line.value_bytes());
        field.sensitive = line.is_sensitive();
        fields.push(field);
    }
    fields
}

/// Response side of one stream, handed to the worker serving it.
///
/// All writes take the connection's write lock; waiting for flow-control
/// credit happens outside it.
pub struct StreamWriter {
    shared: Arc<Shared>,
    stream: Arc<Stream>,
    finished: bool,
}

impl StreamWriter {
    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    fn check_writable(&self) -> Result<(), ConnectionError> {
        if self.shared.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        if !self.stream.state().can_send() {
            return Err(ConnectionError::StreamClosed(self.stream.id()));
        }
        Ok(())
    }

    /// Send the response head.
    pub fn send_headers(
        &mut self,
        status: u16,
        headers: &HeaderBlock,
        end_stream: bool,
    ) -> Result<(), ConnectionError> {
        self.check_writable()?;
        let fields = response_fields(Some(status), headers);
        let id = self.stream.id();
        self.shared
            .writer
            .lock()
            .encode_headers(id, &fields, end_stream)?;
        trace!(stream_id = %id, status, end_stream, "response headers sent");
        if end_stream {
            self.finish_local();
        }
        Ok(())
    }

    /// Send body bytes, split by the peer's max frame size and gated by both
    /// the stream and the connection send windows.
    pub fn send_data(
        &mut self,
        data: impl Into<Bytes>,
        end_stream: bool,
    ) -> Result<(), ConnectionError> {
        let mut data = data.into();
        let id = self.stream.id();
        loop {
            self.check_writable()?;
            let max = self.shared.peer_max_frame_size.load(Ordering::Acquire) as usize;
            let want = data.len().min(max) as u32;
            let granted = if want == 0 {
                0
            } else {
                let n = flow::withdraw_both_up_to(
                    self.stream.outgoing(),
                    &self.shared.send_window,
                    want,
                    self.shared.flow_timeout,
                )?;
                if n == 0 {
                    return Err(ConnectionError::FlowTimeout(id));
                }
                n
            };

            let chunk = data.split_to(granted as usize);
            let last = data.is_empty();
            let frame = Frame::Data(DataFrame {
                stream_id: id,
                end_stream: end_stream && last,
                data: chunk,
                padding: 0,
            });
            self.shared.write(|w| w.frames.encode(&frame, &mut w.buf))?;
            if last {
                break;
            }
        }
        if end_stream {
            self.finish_local();
        }
        Ok(())
    }

    /// Send trailers, ending the stream.
    pub fn send_trailers(&mut self, trailers: &HeaderBlock) -> Result<(), ConnectionError> {
        self.check_writable()?;
        let fields = response_fields(None, trailers);
        self.shared
            .writer
            .lock()
            .encode_headers(self.stream.id(), &fields, true)?;
        self.finish_local();
        Ok(())
    }

    /// Abort the stream with RST_STREAM.
    pub fn reset(mut self, code: ErrorCode) -> Result<(), ConnectionError> {
        self.finished = true;
        self.send_reset(code)
    }

    fn send_reset(&mut self, code: ErrorCode) -> Result<(), ConnectionError> {
        let id = self.stream.id();
        debug!(stream_id = %id, code = %code, "resetting stream");
        self.stream.reset();
        self.shared.remove_stream(id);
        if self.shared.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.shared
            .write(|w| w.frames.write_rst_stream(id, code.to_u32(), &mut w.buf))?;
        Ok(())
    }

    fn finish_local(&mut self) {
        self.finished = true;
        if self.stream.send_end_stream() == StreamState::Closed {
            self.shared.remove_stream(self.stream.id());
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.finished && self.stream.state().can_send() {
            let _ = self.send_reset(ErrorCode::Cancel);
        }
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("stream_id", &self.stream.id())
            .field("state", &self.stream.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{HeadersFrame, Setting, SettingId};

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameEncoder::new().encode(&frame, &mut buf);
        buf
    }

    fn frames(mut buf: BytesMut) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(frame::MAX_FRAME_SIZE);
        let mut out = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    fn client_settings(settings: Vec<Setting>) -> Frame {
        Frame::Settings(SettingsFrame {
            ack: false,
            settings,
        })
    }

    fn request_block(hpack: &mut HpackEncoder, extra: &[HeaderField]) -> Bytes {
        let mut fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":path", "/"),
        ];
        fields.extend_from_slice(extra);
        let mut block = Vec::new();
        hpack.encode(&fields, &mut block);
        Bytes::from(block)
    }

    fn headers(stream_id: u32, block: Bytes, end_stream: bool) -> Frame {
        Frame::Headers(HeadersFrame {
            stream_id: StreamId(stream_id),
            end_stream,
            end_headers: true,
            priority: None,
            header_block: block,
        })
    }

    /// A connection past the preface and SETTINGS exchange, output drained.
    fn open() -> ServerConnection {
        let mut conn = ServerConnection::new(Settings::server(), ConnectionOptions::default());
        let mut input = BytesMut::from(frame::CONNECTION_PREFACE);
        input.extend_from_slice(&encode(client_settings(vec![])));
        input.extend_from_slice(&encode(Frame::Settings(SettingsFrame::ack())));
        conn.feed_data(&input).unwrap();
        conn.shared().take_output();
        conn
    }

    #[test]
    fn test_preface_then_settings() {
        let mut conn = ServerConnection::new(Settings::server(), ConnectionOptions::default());
        conn.feed_data(&frame::CONNECTION_PREFACE[..10]).unwrap();
        assert!(conn.shared().take_output().is_empty());

        conn.feed_data(&frame::CONNECTION_PREFACE[10..]).unwrap();
        let out = frames(conn.shared().take_output());
        let Frame::Settings(settings) = &out[0] else {
            panic!("expected SETTINGS, got {out:?}");
        };
        assert!(!settings.ack);
        assert_eq!(settings.settings, Settings::server().diff(&Settings::default()));
        assert_eq!(conn.pending_settings(), 1);

        conn.feed_data(&encode(client_settings(vec![]))).unwrap();
        let out = frames(conn.shared().take_output());
        assert_eq!(out, vec![Frame::Settings(SettingsFrame::ack())]);

        conn.feed_data(&encode(Frame::Settings(SettingsFrame::ack())))
            .unwrap();
        assert_eq!(conn.pending_settings(), 0);
        assert_eq!(conn.local_settings(), &Settings::server());
    }

    #[test]
    fn test_invalid_preface() {
        let mut conn = ServerConnection::new(Settings::server(), ConnectionOptions::default());
        let err = conn.feed_data(b"GET / HTTP/1.1\r\n").unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_first_frame_must_be_settings() {
        let mut conn = ServerConnection::new(Settings::server(), ConnectionOptions::default());
        let mut input = BytesMut::from(frame::CONNECTION_PREFACE);
        input.extend_from_slice(&encode(Frame::Ping(PingFrame {
            ack: false,
            data: [0; 8],
        })));
        assert!(conn.feed_data(&input).is_err());
    }

    #[test]
    fn test_unexpected_settings_ack() {
        let mut conn = open();
        let err = conn
            .feed_data(&encode(Frame::Settings(SettingsFrame::ack())))
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
        let out = frames(conn.shared().take_output());
        assert!(matches!(&out[..], [Frame::GoAway(g)] if g.error_code == 0x1));
    }

    #[test]
    fn test_ping_is_echoed() {
        let mut conn = open();
        conn.feed_data(&encode(Frame::Ping(PingFrame {
            ack: false,
            data: *b"12345678",
        })))
        .unwrap();
        let out = frames(conn.shared().take_output());
        assert_eq!(
            out,
            vec![Frame::Ping(PingFrame {
                ack: true,
                data: *b"12345678"
            })]
        );
    }

    #[test]
    fn test_request_event() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[HeaderField::new("accept", "*/*")]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();

        let events = conn.poll_events();
        let [ServerEvent::Request { head, end_stream }] = &events[..] else {
            panic!("expected request, got {events:?}");
        };
        assert!(end_stream);
        assert_eq!(head.method, "GET");
        assert_eq!(head.headers.get_str("accept"), Some("*/*"));
        assert_eq!(conn.shared().active_streams(), 1);
        assert_eq!(
            conn.shared().stream(StreamId(1)).unwrap().state(),
            StreamState::HalfClosedRemote
        );
    }

    #[test]
    fn test_duplicate_method_resets_only_that_stream() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let bad = request_block(&mut hpack, &[HeaderField::new(":method", "POST")]);
        // pseudo-header after the others is still a duplicate
        conn.feed_data(&encode(headers(1, bad, true))).unwrap();
        let out = frames(conn.shared().take_output());
        assert_eq!(
            out,
            vec![Frame::RstStream(RstStreamFrame {
                stream_id: StreamId(1),
                error_code: ErrorCode::ProtocolError.to_u32()
            })]
        );
        assert_eq!(conn.state(), ConnectionState::Open);

        let good = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(3, good, true))).unwrap();
        let events = conn.poll_events();
        assert!(matches!(
            &events[..],
            [
                ServerEvent::StreamReset { .. },
                ServerEvent::Request { .. }
            ]
        ));
    }

    #[test]
    fn test_even_stream_id_is_connection_error() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        let err = conn.feed_data(&encode(headers(2, block, true))).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_decreasing_stream_id_is_connection_error() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(5, block, true))).unwrap();
        let block = request_block(&mut hpack, &[]);
        assert!(conn.feed_data(&encode(headers(3, block, true))).is_err());
    }

    #[test]
    fn test_refused_stream_over_limit() {
        let mut conn = ServerConnection::new(
            Settings::server().max_concurrent_streams(1),
            ConnectionOptions::default(),
        );
        let mut input = BytesMut::from(frame::CONNECTION_PREFACE);
        input.extend_from_slice(&encode(client_settings(vec![])));
        conn.feed_data(&input).unwrap();
        conn.shared().take_output();

        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(3, block, true))).unwrap();

        let out = frames(conn.shared().take_output());
        assert_eq!(
            out,
            vec![Frame::RstStream(RstStreamFrame {
                stream_id: StreamId(3),
                error_code: ErrorCode::RefusedStream.to_u32()
            })]
        );
        assert_eq!(conn.shared().active_streams(), 1);
    }

    #[test]
    fn test_data_and_content_length() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[HeaderField::new("content-length", "3")]);
        conn.feed_data(&encode(headers(1, block, false))).unwrap();
        conn.feed_data(&encode(Frame::Data(DataFrame {
            stream_id: StreamId(1),
            end_stream: true,
            data: Bytes::from_static(b"abc"),
            padding: 0,
        })))
        .unwrap();

        let events = conn.poll_events();
        assert!(matches!(
            &events[1],
            ServerEvent::Data { data, end_stream: true, .. } if data == "abc"
        ));

        let block = request_block(&mut hpack, &[HeaderField::new("content-length", "3")]);
        conn.feed_data(&encode(headers(3, block, false))).unwrap();
        conn.feed_data(&encode(Frame::Data(DataFrame {
            stream_id: StreamId(3),
            end_stream: true,
            data: Bytes::from_static(b"ab"),
            padding: 0,
        })))
        .unwrap();
        let out = frames(conn.shared().take_output());
        assert!(out.contains(&Frame::RstStream(RstStreamFrame {
            stream_id: StreamId(3),
            error_code: ErrorCode::ProtocolError.to_u32()
        })));
    }

    #[test]
    fn test_stream_receive_window_exceeded() {
        let mut conn = ServerConnection::new(
            Settings::server().initial_window_size(10),
            ConnectionOptions::default(),
        );
        let mut input = BytesMut::from(frame::CONNECTION_PREFACE);
        input.extend_from_slice(&encode(client_settings(vec![])));
        input.extend_from_slice(&encode(Frame::Settings(SettingsFrame::ack())));
        conn.feed_data(&input).unwrap();
        conn.shared().take_output();

        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, false))).unwrap();
        conn.feed_data(&encode(Frame::Data(DataFrame {
            stream_id: StreamId(1),
            end_stream: false,
            data: Bytes::from(vec![0u8; 11]),
            padding: 0,
        })))
        .unwrap();
        let out = frames(conn.shared().take_output());
        assert!(out.contains(&Frame::RstStream(RstStreamFrame {
            stream_id: StreamId(1),
            error_code: ErrorCode::FlowControlError.to_u32()
        })));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_window_update_zero() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();
        conn.shared().take_output();

        conn.feed_data(&encode(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: StreamId(1),
            increment: 0,
        })))
        .unwrap();
        let out = frames(conn.shared().take_output());
        assert!(matches!(&out[..], [Frame::RstStream(r)] if r.error_code == 0x1));
        assert_eq!(conn.state(), ConnectionState::Open);

        let err = conn
            .feed_data(&encode(Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId(0),
                increment: 0,
            })))
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_window_update_for_closed_stream_ignored() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();
        conn.feed_data(&encode(Frame::RstStream(RstStreamFrame {
            stream_id: StreamId(1),
            error_code: ErrorCode::Cancel.to_u32(),
        })))
        .unwrap();
        conn.shared().take_output();
        conn.feed_data(&encode(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: StreamId(1),
            increment: 100,
        })))
        .unwrap();
        assert!(conn.shared().take_output().is_empty());
    }

    #[test]
    fn test_connection_window_overflow() {
        let mut conn = open();
        let err = conn
            .feed_data(&encode(Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId(0),
                increment: frame::MAX_WINDOW_SIZE,
            })))
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FlowControlError);
    }

    #[test]
    fn test_initial_window_change_adjusts_streams() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();
        let stream = conn.shared().stream(StreamId(1)).unwrap();
        assert_eq!(stream.outgoing().available(), 65_535);

        conn.feed_data(&encode(client_settings(vec![Setting {
            id: SettingId::InitialWindowSize,
            value: 1_000,
        }])))
        .unwrap();
        assert_eq!(stream.outgoing().available(), 1_000);
    }

    #[test]
    fn test_stream_writer_sends_response() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();

        let mut writer = conn.writer(StreamId(1)).unwrap();
        let mut head = HeaderBlock::new();
        head.insert("Content-Type", "text/plain").unwrap();
        head.insert("Connection", "close").unwrap();
        writer.send_headers(200, &head, false).unwrap();
        writer.send_data(Bytes::from_static(b"hello"), true).unwrap();
        assert_eq!(writer.state(), StreamState::Closed);
        drop(writer);
        assert_eq!(conn.shared().active_streams(), 0);

        let out = frames(conn.shared().take_output());
        let Frame::Headers(h) = &out[0] else {
            panic!("expected HEADERS");
        };
        let fields = HpackDecoder::default().decode(&h.header_block).unwrap();
        assert_eq!(
            fields,
            vec![
                HeaderField::new(":status", "200"),
                HeaderField::new("content-type", "text/plain"),
            ]
        );
        assert!(matches!(&out[1], Frame::Data(d) if d.end_stream && d.data == "hello"));
        assert_eq!(conn.shared().send_window().available(), 65_535 - 5);
    }

    #[test]
    fn test_send_data_splits_by_frame_size() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();
        conn.shared().take_output();

        let mut writer = conn.writer(StreamId(1)).unwrap();
        writer.send_data(vec![7u8; 40_000], true).unwrap();
        let out = frames(conn.shared().take_output());
        let sizes: Vec<usize> = out
            .iter()
            .map(|f| match f {
                Frame::Data(d) => d.data.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![16_384, 16_384, 7_232]);
    }

    #[test]
    fn test_dropped_writer_cancels_stream() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();
        conn.shared().take_output();

        drop(conn.writer(StreamId(1)).unwrap());
        let out = frames(conn.shared().take_output());
        assert_eq!(
            out,
            vec![Frame::RstStream(RstStreamFrame {
                stream_id: StreamId(1),
                error_code: ErrorCode::Cancel.to_u32()
            })]
        );
        assert_eq!(conn.shared().active_streams(), 0);
    }

    #[test]
    fn test_goaway_drain() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, true))).unwrap();
        conn.shutdown().unwrap();
        assert_eq!(conn.state(), ConnectionState::HalfClosedLocal);

        let out = frames(conn.shared().take_output());
        assert!(matches!(
            &out[..],
            [Frame::GoAway(g)] if g.last_stream_id == StreamId(1) && g.error_code == 0
        ));

        // a new stream after GOAWAY is read and discarded
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(3, block, true))).unwrap();
        assert_eq!(conn.poll_events().len(), 1);
        assert_eq!(conn.shared().active_streams(), 1);

        // the in-flight stream finishes, then the connection closes
        let mut writer = conn.writer(StreamId(1)).unwrap();
        writer.send_headers(204, &HeaderBlock::new(), true).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.shared().wait_closed(Duration::ZERO));
    }

    fn data(stream_id: u32, len: usize, end_stream: bool) -> Frame {
        Frame::Data(DataFrame {
            stream_id: StreamId(stream_id),
            end_stream,
            data: Bytes::from(vec![b'x'; len]),
            padding: 0,
        })
    }

    #[test]
    fn test_goaway_drain_discards_frames_above_last_id() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, false))).unwrap();
        conn.shutdown().unwrap();
        conn.shared().take_output();
        conn.poll_events();

        // stream 3 is above the announced last id: every frame for it is dropped
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(3, block, false))).unwrap();
        conn.feed_data(&encode(data(3, 100, false))).unwrap();
        conn.feed_data(&encode(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: StreamId(3),
            increment: 10,
        })))
        .unwrap();
        conn.feed_data(&encode(Frame::RstStream(RstStreamFrame {
            stream_id: StreamId(3),
            error_code: ErrorCode::Cancel.to_u32(),
        })))
        .unwrap();
        assert!(conn.poll_events().is_empty());
        assert!(
            !frames(conn.shared().take_output())
                .iter()
                .any(|f| matches!(f, Frame::GoAway(_) | Frame::RstStream(_)))
        );

        // the in-flight stream still completes
        assert_eq!(conn.state(), ConnectionState::HalfClosedLocal);
        conn.feed_data(&encode(data(1, 5, true))).unwrap();
        assert!(matches!(
            &conn.poll_events()[..],
            [ServerEvent::Data { end_stream: true, .. }]
        ));
        let mut writer = conn.writer(StreamId(1)).unwrap();
        writer.send_headers(200, &HeaderBlock::new(), true).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_receive_credit_withheld_until_released() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, false))).unwrap();

        for _ in 0..4 {
            conn.feed_data(&encode(data(1, 16_000, false))).unwrap();
        }
        // nothing consumed yet, so no credit goes back
        assert!(
            !frames(conn.shared().take_output())
                .iter()
                .any(|f| matches!(f, Frame::WindowUpdate(_)))
        );
        assert_eq!(conn.poll_events().len(), 5);

        conn.release(StreamId(1), 64_000).unwrap();
        let out = frames(conn.shared().take_output());
        for id in [StreamId::CONNECTION, StreamId(1)] {
            assert!(out.contains(&Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: id,
                increment: 64_000,
            })));
        }
        conn.feed_data(&encode(data(1, 16_000, false))).unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_unread_data_exhausts_connection_window() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, false))).unwrap();

        for _ in 0..4 {
            conn.feed_data(&encode(data(1, 16_000, false))).unwrap();
        }
        let err = conn.feed_data(&encode(data(1, 16_000, false))).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FlowControlError);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_update_settings_after_handshake() {
        let mut conn = open();
        conn.update_settings(Settings::server().max_concurrent_streams(10))
            .unwrap();
        assert_eq!(conn.pending_settings(), 1);
        let out = frames(conn.shared().take_output());
        assert!(matches!(
            &out[..],
            [Frame::Settings(s)] if !s.ack && s.settings.len() == 1
        ));

        conn.feed_data(&encode(Frame::Settings(SettingsFrame::ack())))
            .unwrap();
        assert_eq!(conn.pending_settings(), 0);
        assert_eq!(conn.local_settings().max_concurrent_streams, 10);
    }

    #[test]
    fn test_received_goaway() {
        let mut conn = open();
        conn.feed_data(&encode(Frame::GoAway(GoAwayFrame {
            last_stream_id: StreamId(0),
            error_code: 0,
            debug_data: Bytes::from_static(b"bye"),
        })))
        .unwrap();
        let events = conn.poll_events();
        assert!(matches!(
            &events[..],
            [ServerEvent::GoAway { debug_data, .. }] if debug_data == "bye"
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_continuation_reassembly() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[HeaderField::new("x-long", "v".repeat(100))]);
        let (first, rest) = block.split_at(5);
        let mut input = encode(Frame::Headers(HeadersFrame {
            stream_id: StreamId(1),
            end_stream: true,
            end_headers: false,
            priority: None,
            header_block: Bytes::copy_from_slice(first),
        }));
        input.extend_from_slice(&encode(Frame::Continuation(frame::ContinuationFrame {
            stream_id: StreamId(1),
            end_headers: true,
            header_block: Bytes::copy_from_slice(rest),
        })));
        conn.feed_data(&input).unwrap();
        let events = conn.poll_events();
        assert!(matches!(&events[..], [ServerEvent::Request { .. }]));
    }

    #[test]
    fn test_trailers_end_request() {
        let mut conn = open();
        let mut hpack = HpackEncoder::default();
        let block = request_block(&mut hpack, &[]);
        conn.feed_data(&encode(headers(1, block, false))).unwrap();

        let mut trailer_block = Vec::new();
        hpack.encode(&[HeaderField::new("x-checksum", "abc")], &mut trailer_block);
        conn.feed_data(&encode(headers(1, Bytes::from(trailer_block), true)))
            .unwrap();
        let events = conn.poll_events();
        assert!(matches!(
            &events[1],
            ServerEvent::Trailers { trailers, .. } if trailers.get_str("x-checksum") == Some("abc")
        ));
    }
}

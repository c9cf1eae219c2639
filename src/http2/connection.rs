//! Connection-level HTTP/2 orchestration (RFC 7540 §5, §6): frame read/write
//! loop, stream table, connection-level flow control and SETTINGS exchange.
//!
//! Laid out the same way [`crate::server::connection::HttpConnection`] is:
//! one context per worker, reused connection-to-connection, driving a single
//! handler call per request to completion before the next frame is
//! dispatched. Frames from different streams may still interleave on the
//! wire (that's what multiplexing means at this layer) but handler
//! invocation itself stays strictly serial, matching the reference crate's
//! one-task-per-worker model rather than racing concurrent handler futures.

use crate::buffer::{BufferError, InputBuffer, OutputBuffer};
use crate::http2::frame::{ErrorCode, Frame, FrameError, FrameHeader, FrameType, FRAME_HEADER_LEN};
use crate::http2::hpack::{HpackDecoder, HpackEncoder};
use crate::http2::settings::Settings;
use crate::http2::stream::{Http2Stream, StreamError};
use crate::http2::CONNECTION_PREFACE;
use crate::limits::{Http2Limits, ReqLimits, RespLimits};
use crate::pool::ContextPool;
use crate::server::server_impl::Handler;
use crate::{ConnectionData, Handled};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Connection-scoped error, raised deep inside frame handling and turned
/// into the right wire response (GOAWAY or RST_STREAM) centrally in
/// [`Http2Connection::run`], rather than every call site writing frames
/// itself.
#[derive(Debug)]
enum Http2Error {
    Io(io::Error),
    Connection(ErrorCode),
    Stream(u32, ErrorCode),
}

impl From<io::Error> for Http2Error {
    fn from(e: io::Error) -> Self {
        Http2Error::Io(e)
    }
}

impl From<FrameError> for Http2Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::FrameSizeError => Http2Error::Connection(ErrorCode::FrameSizeError),
            FrameError::ProtocolError => Http2Error::Connection(ErrorCode::ProtocolError),
            FrameError::InvalidStreamId => Http2Error::Connection(ErrorCode::ProtocolError),
            FrameError::InvalidSettingsFrame => Http2Error::Connection(ErrorCode::FrameSizeError),
        }
    }
}

// SAFETY: callers only use this to hand header/body bytes owned by an
// `Http2Stream` to its own `Request`, which never outlives the stream - the
// stream stays in `self.streams` untouched until `close_stream` resets it,
// which happens only after the handler call and response write complete.
// Same contract as `Parser::into_static` for the HTTP/1.x path.
#[inline(always)]
unsafe fn into_static(src: &[u8]) -> &'static [u8] {
    unsafe { std::mem::transmute(src) }
}

/// Renders a 3-digit HTTP status as ASCII without allocating, for HPACK
/// `:status` encoding.
#[inline]
fn status_digits(code: u16) -> [u8; 3] {
    [
        b'0' + (code / 100 % 10) as u8,
        b'0' + (code / 10 % 10) as u8,
        b'0' + (code % 10) as u8,
    ]
}

pub(crate) struct Http2Connection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    connection_data: S,

    streams: HashMap<u32, Http2Stream>,
    /// Idle `Http2Stream` contexts, reset and ready for the next stream id on
    /// this connection. The pool's own reset closure is a no-op - checkout
    /// always seeds the reused context via [`Http2Stream::reset`] with the
    /// new stream's id and the connection's *current* settings, neither of
    /// which a reset closure fixed at construction could supply.
    free_streams: ContextPool<Http2Stream>,
    highest_peer_stream_id: u32,

    local_settings: Settings,
    peer_settings: Settings,
    local_settings_acked: bool,

    conn_send_window: i64,
    conn_recv_window: i64,
    /// Bytes freed from `conn_recv_window` since the last connection-level
    /// WINDOW_UPDATE we sent, batched so we don't emit one per DATA frame.
    conn_recv_window_pending: i64,

    hpack_decoder: HpackDecoder,
    hpack_encoder: HpackEncoder,

    /// Stream id of a HEADERS/PUSH_PROMISE block still waiting on
    /// END_HEADERS. RFC 7540 §4.3 forbids any other frame type from
    /// interleaving until the matching CONTINUATION arrives.
    assembling_headers: Option<u32>,
    goaway_sent: bool,

    input: InputBuffer,
    output: OutputBuffer,
    /// Preallocated socket-read scratch. Kept off the stack so the `run`
    /// future's generated state doesn't carry a fresh array across every
    /// `.await` point it's captured over.
    read_scratch: Box<[u8]>,

    http2_limits: Http2Limits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
}

impl<H: Handler<S>, S: ConnectionData> Http2Connection<H, S> {
    pub(crate) fn new(
        handler: Arc<H>,
        http2_limits: Http2Limits,
        req_limits: ReqLimits,
        resp_limits: RespLimits,
    ) -> Self {
        let mut local_settings = Settings::default();
        local_settings.initial_window_size = http2_limits.initial_window_size;
        local_settings.max_frame_size = http2_limits.max_frame_size;
        local_settings.max_concurrent_streams = Some(http2_limits.max_concurrent_streams);
        local_settings.max_header_list_size = Some(http2_limits.max_header_list_size);
        local_settings.enable_push = false;

        let buffer_capacity = (http2_limits.max_frame_size as usize + FRAME_HEADER_LEN) * 2;

        let pool_req_limits = req_limits.clone();
        let pool_resp_limits = resp_limits.clone();
        let pool_max_header_list_size = http2_limits.max_header_list_size as usize;
        let pool_initial_window_size = http2_limits.initial_window_size;
        let free_streams = ContextPool::new(
            http2_limits.max_concurrent_streams as usize,
            move || {
                Http2Stream::new(
                    0,
                    pool_initial_window_size,
                    pool_max_header_list_size,
                    &pool_req_limits,
                    &pool_resp_limits,
                )
            },
            |_| {},
        );

        Self {
            handler,
            connection_data: S::new(),

            streams: HashMap::new(),
            free_streams,
            highest_peer_stream_id: 0,

            local_settings,
            peer_settings: Settings::default(),
            local_settings_acked: false,

            conn_send_window: crate::http2::settings::DEFAULT_INITIAL_WINDOW_SIZE as i64,
            conn_recv_window: crate::http2::settings::DEFAULT_INITIAL_WINDOW_SIZE as i64,
            conn_recv_window_pending: 0,

            hpack_decoder: HpackDecoder::new(4096),
            hpack_encoder: HpackEncoder::new(),

            assembling_headers: None,
            goaway_sent: false,

            input: InputBuffer::new(buffer_capacity),
            output: OutputBuffer::new(buffer_capacity, buffer_capacity * 4),
            read_scratch: vec![0u8; buffer_capacity].into_boxed_slice(),

            http2_limits,
            req_limits,
            resp_limits,
        }
    }

    fn reset(&mut self) {
        self.streams.clear();
        self.free_streams.clear();
        self.highest_peer_stream_id = 0;

        self.peer_settings = Settings::default();
        self.local_settings_acked = false;
        self.conn_send_window = crate::http2::settings::DEFAULT_INITIAL_WINDOW_SIZE as i64;
        self.conn_recv_window = crate::http2::settings::DEFAULT_INITIAL_WINDOW_SIZE as i64;
        self.conn_recv_window_pending = 0;
        self.hpack_decoder = HpackDecoder::new(4096);
        self.hpack_encoder = HpackEncoder::new();
        self.assembling_headers = None;
        self.goaway_sent = false;
        self.input.reset();
        self.output.reset();
        self.connection_data.reset();
    }

    /// Drives one h2c connection to completion: consumes the already-peeked
    /// preface bytes from `preface`, exchanges initial SETTINGS, then loops
    /// reading/dispatching frames until the peer disconnects or a connection
    /// error forces a GOAWAY.
    pub(crate) async fn run(
        &mut self,
        stream: &mut TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<(), io::Error> {
        self.run_from(stream, client_addr, server_addr, &[]).await
    }

    /// Like [`run`](Self::run), but seeds the connection's input with bytes
    /// a caller already pulled off the socket before recognizing the h2c
    /// preface (see [`crate::server::connection::HttpConnection`]'s upgrade
    /// sniff, which peeks the first read before any HTTP/1.x parsing).
    pub(crate) async fn run_from(
        &mut self,
        stream: &mut TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        prefix: &[u8],
    ) -> Result<(), io::Error> {
        self.reset();
        let _ = (client_addr, server_addr);

        if !prefix.is_empty() && self.input.extend(prefix).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "h2c preface prefix exceeds connection buffer",
            ));
        }

        match self.impl_run(stream).await {
            Ok(()) => Ok(()),
            Err(Http2Error::Io(e)) => Err(e),
            Err(Http2Error::Connection(code)) => {
                self.send_goaway(stream, code).await?;
                Ok(())
            }
            Err(Http2Error::Stream(id, code)) => {
                self.send_rst_stream(stream, id, code).await?;
                Ok(())
            }
        }
    }

    async fn impl_run(&mut self, stream: &mut TcpStream) -> Result<(), Http2Error> {
        self.read_exact_preface(stream).await?;

        Frame::Settings {
            ack: false,
            params: self.local_settings.to_params(),
        }
        .serialize(&mut self.output);
        self.flush_output(stream).await?;

        loop {
            if self.goaway_sent {
                return Ok(());
            }

            let n = self.fill_input(stream).await?;
            if n == 0 {
                return Ok(());
            }

            while self.try_dispatch_one(stream).await? {}
            self.flush_output(stream).await?;

            if self.streams.len() + self.free_streams.idle_len() > self.http2_limits.max_concurrent_streams_total {
                return Err(Http2Error::Connection(ErrorCode::EnhanceYourCalm));
            }
        }
    }

    /// Reads the fixed 24-byte client preface. The caller (the server's
    /// dispatch loop) has already peeked enough of it to decide this is an
    /// h2c connection, but hasn't consumed it from the socket.
    async fn read_exact_preface(&mut self, stream: &mut TcpStream) -> Result<(), Http2Error> {
        self.input.mark();
        loop {
            match self.input.peek_slice(CONNECTION_PREFACE.len()) {
                Ok(got) => {
                    if got != CONNECTION_PREFACE {
                        self.input.unmark();
                        return Err(Http2Error::Connection(ErrorCode::ProtocolError));
                    }
                    self.input.unmark();
                    self.input.skip(CONNECTION_PREFACE.len()).ok();
                    return Ok(());
                }
                Err(BufferError::NeedMore) => {
                    self.input.reset_to_mark();
                    self.input.mark();
                    if self.fill_input(stream).await? == 0 {
                        return Err(Http2Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed during preface",
                        )));
                    }
                }
                Err(BufferError::Overflow) => {
                    return Err(Http2Error::Connection(ErrorCode::ProtocolError));
                }
            }
        }
    }

    /// Reads more bytes into `self.input`, bounded by `settings_timeout`
    /// until our SETTINGS has been acked and by `idle_timeout` afterwards.
    async fn fill_input(&mut self, stream: &mut TcpStream) -> Result<usize, Http2Error> {
        let bound = if self.local_settings_acked {
            self.http2_limits.idle_timeout
        } else {
            self.http2_limits.settings_timeout
        };
        let read = match timeout(bound, stream.read(&mut self.read_scratch)).await {
            Ok(result) => result?,
            Err(_) if self.local_settings_acked => return Ok(0),
            Err(_) => return Err(Http2Error::Connection(ErrorCode::SettingsTimeout)),
        };
        if read == 0 {
            self.input.mark_eof();
            return Ok(0);
        }
        self.input
            .extend(&self.read_scratch[..read])
            .map_err(|_| Http2Error::Connection(ErrorCode::FrameSizeError))?;
        Ok(read)
    }

    /// Attempts to parse and handle exactly one frame from whatever is
    /// currently staged in `self.input`. Returns `Ok(true)` if a frame was
    /// handled (so the caller should try again immediately - more may
    /// already be buffered), `Ok(false)` if more bytes must be read first.
    async fn try_dispatch_one(&mut self, stream: &mut TcpStream) -> Result<bool, Http2Error> {
        self.input.mark();

        let header = match FrameHeader::parse(&mut self.input) {
            Ok(header) => header,
            Err(BufferError::NeedMore) => {
                self.input.reset_to_mark();
                return Ok(false);
            }
            Err(BufferError::Overflow) => return Err(Http2Error::Connection(ErrorCode::FrameSizeError)),
        };

        if header.length > self.local_settings.max_frame_size {
            return Err(Http2Error::Connection(ErrorCode::FrameSizeError));
        }
        if let Some(expected) = self.assembling_headers {
            if header.frame_type != FrameType::Continuation || header.stream_id != expected {
                return Err(Http2Error::Connection(ErrorCode::ProtocolError));
            }
        }

        let payload = match self.input.take_slice(header.length as usize) {
            Ok(slice) => slice,
            Err(BufferError::NeedMore) => {
                self.input.reset_to_mark();
                return Ok(false);
            }
            Err(BufferError::Overflow) => return Err(Http2Error::Connection(ErrorCode::FrameSizeError)),
        };
        self.input.unmark();

        let frame = match Frame::parse(&header, payload)? {
            Some(frame) => frame,
            None => return Ok(true),
        };

        match self.handle_frame(stream, frame).await {
            Ok(()) => Ok(true),
            Err(Http2Error::Stream(id, code)) => {
                self.send_rst_stream(stream, id, code).await?;
                self.close_stream(id);
                Ok(true)
            }
            Err(other) => Err(other),
        }
    }

    async fn handle_frame(&mut self, stream: &mut TcpStream, frame: Frame) -> Result<(), Http2Error> {
        match frame {
            Frame::Settings { ack, params } => self.handle_settings(ack, params)?,
            Frame::Ping { ack, opaque } => {
                if !ack {
                    Frame::Ping { ack: true, opaque }.serialize(&mut self.output);
                }
            }
            Frame::WindowUpdate { stream_id, increment } => {
                self.handle_window_update(stream_id, increment)?;
            }
            Frame::GoAway { .. } => {
                self.goaway_sent = true;
            }
            Frame::Priority { .. } => {}
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                priority: _,
                header_block,
            } => {
                self.handle_headers(stream, stream_id, end_stream, end_headers, header_block)
                    .await?;
            }
            Frame::Continuation {
                stream_id,
                end_headers,
                header_block,
            } => {
                self.handle_continuation(stream, stream_id, end_headers, header_block)
                    .await?;
            }
            Frame::Data {
                stream_id,
                end_stream,
                data,
            } => {
                self.handle_data(stream, stream_id, end_stream, data).await?;
            }
            Frame::PushPromise { .. } => {
                return Err(Http2Error::Connection(ErrorCode::ProtocolError));
            }
            Frame::RstStream { stream_id, .. } => {
                self.close_stream(stream_id);
            }
        }
        Ok(())
    }

    fn handle_settings(&mut self, ack: bool, params: Vec<(u16, u32)>) -> Result<(), Http2Error> {
        if ack {
            self.local_settings_acked = true;
            return Ok(());
        }

        let previous_window = self.peer_settings.initial_window_size;
        for (id, value) in params {
            self.peer_settings
                .apply(id, value)
                .map_err(Self::map_settings_error)?;
        }
        if self.peer_settings.initial_window_size != previous_window {
            let delta =
                self.peer_settings.initial_window_size as i64 - previous_window as i64;
            for st in self.streams.values_mut() {
                st.adjust_send_window(delta)
                    .map_err(|_| Http2Error::Connection(ErrorCode::FlowControlError))?;
            }
        }

        Frame::Settings { ack: true, params: Vec::new() }.serialize(&mut self.output);
        Ok(())
    }

    fn map_settings_error(e: crate::http2::settings::SettingsError) -> Http2Error {
        use crate::http2::settings::SettingsError;
        match e {
            SettingsError::InvalidEnablePush => Http2Error::Connection(ErrorCode::ProtocolError),
            SettingsError::InvalidInitialWindowSize => Http2Error::Connection(ErrorCode::FlowControlError),
            SettingsError::InvalidMaxFrameSize => Http2Error::Connection(ErrorCode::ProtocolError),
        }
    }

    fn handle_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), Http2Error> {
        if stream_id == 0 {
            self.conn_send_window = self
                .conn_send_window
                .checked_add(increment as i64)
                .filter(|w| *w <= crate::http2::settings::MAX_WINDOW_SIZE as i64)
                .ok_or(Http2Error::Connection(ErrorCode::FlowControlError))?;

            let paused: Vec<u32> = self
                .streams
                .iter()
                .filter(|(_, st)| st.has_pending_response())
                .map(|(id, _)| *id)
                .collect();
            for id in paused {
                self.send_pending_data(id);
                if self.streams.get(&id).is_some_and(|st| st.is_closed()) {
                    self.close_stream(id);
                }
            }
            return Ok(());
        }

        if let Some(st) = self.streams.get_mut(&stream_id) {
            st.apply_window_update(increment)
                .map_err(|_| Http2Error::Stream(stream_id, ErrorCode::FlowControlError))?;
        } else if stream_id > self.highest_peer_stream_id {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        } else {
            // Stream already closed, WINDOW_UPDATE for it is ignored.
            return Ok(());
        }

        self.send_pending_data(stream_id);
        if self.streams.get(&stream_id).is_some_and(|st| st.is_closed()) {
            self.close_stream(stream_id);
        }
        Ok(())
    }

    async fn handle_headers(
        &mut self,
        stream: &mut TcpStream,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        header_block: Vec<u8>,
    ) -> Result<(), Http2Error> {
        if stream_id % 2 == 0 || stream_id <= self.highest_peer_stream_id {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        }
        self.highest_peer_stream_id = stream_id;

        if self.streams.len() >= self.http2_limits.max_concurrent_streams as usize {
            return Err(Http2Error::Stream(stream_id, ErrorCode::RefusedStream));
        }

        let mut st = self.checkout_stream(stream_id);
        let result = st.on_headers(&header_block, end_headers, end_stream);
        self.streams.insert(stream_id, st);
        result.map_err(|e| Self::stream_error(stream_id, e))?;

        if !end_headers {
            self.assembling_headers = Some(stream_id);
            return Ok(());
        }

        self.finish_headers(stream, stream_id).await
    }

    async fn handle_continuation(
        &mut self,
        stream: &mut TcpStream,
        stream_id: u32,
        end_headers: bool,
        header_block: Vec<u8>,
    ) -> Result<(), Http2Error> {
        let Some(st) = self.streams.get_mut(&stream_id) else {
            return Err(Http2Error::Connection(ErrorCode::ProtocolError));
        };
        st.on_continuation(&header_block, end_headers)
            .map_err(|e| Self::stream_error(stream_id, e))?;

        if !end_headers {
            return Ok(());
        }
        self.assembling_headers = None;
        self.finish_headers(stream, stream_id).await
    }

    /// HPACK-decodes the now-complete header block and, once the request is
    /// fully available (no body expected, or body already arrived), invokes
    /// the handler.
    async fn finish_headers(&mut self, stream: &mut TcpStream, stream_id: u32) -> Result<(), Http2Error> {
        self.assembling_headers = None;
        let block = {
            let st = self.streams.get_mut(&stream_id).expect("stream just inserted");
            st.take_header_block()
        };

        let decoded = self
            .hpack_decoder
            .decode(&block)
            .map_err(|_| Http2Error::Connection(ErrorCode::CompressionError))?;

        let st = self.streams.get_mut(&stream_id).expect("stream just inserted");
        st.set_decoded_headers(
            decoded
                .into_iter()
                .map(|(n, v)| (n.into_boxed_slice(), v.into_boxed_slice()))
                .collect(),
        );

        if st.end_stream_received {
            self.complete_and_handle(stream, stream_id).await?;
        }
        Ok(())
    }

    /// Accounts `n` bytes freed from the connection-level receive window,
    /// emitting a connection WINDOW_UPDATE once at least half the initial
    /// window has been freed. Mirrors [`Http2Stream::on_body_consumed`]:
    /// `conn_recv_window` is restored by the increment we grant, never
    /// drained to zero by it.
    fn replenish_conn_recv_window(&mut self, n: usize) {
        self.conn_recv_window_pending += n as i64;
        let threshold = self.local_settings.initial_window_size as i64 / 2;
        if self.conn_recv_window_pending >= threshold && self.conn_recv_window_pending > 0 {
            let increment = self
                .conn_recv_window_pending
                .min(crate::http2::settings::MAX_WINDOW_SIZE as i64) as u32;
            self.conn_recv_window_pending -= increment as i64;
            self.conn_recv_window += increment as i64;
            Frame::WindowUpdate { stream_id: 0, increment }.serialize(&mut self.output);
        }
    }

    async fn handle_data(
        &mut self,
        stream: &mut TcpStream,
        stream_id: u32,
        end_stream: bool,
        data: Vec<u8>,
    ) -> Result<(), Http2Error> {
        self.conn_recv_window -= data.len() as i64;
        if self.conn_recv_window < 0 {
            return Err(Http2Error::Connection(ErrorCode::FlowControlError));
        }

        let Some(st) = self.streams.get_mut(&stream_id) else {
            if stream_id > self.highest_peer_stream_id {
                return Err(Http2Error::Connection(ErrorCode::ProtocolError));
            }
            // Stream already closed on our side: still the peer's bytes
            // against the connection window, or credit leaks to zero over
            // the life of the connection.
            self.replenish_conn_recv_window(data.len());
            return Ok(());
        };
        let data_len = data.len();
        st.on_data(&data, end_stream)
            .map_err(|e| Self::stream_error(stream_id, e))?;

        if let Some(update) = st.on_body_consumed(data_len, self.local_settings.initial_window_size) {
            update.serialize(&mut self.output);
        }
        self.replenish_conn_recv_window(data_len);

        if st.end_stream_received && st.headers_complete() {
            self.complete_and_handle(stream, stream_id).await?;
        }
        Ok(())
    }

    /// Builds the `Request` from the stream's decoded headers/body, calls
    /// the handler, and HPACK-encodes/sends the response.
    async fn complete_and_handle(&mut self, stream: &mut TcpStream, stream_id: u32) -> Result<(), Http2Error> {
        let st = self.streams.get_mut(&stream_id).expect("stream just inserted");

        // SAFETY: the byte storage referenced here (`decoded_headers` and
        // `body`) lives inside this same `Http2Stream`, which stays in
        // `self.streams` untouched until `close_stream` resets it - which
        // only happens after the handler call below and the response write
        // that follows have both completed. No reference outlives the data.
        let (method, path, headers, body): (
            &'static [u8],
            &'static [u8],
            Vec<(&'static [u8], &'static [u8])>,
            Option<&'static [u8]>,
        ) = {
            let mut method: &'static [u8] = b"";
            let mut path: &'static [u8] = b"";
            let mut headers = Vec::new();
            for (name, value) in st.decoded_headers() {
                let name_s = unsafe { into_static(name.as_ref()) };
                let value_s = unsafe { into_static(value.as_ref()) };
                match name_s {
                    b":method" => method = value_s,
                    b":path" => path = value_s,
                    b":scheme" | b":authority" => {}
                    _ => headers.push((name_s, value_s)),
                }
            }
            let body = if st.body.is_empty() {
                None
            } else {
                Some(unsafe { into_static(st.body.as_slice()) })
            };
            (method, path, headers, body)
        };

        if let Err(err) = st.request.set_http2(method, path, &headers, body, &self.req_limits) {
            let _ = err;
            return Err(Http2Error::Stream(stream_id, ErrorCode::ProtocolError));
        }

        let handled: Handled = self
            .handler
            .handle(&mut self.connection_data, &st.request, &mut st.response)
            .await;
        let _ = handled;

        self.send_response(stream_id).await?;
        self.flush_output(stream).await?;
        if self.streams.get(&stream_id).is_some_and(|st| st.is_closed()) {
            self.close_stream(stream_id);
        }
        Ok(())
    }

    /// Sends the response HEADERS (once) and as much of the body as the
    /// stream and connection send windows currently allow. If the body
    /// doesn't fully fit under the windows, the stream stays half-closed
    /// (remote) with the remainder queued; [`handle_window_update`] resumes
    /// it once the peer grants more credit.
    async fn send_response(&mut self, stream_id: u32) -> Result<(), Http2Error> {
        let st = self.streams.get_mut(&stream_id).expect("stream just inserted");

        if !st.headers_sent {
            let status = st.response.h2_status().unwrap_or(crate::StatusCode::Ok);
            let digits = status_digits(status.as_u16());
            let extra: Vec<(&[u8], &[u8])> = st
                .response
                .h2_headers()
                .iter()
                .map(|(n, v)| (n.as_ref(), v.as_ref()))
                .collect();
            let header_block = self.hpack_encoder.encode_response(&digits, &extra);
            let has_body = !st.response.buffer().is_empty();

            Frame::Headers {
                stream_id,
                end_stream: !has_body,
                end_headers: true,
                priority: None,
                header_block,
            }
            .serialize(&mut self.output);
            st.headers_sent = true;

            if !has_body {
                st.mark_locally_closed();
                return Ok(());
            }
        }

        self.send_pending_data(stream_id);
        Ok(())
    }

    /// Emits queued response DATA for `stream_id` up to the stream's and
    /// the connection's current send window, respecting `max_frame_size`.
    /// Marks the stream locally closed once the body is fully flushed;
    /// otherwise leaves the remainder for a later WINDOW_UPDATE to unblock.
    fn send_pending_data(&mut self, stream_id: u32) {
        let max_frame = self.local_settings.max_frame_size as i64;
        loop {
            let st = self.streams.get_mut(&stream_id).expect("stream present while sending");
            let body_len = st.response.buffer().len();
            if st.response_offset >= body_len {
                st.mark_locally_closed();
                return;
            }

            let remaining = (body_len - st.response_offset) as i64;
            let allowed = st.send_window().min(self.conn_send_window).min(remaining).min(max_frame);
            if allowed <= 0 {
                return;
            }
            let chunk_len = allowed as usize;
            let start = st.response_offset;
            let end = start + chunk_len;
            let data = st.response.buffer()[start..end].to_vec();
            let end_stream = end == body_len;

            st.consume_send_window(chunk_len);
            self.conn_send_window -= chunk_len as i64;
            st.response_offset = end;

            Frame::Data { stream_id, end_stream, data }.serialize(&mut self.output);

            if end_stream {
                st.mark_locally_closed();
                return;
            }
        }
    }

    fn checkout_stream(&mut self, id: u32) -> Http2Stream {
        let mut st = self.free_streams.checkout();
        st.reset(id, self.local_settings.initial_window_size, &self.resp_limits);
        st
    }

    fn close_stream(&mut self, id: u32) {
        if let Some(mut st) = self.streams.remove(&id) {
            st.reset_by_error();
            self.free_streams.checkin(st);
        }
    }

    fn stream_error(stream_id: u32, e: StreamError) -> Http2Error {
        let code = match e {
            StreamError::UnexpectedFrame => ErrorCode::ProtocolError,
            StreamError::HeaderBlockTooLarge => ErrorCode::FrameSizeError,
            StreamError::FlowControlOverflow => ErrorCode::FlowControlError,
        };
        Http2Error::Stream(stream_id, code)
    }

    async fn flush_output(&mut self, stream: &mut TcpStream) -> Result<(), Http2Error> {
        if self.output.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;

            result = stream.write_all(self.output.as_slice()) => result?,
            _ = sleep(self.http2_limits.idle_timeout) => {
                return Err(Http2Error::Io(io::Error::new(io::ErrorKind::TimedOut, "write timeout")));
            }
        }
        self.output.reset();
        Ok(())
    }

    async fn send_goaway(&mut self, stream: &mut TcpStream, code: ErrorCode) -> Result<(), io::Error> {
        Frame::GoAway {
            last_stream_id: self.highest_peer_stream_id,
            error_code: code,
            debug_data: Vec::new(),
        }
        .serialize(&mut self.output);
        self.goaway_sent = true;
        let result = stream.write_all(self.output.as_slice()).await;
        self.output.reset();
        result
    }

    async fn send_rst_stream(&mut self, stream: &mut TcpStream, stream_id: u32, code: ErrorCode) -> Result<(), io::Error> {
        Frame::RstStream { stream_id, error_code: code }.serialize(&mut self.output);
        let result = stream.write_all(self.output.as_slice()).await;
        self.output.reset();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{Http2Limits, ReqLimits, RespLimits};
    use crate::{Handled, Request, Response, StatusCode};

    struct EchoHandler;

    impl Handler<()> for EchoHandler {
        async fn handle(&self, _: &mut (), req: &Request, resp: &mut Response) -> Handled {
            if req.url().path() == b"/" {
                resp.status(StatusCode::Ok).header("x-test", "1").body("hi")
            } else {
                resp.status(StatusCode::NotFound).body("nope")
            }
        }
    }

    fn new_conn() -> Http2Connection<EchoHandler, ()> {
        Http2Connection::new(
            Arc::new(EchoHandler),
            Http2Limits::default(),
            ReqLimits::default().precalculate(),
            RespLimits::default(),
        )
    }

    #[test]
    fn status_digits_renders_three_ascii_bytes() {
        assert_eq!(status_digits(200), *b"200");
        assert_eq!(status_digits(404), *b"404");
        assert_eq!(status_digits(101), *b"101");
    }

    #[test]
    fn fresh_connection_has_rfc_default_windows() {
        let conn = new_conn();
        assert_eq!(conn.conn_send_window, 65_535);
        assert_eq!(conn.conn_recv_window, 65_535);
        assert!(!conn.local_settings_acked);
    }

    #[test]
    fn checkout_and_close_stream_reuses_context() {
        let mut conn = new_conn();
        let st = conn.checkout_stream(1);
        conn.streams.insert(1, st);
        conn.close_stream(1);
        assert_eq!(conn.free_streams.idle_len(), 1);

        let st2 = conn.checkout_stream(3);
        assert_eq!(st2.id, 3);
        assert!(conn.free_streams.is_empty());
    }

    #[test]
    fn settings_ack_marks_local_settings_acked() {
        let mut conn = new_conn();
        conn.handle_settings(true, Vec::new()).unwrap();
        assert!(conn.local_settings_acked);
    }

    #[test]
    fn window_update_on_unknown_but_plausible_stream_is_ignored() {
        let mut conn = new_conn();
        conn.highest_peer_stream_id = 5;
        assert!(conn.handle_window_update(3, 100).is_ok());
    }

    #[test]
    fn window_update_on_never_opened_stream_is_protocol_error() {
        let mut conn = new_conn();
        conn.highest_peer_stream_id = 1;
        assert!(matches!(
            conn.handle_window_update(7, 100),
            Err(Http2Error::Connection(ErrorCode::ProtocolError))
        ));
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn connection_recv_window_survives_two_non_empty_data_frames() {
        // A body spanning two non-empty DATA frames must not trip the
        // connection's flow control on the second frame just because the
        // first one crossed the WINDOW_UPDATE threshold.
        let mut conn = new_conn();
        let mut st = conn.checkout_stream(1);
        st.state = crate::http2::stream::StreamState::Open;
        conn.streams.insert(1, st);
        conn.highest_peer_stream_id = 1;

        let (mut client, _server) = tcp_pair().await;

        let first = vec![0u8; 40_000];
        conn.handle_data(&mut client, 1, false, first).await.unwrap();
        assert!(conn.conn_recv_window >= 0);

        let second = vec![0u8; 20_000];
        conn.handle_data(&mut client, 1, false, second).await.unwrap();
        assert!(conn.conn_recv_window >= 0);
    }

    #[tokio::test]
    async fn data_for_closed_stream_replenishes_conn_recv_window() {
        // DATA on an already-closed stream is ignored at the stream level
        // but must not leak connection-level receive-window credit.
        let mut conn = new_conn();
        conn.highest_peer_stream_id = 5;
        let before = conn.conn_recv_window;

        let (mut client, _server) = tcp_pair().await;
        let data = vec![0u8; 1000];
        conn.handle_data(&mut client, 3, false, data).await.unwrap();

        assert_eq!(conn.conn_recv_window, before);
        assert_eq!(conn.conn_recv_window_pending, 0);
    }

    #[tokio::test]
    async fn send_response_pauses_on_exhausted_send_window_and_resumes() {
        let mut conn = new_conn();
        let mut st = conn.checkout_stream(1);
        // Remote already sent END_STREAM (the state `complete_and_handle`
        // hands off in); only our own response send remains.
        st.state = crate::http2::stream::StreamState::HalfClosedRemote;
        st.response.status(StatusCode::Ok).body(vec![b'x'; 100]);
        conn.streams.insert(1, st);

        // Shrink the stream's send window so the body can't go out in one shot.
        conn.streams.get_mut(&1).unwrap().adjust_send_window(-(65_535 - 40)).unwrap();

        conn.send_response(1).await.unwrap();
        {
            let st = conn.streams.get(&1).unwrap();
            assert!(st.headers_sent);
            assert_eq!(st.response_offset, 40);
            assert!(!st.is_closed());
        }

        conn.handle_window_update(1, 1000).unwrap();
        // The resumed send flushed the rest of the body, closed the stream,
        // and handed its context back to the pool.
        assert!(conn.streams.get(&1).is_none());
        assert_eq!(conn.free_streams.idle_len(), 1);
    }
}

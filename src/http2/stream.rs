//! Per-stream HTTP/2 state (RFC 7540 §5.1), header-block assembly across
//! HEADERS + CONTINUATION, and stream-level flow control accounting.

use crate::http2::frame::Frame;
use crate::http2::settings::DEFAULT_INITIAL_WINDOW_SIZE;
use crate::limits::{ReqLimits, RespLimits};
use crate::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    Open,
    HalfClosedRemote,
    HalfClosedLocal,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamError {
    /// A frame arrived that RFC 7540 §5.1 forbids in the stream's current
    /// state (e.g. DATA on a stream still waiting for END_HEADERS).
    UnexpectedFrame,
    /// The assembled header block exceeded the configured limit.
    HeaderBlockTooLarge,
    /// A WINDOW_UPDATE or DATA frame pushed flow control past `2^31-1`.
    FlowControlOverflow,
}

/// Reusable per-stream context. Server-role only: the reservation states
/// used by server push (`ReservedLocal`/`ReservedRemote`) don't apply since
/// this server never offers pushes.
#[derive(Debug)]
pub(crate) struct Http2Stream {
    pub(crate) id: u32,
    pub(crate) state: StreamState,
    send_window: i64,
    recv_window: i64,
    /// Bytes freed from `recv_window` since the last WINDOW_UPDATE we sent,
    /// batched so we don't emit one per DATA frame.
    recv_window_pending: i64,
    header_block: Vec<u8>,
    headers_complete: bool,
    max_header_block_size: usize,
    pub(crate) end_stream_received: bool,
    pub(crate) body: Vec<u8>,
    /// HPACK-decoded header pairs staged between END_HEADERS and the
    /// `Request::set_http2` call that consumes them.
    decoded_headers: Vec<(Box<[u8]>, Box<[u8]>)>,
    pub(crate) request: Request,
    pub(crate) response: Response,
    /// Whether the response HEADERS frame has already gone out. Flow
    /// control only gates DATA, so HEADERS is sent unconditionally the
    /// first time the response is sent.
    pub(crate) headers_sent: bool,
    /// Bytes of `response.buffer()` already emitted as DATA. Stays short of
    /// the full body while the send window is exhausted; the remainder
    /// goes out once a WINDOW_UPDATE arrives.
    pub(crate) response_offset: usize,
}

impl Http2Stream {
    pub(crate) fn new(
        id: u32,
        initial_window_size: u32,
        max_header_block_size: usize,
        req_limits: &ReqLimits,
        resp_limits: &RespLimits,
    ) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window: initial_window_size as i64,
            recv_window: DEFAULT_INITIAL_WINDOW_SIZE as i64,
            recv_window_pending: 0,
            header_block: Vec::new(),
            headers_complete: false,
            max_header_block_size,
            end_stream_received: false,
            body: Vec::new(),
            decoded_headers: Vec::new(),
            request: Request::new(req_limits),
            response: Response::new(resp_limits),
            headers_sent: false,
            response_offset: 0,
        }
    }

    /// Resets this context for reuse by a brand-new stream id, as handed
    /// back to the connection's stream pool once a stream closes.
    pub(crate) fn reset(&mut self, id: u32, initial_window_size: u32, resp_limits: &RespLimits) {
        self.id = id;
        self.state = StreamState::Idle;
        self.send_window = initial_window_size as i64;
        self.recv_window = DEFAULT_INITIAL_WINDOW_SIZE as i64;
        self.recv_window_pending = 0;
        self.header_block.clear();
        self.headers_complete = false;
        self.end_stream_received = false;
        self.body.clear();
        self.decoded_headers.clear();
        self.request.reset();
        self.response.reset(resp_limits);
        self.headers_sent = false;
        self.response_offset = 0;
    }

    /// Stages the HPACK-decoded header pairs for this stream, replacing any
    /// previous contents.
    pub(crate) fn set_decoded_headers(&mut self, pairs: Vec<(Box<[u8]>, Box<[u8]>)>) {
        self.decoded_headers = pairs;
    }

    pub(crate) fn decoded_headers(&self) -> &[(Box<[u8]>, Box<[u8]>)] {
        &self.decoded_headers
    }

    #[inline(always)]
    pub(crate) fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    #[inline(always)]
    pub(crate) fn headers_complete(&self) -> bool {
        self.headers_complete
    }

    /// Applies a HEADERS frame (the stream's first frame in the happy
    /// path), starting header-block assembly.
    pub(crate) fn on_headers(&mut self, fragment: &[u8], end_headers: bool, end_stream: bool) -> Result<(), StreamError> {
        if self.state != StreamState::Idle {
            return Err(StreamError::UnexpectedFrame);
        }
        self.state = StreamState::Open;
        self.append_fragment(fragment)?;
        self.headers_complete = end_headers;
        if end_stream {
            self.mark_end_stream();
        }
        Ok(())
    }

    /// Applies a CONTINUATION frame, extending the in-flight header block.
    pub(crate) fn on_continuation(&mut self, fragment: &[u8], end_headers: bool) -> Result<(), StreamError> {
        if self.headers_complete || matches!(self.state, StreamState::Idle | StreamState::Closed) {
            return Err(StreamError::UnexpectedFrame);
        }
        self.append_fragment(fragment)?;
        self.headers_complete = end_headers;
        Ok(())
    }

    fn append_fragment(&mut self, fragment: &[u8]) -> Result<(), StreamError> {
        if self.header_block.len() + fragment.len() > self.max_header_block_size {
            return Err(StreamError::HeaderBlockTooLarge);
        }
        self.header_block.extend_from_slice(fragment);
        Ok(())
    }

    /// Takes the assembled header block once `headers_complete()` is true.
    pub(crate) fn take_header_block(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.header_block)
    }

    /// Applies a DATA frame's payload, tracking the receive window and the
    /// half-closed(remote) transition on `end_stream`.
    pub(crate) fn on_data(&mut self, data: &[u8], end_stream: bool) -> Result<(), StreamError> {
        if self.state != StreamState::Open {
            return Err(StreamError::UnexpectedFrame);
        }
        self.recv_window -= data.len() as i64;
        if self.recv_window < 0 {
            return Err(StreamError::FlowControlOverflow);
        }
        self.body.extend_from_slice(data);
        if end_stream {
            self.mark_end_stream();
        }
        Ok(())
    }

    fn mark_end_stream(&mut self) {
        self.end_stream_received = true;
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// Marks our own response as fully sent (our END_STREAM).
    pub(crate) fn mark_locally_closed(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    pub(crate) fn reset_by_error(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Applies a peer WINDOW_UPDATE to our send-side accounting.
    pub(crate) fn apply_window_update(&mut self, increment: u32) -> Result<(), StreamError> {
        self.send_window = self
            .send_window
            .checked_add(increment as i64)
            .filter(|w| *w <= crate::http2::settings::MAX_WINDOW_SIZE as i64)
            .ok_or(StreamError::FlowControlOverflow)?;
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn send_window(&self) -> i64 {
        self.send_window
    }

    /// Applies a `SETTINGS_INITIAL_WINDOW_SIZE` change (RFC 7540 §6.9.2) as a
    /// delta to this stream's send window, rather than an absolute value.
    pub(crate) fn adjust_send_window(&mut self, delta: i64) -> Result<(), StreamError> {
        self.send_window = self
            .send_window
            .checked_add(delta)
            .filter(|w| w.abs() <= crate::http2::settings::MAX_WINDOW_SIZE as i64)
            .ok_or(StreamError::FlowControlOverflow)?;
        Ok(())
    }

    pub(crate) fn consume_send_window(&mut self, n: usize) {
        self.send_window -= n as i64;
    }

    /// Whether this stream has response body bytes queued to send but not
    /// yet emitted as DATA, because a send window was exhausted.
    pub(crate) fn has_pending_response(&self) -> bool {
        self.headers_sent && self.response_offset < self.response.buffer().len()
    }

    /// Accounts `n` bytes a handler has consumed, returning a WINDOW_UPDATE
    /// frame once at least half the initial window has been freed (the
    /// common threshold used to avoid sending a WINDOW_UPDATE per byte).
    ///
    /// `recv_window` is restored (not drained) by the increment we grant:
    /// a WINDOW_UPDATE(n) tells the peer "you may send n more bytes", so our
    /// own bookkeeping of remaining credit must grow by the same n, not fall
    /// back to zero.
    pub(crate) fn on_body_consumed(&mut self, n: usize, initial_window_size: u32) -> Option<Frame> {
        self.recv_window_pending += n as i64;
        let threshold = initial_window_size as i64 / 2;
        if self.recv_window_pending >= threshold && self.recv_window_pending > 0 {
            let increment = self
                .recv_window_pending
                .min(crate::http2::settings::MAX_WINDOW_SIZE as i64) as u32;
            self.recv_window_pending -= increment as i64;
            self.recv_window += increment as i64;
            return Some(Frame::WindowUpdate {
                stream_id: self.id,
                increment,
            });
        }
        None
    }
}

//! HTTP/2 frame wire format (RFC 7540 §4-§6).
//!
//! Frames are modeled as a single tagged [`Frame`] enum rather than a
//! per-type struct hierarchy with virtual dispatch — the frame type byte on
//! the wire already tells you which variant you have, so a `match` at parse
//! time is both the natural Rust shape and the cheapest one: no trait
//! objects, no downcasting, exhaustiveness checked by the compiler.

use crate::buffer::{BufferError, InputBuffer, OutputBuffer};

pub(crate) const FRAME_HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl FrameType {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::Headers => 0x1,
            Self::Priority => 0x2,
            Self::RstStream => 0x3,
            Self::Settings => 0x4,
            Self::PushPromise => 0x5,
            Self::Ping => 0x6,
            Self::GoAway => 0x7,
            Self::WindowUpdate => 0x8,
            Self::Continuation => 0x9,
            Self::Unknown(b) => b,
        }
    }
}

pub(crate) mod flags {
    pub(crate) const END_STREAM: u8 = 0x1;
    pub(crate) const ACK: u8 = 0x1;
    pub(crate) const END_HEADERS: u8 = 0x4;
    pub(crate) const PADDED: u8 = 0x8;
    pub(crate) const PRIORITY: u8 = 0x20;
}

/// RFC 7540 §7 error codes, sent in RST_STREAM and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
}

impl ErrorCode {
    pub(crate) fn as_u32(self) -> u32 {
        match self {
            Self::NoError => 0x0,
            Self::ProtocolError => 0x1,
            Self::InternalError => 0x2,
            Self::FlowControlError => 0x3,
            Self::SettingsTimeout => 0x4,
            Self::StreamClosed => 0x5,
            Self::FrameSizeError => 0x6,
            Self::RefusedStream => 0x7,
            Self::Cancel => 0x8,
            Self::CompressionError => 0x9,
            Self::ConnectError => 0xa,
            Self::EnhanceYourCalm => 0xb,
            Self::InadequateSecurity => 0xc,
            Self::Http11Required => 0xd,
        }
    }

    fn from_u32(value: u32) -> Self {
        match value {
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::NoError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameError {
    /// Frame length exceeds the connection's negotiated max.
    FrameSizeError,
    /// Malformed fixed-size frame (RST_STREAM/GOAWAY/PING/WINDOW_UPDATE/PRIORITY
    /// payload shorter than required, or a zero-length PRIORITY-flagged HEADERS
    /// payload, or padding that consumes more than the whole payload).
    ProtocolError,
    /// Stream id of zero on a frame that must be stream-associated, or
    /// nonzero on one that must be connection-level.
    InvalidStreamId,
    /// SETTINGS frame payload not a multiple of 6 bytes, or sent with a
    /// nonzero stream id, or an ACK frame carrying a payload.
    InvalidSettingsFrame,
}

/// A parsed frame header plus unparsed payload bytes, before payload-specific
/// decoding (padding stripped, HPACK block assembled, and so on).
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub(crate) length: u32,
    pub(crate) frame_type: FrameType,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHeader {
    /// Attempts to parse a 9-byte frame header from `buf` at the current
    /// read cursor. Leaves the cursor past the header on success; on
    /// `NeedMore` the caller is expected to rewind to its own mark.
    pub(crate) fn parse(buf: &mut InputBuffer) -> Result<Self, BufferError> {
        let length = buf.read_u24()?;
        let frame_type = FrameType::from_byte(buf.read_byte()?);
        let flags = buf.read_byte()?;
        let stream_id = buf.read_u32()? & 0x7FFF_FFFF;
        Ok(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    fn write(&self, out: &mut OutputBuffer) {
        out.write_u24(self.length);
        out.write_u8(self.frame_type.as_byte());
        out.write_u8(self.flags);
        out.write_u32(self.stream_id & 0x7FFF_FFFF);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Priority {
    pub(crate) exclusive: bool,
    pub(crate) stream_dependency: u32,
    pub(crate) weight: u8,
}

/// A fully decoded HTTP/2 frame. Padding has already been stripped; HEADERS
/// and PUSH_PROMISE carry raw HPACK-encoded fragments (assembled across
/// CONTINUATION frames by [`crate::http2::stream`]), not decoded headers —
/// HPACK decoding happens once the whole header block is in hand, since the
/// dynamic table must see fragments in wire order regardless of fragment
/// boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        end_stream: bool,
        data: Vec<u8>,
    },
    Headers {
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
        header_block: Vec<u8>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        params: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        end_headers: bool,
        header_block: Vec<u8>,
    },
    Ping {
        ack: bool,
        opaque: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        end_headers: bool,
        header_block: Vec<u8>,
    },
}

impl Frame {
    /// Decodes a frame body given its header and exactly `header.length`
    /// payload bytes (the caller is responsible for having buffered that
    /// many bytes before calling this — frame assembly is the InputBuffer's
    /// job, not this function's).
    pub(crate) fn parse(header: &FrameHeader, payload: &[u8]) -> Result<Option<Self>, FrameError> {
        debug_assert_eq!(payload.len(), header.length as usize);

        match header.frame_type {
            FrameType::Data => {
                let (data, _) = strip_padding(header, payload)?;
                if header.stream_id == 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                Ok(Some(Frame::Data {
                    stream_id: header.stream_id,
                    end_stream: header.has_flag(flags::END_STREAM),
                    data: data.to_vec(),
                }))
            }
            FrameType::Headers => {
                if header.stream_id == 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                let (mut body, _) = strip_padding(header, payload)?;
                let priority = if header.has_flag(flags::PRIORITY) {
                    if body.len() < 5 {
                        return Err(FrameError::ProtocolError);
                    }
                    let raw = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    let p = Priority {
                        exclusive: raw & 0x8000_0000 != 0,
                        stream_dependency: raw & 0x7FFF_FFFF,
                        weight: body[4],
                    };
                    body = &body[5..];
                    Some(p)
                } else {
                    None
                };
                Ok(Some(Frame::Headers {
                    stream_id: header.stream_id,
                    end_stream: header.has_flag(flags::END_STREAM),
                    end_headers: header.has_flag(flags::END_HEADERS),
                    priority,
                    header_block: body.to_vec(),
                }))
            }
            FrameType::Priority => {
                if header.stream_id == 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                if payload.len() != 5 {
                    return Err(FrameError::FrameSizeError);
                }
                let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Some(Frame::Priority {
                    stream_id: header.stream_id,
                    priority: Priority {
                        exclusive: raw & 0x8000_0000 != 0,
                        stream_dependency: raw & 0x7FFF_FFFF,
                        weight: payload[4],
                    },
                }))
            }
            FrameType::RstStream => {
                if header.stream_id == 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                if payload.len() != 4 {
                    return Err(FrameError::FrameSizeError);
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Some(Frame::RstStream {
                    stream_id: header.stream_id,
                    error_code: ErrorCode::from_u32(code),
                }))
            }
            FrameType::Settings => {
                if header.stream_id != 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                let ack = header.has_flag(flags::ACK);
                if ack {
                    if !payload.is_empty() {
                        return Err(FrameError::FrameSizeError);
                    }
                    return Ok(Some(Frame::Settings {
                        ack: true,
                        params: Vec::new(),
                    }));
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameError::InvalidSettingsFrame);
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                for chunk in payload.chunks_exact(6) {
                    let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                    let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                    params.push((id, value));
                }
                Ok(Some(Frame::Settings { ack: false, params }))
            }
            FrameType::PushPromise => {
                if header.stream_id == 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                let (body, _) = strip_padding(header, payload)?;
                if body.len() < 4 {
                    return Err(FrameError::FrameSizeError);
                }
                let promised = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) & 0x7FFF_FFFF;
                Ok(Some(Frame::PushPromise {
                    stream_id: header.stream_id,
                    promised_stream_id: promised,
                    end_headers: header.has_flag(flags::END_HEADERS),
                    header_block: body[4..].to_vec(),
                }))
            }
            FrameType::Ping => {
                if header.stream_id != 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                if payload.len() != 8 {
                    return Err(FrameError::FrameSizeError);
                }
                let mut opaque = [0u8; 8];
                opaque.copy_from_slice(payload);
                Ok(Some(Frame::Ping {
                    ack: header.has_flag(flags::ACK),
                    opaque,
                }))
            }
            FrameType::GoAway => {
                if header.stream_id != 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                if payload.len() < 8 {
                    return Err(FrameError::FrameSizeError);
                }
                let last_stream_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                Ok(Some(Frame::GoAway {
                    last_stream_id,
                    error_code: ErrorCode::from_u32(code),
                    debug_data: payload[8..].to_vec(),
                }))
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(FrameError::FrameSizeError);
                }
                let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
                if increment == 0 {
                    return Err(FrameError::ProtocolError);
                }
                Ok(Some(Frame::WindowUpdate {
                    stream_id: header.stream_id,
                    increment,
                }))
            }
            FrameType::Continuation => {
                if header.stream_id == 0 {
                    return Err(FrameError::InvalidStreamId);
                }
                Ok(Some(Frame::Continuation {
                    stream_id: header.stream_id,
                    end_headers: header.has_flag(flags::END_HEADERS),
                    header_block: payload.to_vec(),
                }))
            }
            FrameType::Unknown(_) => Ok(None),
        }
    }

    /// Serializes this frame (header + payload) onto `out`.
    pub(crate) fn serialize(&self, out: &mut OutputBuffer) {
        match self {
            Frame::Data { stream_id, end_stream, data } => {
                let flags = if *end_stream { flags::END_STREAM } else { 0 };
                FrameHeader {
                    length: data.len() as u32,
                    frame_type: FrameType::Data,
                    flags,
                    stream_id: *stream_id,
                }
                .write(out);
                out.write_bytes(data);
            }
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                priority,
                header_block,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= flags::END_STREAM;
                }
                if *end_headers {
                    flags |= flags::END_HEADERS;
                }
                if priority.is_some() {
                    flags |= flags::PRIORITY;
                }
                let prio_len = if priority.is_some() { 5 } else { 0 };
                FrameHeader {
                    length: (header_block.len() + prio_len) as u32,
                    frame_type: FrameType::Headers,
                    flags,
                    stream_id: *stream_id,
                }
                .write(out);
                if let Some(p) = priority {
                    let dep = p.stream_dependency | if p.exclusive { 0x8000_0000 } else { 0 };
                    out.write_u32(dep);
                    out.write_u8(p.weight);
                }
                out.write_bytes(header_block);
            }
            Frame::Priority { stream_id, priority } => {
                FrameHeader {
                    length: 5,
                    frame_type: FrameType::Priority,
                    flags: 0,
                    stream_id: *stream_id,
                }
                .write(out);
                let dep = priority.stream_dependency | if priority.exclusive { 0x8000_0000 } else { 0 };
                out.write_u32(dep);
                out.write_u8(priority.weight);
            }
            Frame::RstStream { stream_id, error_code } => {
                FrameHeader {
                    length: 4,
                    frame_type: FrameType::RstStream,
                    flags: 0,
                    stream_id: *stream_id,
                }
                .write(out);
                out.write_u32(error_code.as_u32());
            }
            Frame::Settings { ack, params } => {
                let length = if *ack { 0 } else { params.len() * 6 };
                FrameHeader {
                    length: length as u32,
                    frame_type: FrameType::Settings,
                    flags: if *ack { flags::ACK } else { 0 },
                    stream_id: 0,
                }
                .write(out);
                if !*ack {
                    for (id, value) in params {
                        out.write_bytes(&id.to_be_bytes());
                        out.write_u32(*value);
                    }
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                end_headers,
                header_block,
            } => {
                FrameHeader {
                    length: (header_block.len() + 4) as u32,
                    frame_type: FrameType::PushPromise,
                    flags: if *end_headers { flags::END_HEADERS } else { 0 },
                    stream_id: *stream_id,
                }
                .write(out);
                out.write_u32(*promised_stream_id & 0x7FFF_FFFF);
                out.write_bytes(header_block);
            }
            Frame::Ping { ack, opaque } => {
                FrameHeader {
                    length: 8,
                    frame_type: FrameType::Ping,
                    flags: if *ack { flags::ACK } else { 0 },
                    stream_id: 0,
                }
                .write(out);
                out.write_bytes(opaque);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                FrameHeader {
                    length: (8 + debug_data.len()) as u32,
                    frame_type: FrameType::GoAway,
                    flags: 0,
                    stream_id: 0,
                }
                .write(out);
                out.write_u32(*last_stream_id & 0x7FFF_FFFF);
                out.write_u32(error_code.as_u32());
                out.write_bytes(debug_data);
            }
            Frame::WindowUpdate { stream_id, increment } => {
                FrameHeader {
                    length: 4,
                    frame_type: FrameType::WindowUpdate,
                    flags: 0,
                    stream_id: *stream_id,
                }
                .write(out);
                out.write_u32(*increment & 0x7FFF_FFFF);
            }
            Frame::Continuation {
                stream_id,
                end_headers,
                header_block,
            } => {
                FrameHeader {
                    length: header_block.len() as u32,
                    frame_type: FrameType::Continuation,
                    flags: if *end_headers { flags::END_HEADERS } else { 0 },
                    stream_id: *stream_id,
                }
                .write(out);
                out.write_bytes(header_block);
            }
        }
    }
}

/// Strips PADDED-flag padding from `payload`, returning `(data, pad_length)`.
fn strip_padding<'a>(header: &FrameHeader, payload: &'a [u8]) -> Result<(&'a [u8], usize), FrameError> {
    if !header.has_flag(flags::PADDED) {
        return Ok((payload, 0));
    }
    let Some((&pad_len, rest)) = payload.split_first() else {
        return Err(FrameError::ProtocolError);
    };
    let pad_len = pad_len as usize;
    if pad_len > rest.len() {
        return Err(FrameError::ProtocolError);
    }
    Ok((&rest[..rest.len() - pad_len], pad_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut out = OutputBuffer::new(256, 4096);
        frame.serialize(&mut out);

        let mut input = InputBuffer::new(4096);
        input.extend(out.as_slice()).unwrap();
        let header = FrameHeader::parse(&mut input).unwrap();
        let payload = input.take_slice(header.length as usize).unwrap().to_vec();
        let parsed = Frame::parse(&header, &payload).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn data_frame_roundtrips() {
        roundtrip(Frame::Data {
            stream_id: 1,
            end_stream: true,
            data: b"hello".to_vec(),
        });
    }

    #[test]
    fn headers_frame_with_priority_roundtrips() {
        roundtrip(Frame::Headers {
            stream_id: 3,
            end_stream: false,
            end_headers: true,
            priority: Some(Priority {
                exclusive: true,
                stream_dependency: 1,
                weight: 16,
            }),
            header_block: vec![0x82, 0x86],
        });
    }

    #[test]
    fn settings_ack_has_no_payload() {
        roundtrip(Frame::Settings {
            ack: true,
            params: vec![],
        });
    }

    #[test]
    fn settings_frame_roundtrips_params() {
        roundtrip(Frame::Settings {
            ack: false,
            params: vec![(0x3, 100), (0x4, 65535)],
        });
    }

    #[test]
    fn window_update_rejects_zero_increment() {
        let header = FrameHeader {
            length: 4,
            frame_type: FrameType::WindowUpdate,
            flags: 0,
            stream_id: 1,
        };
        assert_eq!(
            Frame::parse(&header, &[0, 0, 0, 0]),
            Err(FrameError::ProtocolError)
        );
    }

    #[test]
    fn settings_on_nonzero_stream_is_protocol_error() {
        let header = FrameHeader {
            length: 0,
            frame_type: FrameType::Settings,
            flags: 0,
            stream_id: 7,
        };
        assert_eq!(Frame::parse(&header, &[]), Err(FrameError::InvalidStreamId));
    }

    #[test]
    fn padded_data_frame_strips_padding() {
        let header = FrameHeader {
            length: 7,
            frame_type: FrameType::Data,
            flags: flags::PADDED,
            stream_id: 1,
        };
        // pad_len=2, data="ab", then 2 pad bytes.
        let payload = [2u8, b'a', b'b', 0, 0];
        let frame = Frame::parse(&header, &payload).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                stream_id: 1,
                end_stream: false,
                data: b"ab".to_vec(),
            }
        );
    }

    #[test]
    fn ping_frame_roundtrips() {
        roundtrip(Frame::Ping {
            ack: false,
            opaque: *b"ABCDEFGH",
        });
    }

    #[test]
    fn goaway_frame_roundtrips() {
        roundtrip(Frame::GoAway {
            last_stream_id: 9,
            error_code: ErrorCode::ProtocolError,
            debug_data: b"bye".to_vec(),
        });
    }
}

//! HTTP/1.1 chunked transfer encoding (RFC 7230 §4.1).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkedError {
    MalformedSizeLine,
    MalformedLineEnding,
    ChunkTooLarge,
    InvalidChunkSize,
}

impl fmt::Display for ChunkedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for ChunkedError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    SizeLine,
    ChunkData { remaining: usize },
    ChunkTrailingCrlf,
    Trailers,
    TrailerLine,
    Done,
}

/// Decodes a chunked body from a byte stream, fed incrementally.
///
/// `feed` consumes as many complete, well-formed chunks as are present in
/// `input` and appends their decoded payload to `out`, returning how many
/// bytes of `input` were consumed. Call repeatedly as more bytes arrive;
/// [`ChunkedReader::is_done`] becomes true once the terminating `0`-chunk
/// and trailer section have both been consumed.
#[derive(Debug)]
pub(crate) struct ChunkedReader {
    state: ReadState,
    max_chunk_size: usize,
}

impl ChunkedReader {
    pub(crate) fn new(max_chunk_size: usize) -> Self {
        Self {
            state: ReadState::SizeLine,
            max_chunk_size,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = ReadState::SizeLine;
    }

    #[inline(always)]
    pub(crate) fn is_done(&self) -> bool {
        self.state == ReadState::Done
    }

    pub(crate) fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ChunkedError> {
        let mut pos = 0usize;

        loop {
            match self.state {
                ReadState::Done => return Ok(pos),
                ReadState::SizeLine => {
                    let Some(line_end) = find_crlf(&input[pos..])? else {
                        return Ok(pos);
                    };
                    let line = &input[pos..pos + line_end];
                    let size_str = match memchr::memchr(b';', line) {
                        Some(semi) => &line[..semi],
                        None => line,
                    };
                    let size = parse_hex_size(size_str)?;
                    if size > self.max_chunk_size {
                        return Err(ChunkedError::ChunkTooLarge);
                    }
                    pos += line_end + 2;
                    self.state = if size == 0 {
                        ReadState::Trailers
                    } else {
                        ReadState::ChunkData { remaining: size }
                    };
                }
                ReadState::ChunkData { remaining } => {
                    let available = input.len() - pos;
                    if available == 0 {
                        return Ok(pos);
                    }
                    let take = available.min(remaining);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = remaining - take;
                    self.state = if left == 0 {
                        ReadState::ChunkTrailingCrlf
                    } else {
                        ReadState::ChunkData { remaining: left }
                    };
                    if left > 0 {
                        return Ok(pos);
                    }
                }
                ReadState::ChunkTrailingCrlf => {
                    if input.len() - pos < 2 {
                        return Ok(pos);
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(ChunkedError::MalformedLineEnding);
                    }
                    pos += 2;
                    self.state = ReadState::SizeLine;
                }
                ReadState::Trailers => {
                    // First line of the trailer section (possibly empty).
                    self.state = ReadState::TrailerLine;
                }
                ReadState::TrailerLine => {
                    let Some(line_end) = find_crlf(&input[pos..])? else {
                        return Ok(pos);
                    };
                    pos += line_end + 2;
                    if line_end == 0 {
                        self.state = ReadState::Done;
                        return Ok(pos);
                    }
                    // Discard the trailer header, loop for the next line.
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Result<Option<usize>, ChunkedError> {
    match memchr::memchr(b'\n', buf) {
        Some(nl) => {
            if nl == 0 || buf[nl - 1] != b'\r' {
                return Err(ChunkedError::MalformedLineEnding);
            }
            Ok(Some(nl - 1))
        }
        None => {
            if memchr::memchr(b'\r', buf).is_some_and(|cr| cr + 1 < buf.len()) {
                return Err(ChunkedError::MalformedLineEnding);
            }
            Ok(None)
        }
    }
}

fn parse_hex_size(digits: &[u8]) -> Result<usize, ChunkedError> {
    if digits.is_empty() {
        return Err(ChunkedError::MalformedSizeLine);
    }
    let mut value: usize = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ChunkedError::MalformedSizeLine),
        };
        value = value
            .checked_mul(16)
            .and_then(|v| v.checked_add(digit as usize))
            .ok_or(ChunkedError::InvalidChunkSize)?;
    }
    Ok(value)
}

/// Encodes a body into chunked transfer encoding, buffering a partial
/// remainder until a full `chunk_size` worth of data (or `close`) flushes it.
#[derive(Debug)]
pub(crate) struct ChunkedWriter {
    chunk_size: usize,
    pending: Vec<u8>,
}

impl ChunkedWriter {
    pub(crate) fn new(chunk_size: usize) -> Result<Self, ChunkedError> {
        if chunk_size == 0 {
            return Err(ChunkedError::InvalidChunkSize);
        }
        Ok(Self {
            chunk_size,
            pending: Vec::with_capacity(chunk_size),
        })
    }

    pub(crate) fn reset(&mut self) {
        self.pending.clear();
    }

    /// Appends `data` to the pending buffer and flushes any complete chunks
    /// into `out`.
    pub(crate) fn write(&mut self, data: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(data);
        let mut offset = 0;
        while self.pending.len() - offset >= self.chunk_size {
            write_chunk(&self.pending[offset..offset + self.chunk_size], out);
            offset += self.chunk_size;
        }
        self.pending.drain(..offset);
    }

    /// Flushes any partial remainder plus the terminating `0`-chunk.
    pub(crate) fn close(&mut self, out: &mut Vec<u8>) {
        if !self.pending.is_empty() {
            write_chunk(&self.pending, out);
            self.pending.clear();
        }
        out.extend_from_slice(b"0\r\n\r\n");
    }
}

fn write_chunk(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8], max_chunk: usize) -> Vec<u8> {
        let mut reader = ChunkedReader::new(max_chunk);
        let mut out = Vec::new();
        let mut consumed = 0;
        while consumed < input.len() && !reader.is_done() {
            consumed += reader.feed(&input[consumed..], &mut out).unwrap();
        }
        assert!(reader.is_done());
        out
    }

    #[test]
    fn decodes_the_spec_example() {
        let input = b"6\r\nHello,\r\n6\r\nworld!\r\n0\r\n\r\n";
        assert_eq!(decode_all(input, 1024), b"Hello,world!");
    }

    #[test]
    fn write_then_read_round_trips_for_any_chunk_size() {
        let body = b"the quick brown fox jumps over the lazy dog, repeatedly, many times over";
        for chunk_size in [1usize, 2, 3, 7, 16, 64, 1024] {
            let mut writer = ChunkedWriter::new(chunk_size).unwrap();
            let mut encoded = Vec::new();
            writer.write(body, &mut encoded);
            writer.close(&mut encoded);

            let decoded = decode_all(&encoded, body.len() + 16);
            assert_eq!(decoded, body, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn rejects_non_hex_size_line() {
        let mut reader = ChunkedReader::new(64);
        let mut out = Vec::new();
        assert_eq!(
            reader.feed(b"zz\r\nhello\r\n", &mut out),
            Err(ChunkedError::MalformedSizeLine)
        );
    }

    #[test]
    fn rejects_bare_lf_without_cr() {
        let mut reader = ChunkedReader::new(64);
        let mut out = Vec::new();
        assert_eq!(
            reader.feed(b"3\nabc\r\n0\r\n\r\n", &mut out),
            Err(ChunkedError::MalformedLineEnding)
        );
    }

    #[test]
    fn zero_chunk_size_writer_is_a_config_error() {
        assert_eq!(ChunkedWriter::new(0), Err(ChunkedError::InvalidChunkSize));
    }

    #[test]
    fn consumes_trailers_before_signalling_done() {
        let input = b"0\r\nX-Trailer: value\r\n\r\n";
        let mut reader = ChunkedReader::new(64);
        let mut out = Vec::new();
        let consumed = reader.feed(input, &mut out).unwrap();
        assert_eq!(consumed, input.len());
        assert!(reader.is_done());
        assert!(out.is_empty());
    }
}

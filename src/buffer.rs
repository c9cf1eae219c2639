//! Reusable byte staging buffers between the socket and the protocol parsers.
//!
//! [`InputBuffer`] and [`OutputBuffer`] are the two halves of the per-connection
//! I/O staging area. Both are fixed-capacity, heap-allocated once at context
//! construction and never reallocated — the context reuse manager ([`crate::pool`])
//! hands out already-reset instances instead of letting parsers allocate.

use std::io;

/// Error raised when a buffer operation cannot be satisfied with the bytes
/// currently staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferError {
    /// Fewer bytes are staged than the read requires; the caller should
    /// rewind to its mark (if any) and wait for more data.
    NeedMore,
    /// The buffer has no spare capacity left for the requested write/read.
    Overflow,
}

/// A fixed-capacity ring of staged input bytes with a read cursor, a write
/// cursor, and a single optional mark used for speculative (checkpoint /
/// rewind) parsing.
///
/// Invariant: `0 <= read <= mark.unwrap_or(read) <= write <= capacity`.
#[derive(Debug)]
pub(crate) struct InputBuffer {
    data: Box<[u8]>,
    read: usize,
    write: usize,
    mark: Option<usize>,
    eof: bool,
}

impl InputBuffer {
    #[inline]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            mark: None,
            eof: false,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.mark = None;
        self.eof = false;
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unread bytes currently staged.
    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.write - self.read
    }

    #[inline(always)]
    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    /// True iff at least `n` unread bytes are staged.
    #[inline(always)]
    pub(crate) fn available(&self, n: usize) -> bool {
        self.write - self.read >= n
    }

    /// Sets the rewind point to the current read cursor.
    #[inline(always)]
    pub(crate) fn mark(&mut self) {
        self.mark = Some(self.read);
    }

    /// Clears the rewind point without moving the read cursor.
    #[inline(always)]
    pub(crate) fn unmark(&mut self) {
        self.mark = None;
    }

    /// Rewinds the read cursor to the last [`mark`](Self::mark) and returns
    /// the number of bytes rewound. No-op (returns 0) if unmarked.
    #[inline]
    pub(crate) fn reset_to_mark(&mut self) -> usize {
        match self.mark.take() {
            Some(mark) => {
                let rewound = self.read - mark;
                self.read = mark;
                rewound
            }
            None => 0,
        }
    }

    #[inline(always)]
    fn remaining(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    #[inline]
    pub(crate) fn peek_byte(&self, offset: usize) -> Result<u8, BufferError> {
        self.remaining()
            .get(offset)
            .copied()
            .ok_or(BufferError::NeedMore)
    }

    #[inline]
    pub(crate) fn read_byte(&mut self) -> Result<u8, BufferError> {
        let byte = self.peek_byte(0)?;
        self.read += 1;
        Ok(byte)
    }

    #[inline]
    pub(crate) fn read_u24(&mut self) -> Result<u32, BufferError> {
        if !self.available(3) {
            return Err(BufferError::NeedMore);
        }
        let s = self.remaining();
        let value = (s[0] as u32) << 16 | (s[1] as u32) << 8 | s[2] as u32;
        self.read += 3;
        Ok(value)
    }

    #[inline]
    pub(crate) fn read_u32(&mut self) -> Result<u32, BufferError> {
        if !self.available(4) {
            return Err(BufferError::NeedMore);
        }
        let s = self.remaining();
        let value = u32::from_be_bytes([s[0], s[1], s[2], s[3]]);
        self.read += 4;
        Ok(value)
    }

    #[inline]
    pub(crate) fn read_u64(&mut self) -> Result<u64, BufferError> {
        if !self.available(8) {
            return Err(BufferError::NeedMore);
        }
        let s = self.remaining();
        let value = u64::from_be_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]);
        self.read += 8;
        Ok(value)
    }

    #[inline]
    pub(crate) fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        if !self.available(dst.len()) {
            return Err(BufferError::NeedMore);
        }
        dst.copy_from_slice(&self.remaining()[..dst.len()]);
        self.read += dst.len();
        Ok(())
    }

    /// Borrows `len` unread bytes without consuming them.
    #[inline]
    pub(crate) fn peek_slice(&self, len: usize) -> Result<&[u8], BufferError> {
        if !self.available(len) {
            return Err(BufferError::NeedMore);
        }
        Ok(&self.remaining()[..len])
    }

    /// Consumes and returns `len` unread bytes.
    #[inline]
    pub(crate) fn take_slice(&mut self, len: usize) -> Result<&[u8], BufferError> {
        if !self.available(len) {
            return Err(BufferError::NeedMore);
        }
        let start = self.read;
        self.read += len;
        Ok(&self.data[start..start + len])
    }

    #[inline]
    pub(crate) fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        if !self.available(n) {
            return Err(BufferError::NeedMore);
        }
        self.read += n;
        Ok(())
    }

    /// Compacts unread bytes to the base of the buffer, shifting `read`,
    /// `write`, and `mark` accordingly.
    fn compact(&mut self) {
        let anchor = self.mark.unwrap_or(self.read);
        if anchor == 0 {
            return;
        }
        let len = self.write - anchor;
        self.data.copy_within(anchor..self.write, 0);
        self.read -= anchor;
        self.write = len;
        if let Some(mark) = self.mark.as_mut() {
            *mark = 0;
        }
    }

    /// Reads from `reader` into the free tail of the buffer.
    ///
    /// Returns `Ok(true)` when the reader might still have more bytes ready
    /// (a hint to poll again before yielding), `Ok(false)` on end-of-stream
    /// or a fully-drained non-blocking read.
    pub(crate) fn fill(&mut self, reader: &mut impl io::Read) -> io::Result<bool> {
        if self.read > self.capacity() / 2 {
            self.compact();
        }

        let free = self.data.len() - self.write;
        if free == 0 {
            return Ok(false);
        }

        match reader.read(&mut self.data[self.write..]) {
            Ok(0) => {
                self.eof = true;
                Ok(false)
            }
            Ok(n) => {
                self.write += n;
                Ok(n == free)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Appends already-read bytes directly (used by the async socket layer,
    /// which performs its own `poll_read` outside of [`std::io::Read`]).
    pub(crate) fn extend(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if self.read > self.capacity() / 2 {
            self.compact();
        }
        if self.data.len() - self.write < bytes.len() {
            return Err(BufferError::Overflow);
        }
        let start = self.write;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
        Ok(())
    }

    pub(crate) fn mark_eof(&mut self) {
        self.eof = true;
    }
}

/// A fixed-capacity, append-only byte buffer drained by the I/O worker when
/// writing to the socket. Produced into by response/frame serialization.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    data: Vec<u8>,
    max_capacity: usize,
    default_capacity: usize,
    drained: usize,
}

impl OutputBuffer {
    #[inline]
    pub(crate) fn new(default_capacity: usize, max_capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(default_capacity),
            max_capacity,
            default_capacity,
            drained: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        if self.data.capacity() > self.max_capacity {
            self.data = Vec::with_capacity(self.default_capacity);
        } else {
            self.data.clear();
        }
        self.drained = 0;
    }

    #[inline(always)]
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[self.drained..]
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.drained >= self.data.len()
    }

    #[inline]
    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub(crate) fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    #[inline]
    pub(crate) fn write_u24(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes()[1..]);
    }

    #[inline]
    pub(crate) fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Marks `n` bytes from the front as flushed, after the I/O worker has
    /// successfully written them to the socket.
    #[inline]
    pub(crate) fn advance(&mut self, n: usize) {
        self.drained += n;
    }
}

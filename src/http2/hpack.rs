//! HPACK header compression (RFC 7541), wrapping `fluke-hpack`.
//!
//! Pulled in from the `fluke-hpack`-based sans-I/O HTTP/2 codec in the
//! example pack — the reference crate itself never speaks HTTP/2, so it has
//! no HPACK story of its own to generalize.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HpackError {
    Decode,
}

/// Decodes HPACK header blocks, maintaining the peer's dynamic table.
pub(crate) struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl std::fmt::Debug for HpackDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDecoder").finish()
    }
}

impl HpackDecoder {
    pub(crate) fn new(max_table_size: usize) -> Self {
        let mut inner = fluke_hpack::Decoder::new();
        inner.set_max_table_size(max_table_size);
        Self { inner }
    }

    pub(crate) fn decode(&mut self, block: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, HpackError> {
        self.inner.decode(block).map_err(|_| HpackError::Decode)
    }
}

/// Encodes our own outgoing headers, maintaining our dynamic table.
pub(crate) struct HpackEncoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl std::fmt::Debug for HpackEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackEncoder").finish()
    }
}

impl HpackEncoder {
    pub(crate) fn new() -> Self {
        Self {
            inner: fluke_hpack::Encoder::new(),
        }
    }

    pub(crate) fn encode_pairs(&mut self, pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        self.inner.encode(pairs.iter().copied())
    }

    /// Encodes a `:status` pseudo-header followed by `extra_headers`
    /// (name/value pairs already in wire order).
    pub(crate) fn encode_response(&mut self, status: &[u8], extra_headers: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut pairs: Vec<(&[u8], &[u8])> = Vec::with_capacity(1 + extra_headers.len());
        pairs.push((b":status", status));
        pairs.extend_from_slice(extra_headers);
        self.encode_pairs(&pairs)
    }
}

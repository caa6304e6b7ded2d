//! HPACK header compression context (RFC 7541)
//!
//! Table management, Huffman coding and the static table come from the
//! `hpack` crate. This module adds what the connection needs on top of it:
//! mapping decoder failures to COMPRESSION_ERROR, header-name validation that
//! runs only after the whole block has updated the dynamic table, and a
//! literal-only encoding mode for peers that shrink their table.
//!
//! A [`HeaderContext`] is created per connection and split into its two
//! halves: the encoder goes to the writer thread and the decoder stays with
//! the read loop.

use super::error::{Error, ErrorCode, Result};
use super::DEFAULT_HEADER_TABLE_SIZE;
use bytes::Bytes;
use hpack::decoder::DecoderError;
use hpack::encoder::encode_integer_into;
use std::io;

/// Both halves of a connection's compression state
pub struct HeaderContext {
    encoder: HeaderEncoder,
    decoder: HeaderDecoder,
}

impl HeaderContext {
    /// `local_table_size` is the SETTINGS_HEADER_TABLE_SIZE we advertise,
    /// which bounds the decoder's dynamic table
    pub fn new(local_table_size: u32) -> Self {
        HeaderContext {
            encoder: HeaderEncoder::new(),
            decoder: HeaderDecoder::new(local_table_size),
        }
    }

    pub fn encode_headers(&mut self, headers: &[(String, String)]) -> Bytes {
        self.encoder.encode(headers)
    }

    pub fn decode_headers(&mut self, stream_id: u32, block: &[u8]) -> Result<Vec<(String, String)>> {
        self.decoder.decode(stream_id, block)
    }

    pub fn encoder_mut(&mut self) -> &mut HeaderEncoder {
        &mut self.encoder
    }

    pub fn decoder_mut(&mut self) -> &mut HeaderDecoder {
        &mut self.decoder
    }

    /// Separate the halves so they can live on different threads
    pub fn split(self) -> (HeaderEncoder, HeaderDecoder) {
        (self.encoder, self.decoder)
    }
}

impl Default for HeaderContext {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_TABLE_SIZE)
    }
}

enum EncodeMode {
    /// Incremental indexing into a 4096-octet dynamic table
    Indexed(hpack::Encoder<'static>),
    /// Literal without indexing; the peer's table is never touched
    Literal,
}

/// Compresses outgoing header lists
pub struct HeaderEncoder {
    mode: EncodeMode,
    /// Dynamic table size update owed at the start of the next block
    pending_size_update: Option<usize>,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        HeaderEncoder {
            mode: EncodeMode::Indexed(hpack::Encoder::new()),
            pending_size_update: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE
    ///
    /// The indexing encoder assumes the default table size. A smaller peer
    /// table switches to literal representations for the rest of the
    /// connection, announced with a table size update of 0.
    pub fn set_peer_table_size(&mut self, size: u32) {
        if size < DEFAULT_HEADER_TABLE_SIZE && matches!(self.mode, EncodeMode::Indexed(_)) {
            tracing::debug!(size, "peer header table below default, encoding literals");
            self.mode = EncodeMode::Literal;
            self.pending_size_update = Some(0);
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.mode, EncodeMode::Literal)
    }

    /// Encode a header list into one header block
    pub fn encode(&mut self, headers: &[(String, String)]) -> Bytes {
        let mut block = Vec::with_capacity(64);
        // io::Write for Vec<u8> never fails
        let _ = self.encode_into(headers, &mut block);
        Bytes::from(block)
    }

    fn encode_into<W: io::Write>(&mut self, headers: &[(String, String)], out: &mut W) -> io::Result<()> {
        if let Some(size) = self.pending_size_update.take() {
            encode_integer_into(size, 5, 0x20, out)?;
        }

        match &mut self.mode {
            EncodeMode::Indexed(encoder) => encoder.encode_into(
                headers
                    .iter()
                    .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
                out,
            ),
            EncodeMode::Literal => {
                for (name, value) in headers {
                    // Literal Header Field without Indexing, new name
                    out.write_all(&[0x00])?;
                    encode_string(name.as_bytes(), out)?;
                    encode_string(value.as_bytes(), out)?;
                }
                Ok(())
            }
        }
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decompresses incoming header blocks
pub struct HeaderDecoder {
    decoder: hpack::Decoder<'static>,
    max_table_size: usize,
}

impl HeaderDecoder {
    pub fn new(max_table_size: u32) -> Self {
        let mut decoder = hpack::Decoder::new();
        decoder.set_max_table_size(max_table_size as usize);
        HeaderDecoder {
            decoder,
            max_table_size: max_table_size as usize,
        }
    }

    /// Follow a change of our advertised SETTINGS_HEADER_TABLE_SIZE
    pub fn set_max_table_size(&mut self, size: u32) {
        self.max_table_size = size as usize;
        self.decoder.set_max_table_size(self.max_table_size);
    }

    /// Decode a complete header block
    ///
    /// Any failure of the block itself is a connection-level COMPRESSION_ERROR.
    /// Field-level problems (upper-case names, non-UTF-8 octets) are stream
    /// errors, reported only after the whole block was processed so the
    /// dynamic table stays in step with the peer.
    pub fn decode(&mut self, stream_id: u32, block: &[u8]) -> Result<Vec<(String, String)>> {
        check_size_updates(block, self.max_table_size)?;

        // The hpack crate panics on some malformed size updates
        let decoder = &mut self.decoder;
        let fields = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| decoder.decode(block)))
            .map_err(|_| Error::Compression("malformed header block".to_string()))?
            .map_err(|e| Error::Compression(describe(e)))?;

        let mut headers = Vec::with_capacity(fields.len());
        let mut problem = None;

        for (name, value) in fields {
            if problem.is_some() {
                continue;
            }
            if name.iter().any(u8::is_ascii_uppercase) {
                problem = Some(format!(
                    "upper-case header name {:?}",
                    String::from_utf8_lossy(&name)
                ));
                continue;
            }
            match (String::from_utf8(name), String::from_utf8(value)) {
                (Ok(name), Ok(value)) => headers.push((name, value)),
                _ => problem = Some("header field is not valid UTF-8".to_string()),
            }
        }

        match problem {
            Some(reason) => Err(Error::stream(stream_id, ErrorCode::ProtocolError, reason)),
            None => Ok(headers),
        }
    }
}

fn describe(err: DecoderError) -> String {
    match err {
        DecoderError::HeaderIndexOutOfBounds => "header index out of bounds".to_string(),
        other => format!("undecodable header block: {:?}", other),
    }
}

/// Validate the dynamic table size updates that open a block
///
/// Updates may only appear at the start of a block and may not exceed the
/// table size we advertised (RFC 7541 Section 4.2).
fn check_size_updates(block: &[u8], limit: usize) -> Result<()> {
    let mut pos = 0;
    while pos < block.len() && block[pos] & 0xe0 == 0x20 {
        let (size, used) = decode_integer(&block[pos..], 5)
            .ok_or_else(|| Error::Compression("truncated table size update".to_string()))?;
        if size > limit {
            return Err(Error::Compression(format!(
                "table size update {} exceeds {}",
                size, limit
            )));
        }
        pos += used;
    }

    let mut rest = &block[pos..];
    while let Some((&first, _)) = rest.split_first() {
        if first & 0xe0 == 0x20 {
            return Err(Error::Compression(
                "table size update after first header field".to_string(),
            ));
        }
        rest = skip_field(rest)
            .ok_or_else(|| Error::Compression("truncated header field".to_string()))?;
    }
    Ok(())
}

/// Step over one field representation, returning what follows it
fn skip_field(buf: &[u8]) -> Option<&[u8]> {
    let first = buf[0];
    if first & 0x80 != 0 {
        let (_, used) = decode_integer(buf, 7)?;
        return Some(&buf[used..]);
    }

    // Literal: 6-bit index prefix for incremental indexing, 4-bit otherwise
    let prefix = if first & 0x40 != 0 { 6 } else { 4 };
    let (index, used) = decode_integer(buf, prefix)?;
    let mut rest = &buf[used..];
    if index == 0 {
        rest = skip_string(rest)?;
    }
    skip_string(rest)
}

fn skip_string(buf: &[u8]) -> Option<&[u8]> {
    if buf.is_empty() {
        return None;
    }
    let (len, used) = decode_integer(buf, 7)?;
    buf.get(used..)?.get(len..)
}

/// Decode an N-bit prefix integer, returning the value and octets consumed
fn decode_integer(buf: &[u8], prefix_bits: u8) -> Option<(usize, usize)> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let first = *buf.first()? as usize & max_prefix;
    if first < max_prefix {
        return Some((first, 1));
    }

    let mut value = max_prefix;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate().skip(1) {
        if shift > 28 {
            return None;
        }
        value = value.checked_add(((byte & 0x7f) as usize) << shift)?;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// String literal without Huffman coding (RFC 7541 Section 5.2)
fn encode_string<W: io::Write>(bytes: &[u8], out: &mut W) -> io::Result<()> {
    encode_integer_into(bytes.len(), 7, 0x00, out)?;
    out.write_all(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_integer_matches_encoder() {
        for value in [0usize, 10, 30, 31, 127, 128, 1337, 4096, 1 << 20] {
            for prefix in [4u8, 5, 6, 7] {
                let mut out = Vec::new();
                encode_integer_into(value, prefix, 0, &mut out).unwrap();
                assert_eq!(decode_integer(&out, prefix), Some((value, out.len())));
            }
        }
    }

    #[test]
    fn test_decode_integer() {
        assert_eq!(decode_integer(&[0x0a], 5), Some((10, 1)));
        assert_eq!(decode_integer(&[0x1f, 0x9a, 0x0a], 5), Some((1337, 3)));
        assert_eq!(decode_integer(&[0x1f, 0x9a], 5), None);
    }

    #[test]
    fn test_size_update_after_field_rejected() {
        let mut decoder = HeaderDecoder::new(4096);
        // :method GET (static index 2) followed by a size update
        let err = decoder.decode(1, &[0x82, 0x20]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompressionError);
    }

    #[test]
    fn test_round_trip_sequence() {
        let mut client = HeaderContext::default();
        let mut server = HeaderContext::default();

        let lists = [
            fields(&[(":method", "GET"), (":path", "/"), (":scheme", "http"), (":authority", "example.com")]),
            fields(&[(":method", "GET"), (":path", "/foo"), (":scheme", "http"), (":authority", "example.com"), ("cache-control", "no-cache")]),
            fields(&[(":method", "POST"), (":path", "/bar"), ("custom-key", "custom-value"), ("custom-key", "second")]),
        ];

        let mut sizes = Vec::new();
        for list in &lists {
            let block = client.encode_headers(list);
            sizes.push(block.len());
            assert_eq!(&server.decode_headers(1, &block).unwrap(), list);
        }

        // Repeating a list is cheaper once it sits in the dynamic table
        let again = client.encode_headers(&lists[0]);
        assert!(again.len() < sizes[0]);
        assert_eq!(server.decode_headers(3, &again).unwrap(), lists[0]);
    }

    #[test]
    fn test_round_trip_through_eviction() {
        let mut client = HeaderContext::default();
        let mut server = HeaderContext::default();

        let first = fields(&[("x-first", "value-0")]);
        let block = client.encode_headers(&first);
        assert_eq!(server.decode_headers(1, &block).unwrap(), first);
        let indexed = client.encode_headers(&first);
        assert_eq!(indexed.len(), 1);
        assert_eq!(server.decode_headers(3, &indexed).unwrap(), first);

        // Far more than 4096 octets of new entries
        let mut stream_id = 5;
        for i in 0..400usize {
            let list = vec![
                (":method".to_string(), if i % 3 == 0 { "POST" } else { "GET" }.to_string()),
                (":path".to_string(), format!("/item/{}", i)),
                (format!("x-field-{}", i), "v".repeat(i % 97 + 1)),
                (format!("x-extra-{}", i % 7), format!("{}-{}", i, "w".repeat(i % 13))),
            ];
            let block = client.encode_headers(&list);
            assert_eq!(server.decode_headers(stream_id, &block).unwrap(), list, "list {}", i);
            stream_id += 2;
        }

        // The first entry was evicted on both sides
        let literal = client.encode_headers(&first);
        assert!(literal.len() > 1);
        assert_eq!(server.decode_headers(stream_id, &literal).unwrap(), first);
        let indexed = client.encode_headers(&first);
        assert_eq!(indexed.len(), 1);
        assert_eq!(server.decode_headers(stream_id + 2, &indexed).unwrap(), first);
    }

    #[test]
    fn test_literal_mode_round_trip() {
        let mut encoder = HeaderEncoder::new();
        encoder.set_peer_table_size(0);
        assert!(encoder.is_literal());

        let mut decoder = HeaderDecoder::new(0);
        let list = fields(&[(":status", "200"), ("content-type", "text/plain")]);

        let first = encoder.encode(&list);
        assert_eq!(first[0], 0x20);
        assert_eq!(decoder.decode(1, &first).unwrap(), list);

        let second = encoder.encode(&list);
        assert_eq!(second[0], 0x00);
        assert_eq!(decoder.decode(3, &second).unwrap(), list);
    }

    #[test]
    fn test_bad_index_is_compression_error() {
        let mut decoder = HeaderDecoder::new(4096);
        // Indexed field 70 with an empty dynamic table
        let err = decoder.decode(1, &[0xc6]).unwrap_err();
        assert!(!err.is_stream_error());
        assert_eq!(err.code(), ErrorCode::CompressionError);
    }

    #[test]
    fn test_uppercase_name_is_stream_error_after_indexing() {
        let mut decoder = HeaderDecoder::new(4096);

        // Literal with incremental indexing, new name "X-Up: 1"
        let mut block = vec![0x40];
        encode_string(b"X-Up", &mut block);
        encode_string(b"1", &mut block);

        let err = decoder.decode(1, &block).unwrap_err();
        assert!(err.is_stream_error());
        assert_eq!(err.code(), ErrorCode::ProtocolError);

        // The entry still went into the dynamic table at index 62
        let decoded = decoder.decode(3, &[0xbe]);
        assert!(decoded.is_err());
        assert!(decoded.unwrap_err().is_stream_error());
    }

    #[test]
    fn test_table_size_update_above_limit() {
        let mut decoder = HeaderDecoder::new(256);
        let mut block = Vec::new();
        encode_integer_into(4096, 5, 0x20, &mut block).unwrap();
        let err = decoder.decode(1, &block).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CompressionError);
    }
}

//! Chunked transfer coding (RFC 9112 section 7.1)
//!
//! The legacy driver only ever decodes chunked request bodies; responses are
//! always sent with a Content-Length. The encoder exists for clients and
//! tests that need to produce chunked requests.

use super::{Error, Result, CRLF};

/// Longest chunk-size line (size plus extensions) we accept
const MAX_SIZE_LINE: usize = 1024;

/// Incremental chunked body decoder
///
/// Input may arrive in arbitrary pieces. Each call consumes as much of the
/// input as it can and appends the decoded payload to the output.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    Size,
    Data,
    DataEnd,
    Trailer,
    Complete,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::Size,
            remaining: 0,
        }
    }

    /// Decode from `input` into `output`
    ///
    /// Returns the number of input bytes consumed and whether the terminating
    /// chunk and trailer section have been seen. Bytes after the end of the
    /// body are left unconsumed.
    pub fn decode(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(usize, bool)> {
        let mut pos = 0;

        loop {
            match self.state {
                DecoderState::Size => {
                    let Some(end) = find_crlf(&input[pos..]) else {
                        if input.len() - pos > MAX_SIZE_LINE {
                            return Err(Error::InvalidChunkSize("size line too long".to_string()));
                        }
                        break;
                    };
                    let line = &input[pos..pos + end];
                    self.remaining = parse_chunk_size(line)?;
                    pos += end + 2;
                    self.state = if self.remaining == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::Data
                    };
                }

                DecoderState::Data => {
                    let take = self.remaining.min(input.len() - pos);
                    if take == 0 {
                        break;
                    }
                    output.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = DecoderState::DataEnd;
                    }
                }

                DecoderState::DataEnd => {
                    if input.len() - pos < 2 {
                        break;
                    }
                    if &input[pos..pos + 2] != CRLF.as_bytes() {
                        return Err(Error::Protocol("Expected CRLF after chunk data".to_string()));
                    }
                    pos += 2;
                    self.state = DecoderState::Size;
                }

                DecoderState::Trailer => {
                    // Trailer fields are read and discarded
                    let Some(end) = find_crlf(&input[pos..]) else {
                        break;
                    };
                    pos += end + 2;
                    if end == 0 {
                        self.state = DecoderState::Complete;
                    }
                }

                DecoderState::Complete => break,
            }
        }

        Ok((pos, self.state == DecoderState::Complete))
    }

    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::Size;
        self.remaining = 0;
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::InvalidChunkSize("non-ASCII size line".to_string()))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidChunkSize(digits.to_string()));
    }
    usize::from_str_radix(digits, 16).map_err(|_| Error::InvalidChunkSize(digits.to_string()))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Encode `data` as a chunked body, `chunk_size` bytes per chunk
pub fn encode_chunked_body(data: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    for chunk in data.chunks(chunk_size.max(1)) {
        out.extend_from_slice(format!("{:x}{}", chunk.len(), CRLF).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(CRLF.as_bytes());
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

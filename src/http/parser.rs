//! HTTP/1.1 message parsing
//!
//! Both parsers are incremental: feed whatever bytes the socket produced and
//! they return `Ok(None)` until a whole message (head and body) is buffered.
//! Bytes past the end of a message stay buffered, so pipelined requests and
//! frames that follow an upgrade response are never lost.

use super::chunked::ChunkedDecoder;
use super::{Error, Headers, HttpRequest, HttpResponse, Method, Result, Status, Version};

/// Default limit for a request line plus header section
pub const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;

/// Default limit for a request body
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Offset of the blank line ending a message head
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse an HTTP request line
///
/// Format: `METHOD SP request-target SP HTTP-version`
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split(' ').collect();

    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::Parse(format!("Invalid request line: {:?}", line)));
    }

    let method = parts[0].parse::<Method>()?;
    let uri = parts[1].to_string();
    let version = parts[2].parse::<Version>()?;

    Ok((method, uri, version))
}

/// Parse an HTTP status line
///
/// Format: `HTTP-version SP status-code SP [reason-phrase]`
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!("Invalid status line: {:?}", line)));
    }

    let version = parts[0].parse::<Version>()?;
    let code = parts[1]
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", parts[1])))?;
    let status = Status::new(code)?;
    let reason = match parts.get(2) {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => status.reason_phrase().to_string(),
    };

    Ok((version, status, reason))
}

/// Split a message head into its start line and parsed header list
fn parse_head(head: &[u8]) -> Result<(String, Headers)> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let start = lines.next().unwrap_or_default().to_string();

    let mut headers = Headers::new();
    for line in lines {
        if line.starts_with(|c: char| c == ' ' || c == '\t') {
            return Err(Error::InvalidHeader("obsolete line folding".to_string()));
        }
        if headers.is_full() {
            return Err(Error::InvalidHeader("too many header fields".to_string()));
        }
        let (name, value) = Headers::parse_header_line(line)?;
        headers.insert(name, value);
    }

    Ok((start, headers))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BodyKind {
    Empty,
    Length(usize),
    Chunked,
}

/// Work out how the body of a message is delimited
fn body_kind(headers: &Headers, max_body_size: usize) -> Result<BodyKind> {
    if headers.contains("Transfer-Encoding") {
        if headers.contains("Content-Length") {
            return Err(Error::Parse(
                "Both Transfer-Encoding and Content-Length present".to_string(),
            ));
        }
        let codings = headers.get_all("Transfer-Encoding").join(",");
        let last = codings.rsplit(',').next().unwrap_or_default().trim();
        if !last.eq_ignore_ascii_case("chunked") {
            return Err(Error::Parse(format!("Unsupported transfer coding: {}", codings)));
        }
        return Ok(BodyKind::Chunked);
    }

    let values = headers.get_all("Content-Length");
    let Some(first) = values.first() else {
        return Ok(BodyKind::Empty);
    };
    if values.iter().any(|v| v != first) {
        return Err(Error::Parse("Conflicting Content-Length values".to_string()));
    }
    let length = first
        .trim()
        .parse::<usize>()
        .map_err(|_| Error::Parse(format!("Invalid Content-Length: {}", first)))?;
    if length > max_body_size {
        return Err(Error::BodyTooLarge(max_body_size));
    }
    Ok(match length {
        0 => BodyKind::Empty,
        n => BodyKind::Length(n),
    })
}

/// Accumulates a message body out of the parser's buffer
#[derive(Debug)]
struct BodyReader {
    kind: BodyKind,
    body: Vec<u8>,
    chunked: ChunkedDecoder,
    max_size: usize,
}

impl BodyReader {
    fn new(kind: BodyKind, max_size: usize) -> Self {
        BodyReader {
            kind,
            body: Vec::new(),
            chunked: ChunkedDecoder::new(),
            max_size,
        }
    }

    /// Move body bytes out of `buffer`; true once the body is complete
    fn read(&mut self, buffer: &mut Vec<u8>) -> Result<bool> {
        match self.kind {
            BodyKind::Empty => Ok(true),
            BodyKind::Length(length) => {
                let take = (length - self.body.len()).min(buffer.len());
                self.body.extend(buffer.drain(..take));
                Ok(self.body.len() == length)
            }
            BodyKind::Chunked => {
                let (consumed, complete) = self.chunked.decode(buffer, &mut self.body)?;
                buffer.drain(..consumed);
                if self.body.len() > self.max_size {
                    return Err(Error::BodyTooLarge(self.max_size));
                }
                Ok(complete)
            }
        }
    }
}

#[derive(Debug)]
enum ParserState<H> {
    Head,
    Body(H, BodyReader),
}

/// HTTP/1.1 request parser
///
/// After a request is returned the parser is ready for the next one on the
/// same connection; call [`RequestParser::parse`] with an empty slice to
/// check for a pipelined request that is already buffered.
#[derive(Debug)]
pub struct RequestParser {
    state: ParserState<(Method, String, Version, Headers)>,
    buffer: Vec<u8>,
    max_head_size: usize,
    max_body_size: usize,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_HEAD_SIZE, DEFAULT_MAX_BODY_SIZE)
    }

    pub fn with_limits(max_head_size: usize, max_body_size: usize) -> Self {
        RequestParser {
            state: ParserState::Head,
            buffer: Vec::new(),
            max_head_size,
            max_body_size,
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(request)) when a complete request is parsed,
    /// Ok(None) if more data is needed, or Err on a malformed message.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpRequest>> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ParserState::Head => {
                    // Empty lines ahead of a request line are ignored
                    while self.buffer.starts_with(b"\r\n") {
                        self.buffer.drain(..2);
                    }

                    let Some(end) = find_head_end(&self.buffer) else {
                        if self.buffer.len() > self.max_head_size {
                            return Err(Error::HeadTooLarge(self.max_head_size));
                        }
                        return Ok(None);
                    };
                    if end + 4 > self.max_head_size {
                        return Err(Error::HeadTooLarge(self.max_head_size));
                    }

                    let (line, headers) = parse_head(&self.buffer[..end])?;
                    self.buffer.drain(..end + 4);

                    let (method, uri, version) = parse_request_line(&line)?;
                    let kind = body_kind(&headers, self.max_body_size)?;
                    let reader = BodyReader::new(kind, self.max_body_size);
                    self.state = ParserState::Body((method, uri, version, headers), reader);
                }

                ParserState::Body(..) => {
                    let ParserState::Body(head, mut reader) =
                        std::mem::replace(&mut self.state, ParserState::Head)
                    else {
                        continue;
                    };
                    if !reader.read(&mut self.buffer)? {
                        self.state = ParserState::Body(head, reader);
                        return Ok(None);
                    }

                    let (method, uri, version, headers) = head;

                    let request = HttpRequest::builder()
                        .method(method)
                        .uri(uri)
                        .version(version)
                        .headers(headers)
                        .body(reader.body)
                        .build();
                    return Ok(Some(request));
                }
            }
        }
    }

    /// Bytes received but not yet part of a parsed request
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the unparsed bytes, leaving the parser empty
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// True when no partial request is held
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ParserState::Head) && self.buffer.is_empty()
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP/1.1 response parser, used by clients
///
/// Bodies must be delimited by Content-Length or chunked coding; a response
/// with neither is treated as having no body.
#[derive(Debug)]
pub struct ResponseParser {
    state: ParserState<(Version, Status, String, Headers)>,
    buffer: Vec<u8>,
}

impl ResponseParser {
    pub fn new() -> Self {
        ResponseParser {
            state: ParserState::Head,
            buffer: Vec::new(),
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(response)) when a complete response is parsed,
    /// Ok(None) if more data is needed, or Err on parse error.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ParserState::Head => {
                    let Some(end) = find_head_end(&self.buffer) else {
                        if self.buffer.len() > DEFAULT_MAX_HEAD_SIZE {
                            return Err(Error::HeadTooLarge(DEFAULT_MAX_HEAD_SIZE));
                        }
                        return Ok(None);
                    };
                    let (line, headers) = parse_head(&self.buffer[..end])?;
                    self.buffer.drain(..end + 4);

                    let (version, status, reason) = parse_status_line(&line)?;
                    let kind = if status.forbids_body() {
                        BodyKind::Empty
                    } else {
                        body_kind(&headers, DEFAULT_MAX_BODY_SIZE)?
                    };
                    let reader = BodyReader::new(kind, DEFAULT_MAX_BODY_SIZE);
                    self.state = ParserState::Body((version, status, reason, headers), reader);
                }

                ParserState::Body(..) => {
                    let ParserState::Body(head, mut reader) =
                        std::mem::replace(&mut self.state, ParserState::Head)
                    else {
                        continue;
                    };
                    if !reader.read(&mut self.buffer)? {
                        self.state = ParserState::Body(head, reader);
                        return Ok(None);
                    }

                    let (version, status, reason, headers) = head;

                    let response = HttpResponse::builder()
                        .version(version)
                        .status(status)
                        .reason(reason)
                        .headers(headers)
                        .body(reader.body)
                        .build();
                    return Ok(Some(response));
                }
            }
        }
    }

    /// Take the bytes that followed the last parsed response
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Reset the parser for reuse
    pub fn reset(&mut self) {
        self.state = ParserState::Head;
        self.buffer.clear();
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::chunked::encode_chunked_body;

    #[test]
    fn test_parse_request_line() {
        let (method, uri, version) = parse_request_line("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(uri, "/index.html");
        assert_eq!(version, Version::Http11);

        assert!(parse_request_line("GET /index.html").is_err());
        assert!(parse_request_line("GET  / HTTP/1.1").is_err());
        assert!(parse_request_line("PRI * HTTP/2.0").is_err());
    }

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 101 Switching Protocols").unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status, Status::SWITCHING_PROTOCOLS);
        assert_eq!(reason, "Switching Protocols");

        let (_, status, reason) = parse_status_line("HTTP/1.0 404").unwrap();
        assert_eq!(status.code(), 404);
        assert_eq!(reason, "Not Found");
    }

    #[test]
    fn test_request_without_body() {
        let mut parser = RequestParser::new();
        let req = parser
            .parse(b"GET /foo HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap()
            .unwrap();

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/foo");
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert!(req.body().is_empty());
        assert!(parser.is_idle());
    }

    #[test]
    fn test_request_incremental_content_length() {
        let mut parser = RequestParser::new();

        assert!(parser.parse(b"POST /submit HT").unwrap().is_none());
        assert!(parser.parse(b"TP/1.1\r\nContent-Length: 4\r\n").unwrap().is_none());
        assert!(parser.parse(b"\r\nab").unwrap().is_none());
        let req = parser.parse(b"cd").unwrap().unwrap();

        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.body(), b"abcd");
    }

    #[test]
    fn test_request_chunked_body() {
        let mut wire = b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        wire.extend_from_slice(&encode_chunked_body(b"hello chunked world", 4));

        let mut parser = RequestParser::new();
        let req = parser.parse(&wire).unwrap().unwrap();
        assert_eq!(req.body(), b"hello chunked world");
    }

    #[test]
    fn test_pipelined_requests() {
        let mut parser = RequestParser::new();
        let wire = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c";

        let first = parser.parse(wire).unwrap().unwrap();
        assert_eq!(first.path(), "/a");
        let second = parser.parse(&[]).unwrap().unwrap();
        assert_eq!(second.path(), "/b");
        assert!(parser.parse(&[]).unwrap().is_none());
        assert_eq!(parser.buffered(), b"GET /c");
    }

    #[test]
    fn test_leftover_after_upgrade_request() {
        let mut parser = RequestParser::new();
        let mut wire = b"GET / HTTP/1.1\r\nUpgrade: h2c\r\n\r\n".to_vec();
        wire.extend_from_slice(b"PRI * HTTP/2.0\r\n");

        assert!(parser.parse(&wire).unwrap().is_some());
        assert_eq!(parser.take_remaining(), b"PRI * HTTP/2.0\r\n");
        assert!(parser.is_idle());
    }

    #[test]
    fn test_rejects_malformed_requests() {
        let bad: [&[u8]; 5] = [
            b"GET / HTTP/1.1\r\nContent-Length: abc\r\n\r\n",
            b"GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
            b"GET / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",
            b"GET / HTTP/1.1\r\nX-Folded: a\r\n b\r\n\r\n",
            b"BREW /pot HTTP/1.1\r\n\r\n",
        ];
        for wire in bad {
            assert!(RequestParser::new().parse(wire).is_err());
        }
    }

    #[test]
    fn test_limits() {
        let mut parser = RequestParser::with_limits(32, 8);
        let wire = b"GET /a-very-long-path-indeed HTTP/1.1\r\n\r\n";
        assert!(matches!(parser.parse(wire), Err(Error::HeadTooLarge(32))));

        let mut parser = RequestParser::with_limits(1024, 8);
        let wire = b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n";
        assert!(matches!(parser.parse(wire), Err(Error::BodyTooLarge(8))));
    }

    #[test]
    fn test_response_parser_keeps_trailing_frames() {
        let mut parser = ResponseParser::new();
        let wire = b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n\x00\x00\x00\x04";

        let resp = parser.parse(wire).unwrap().unwrap();
        assert_eq!(resp.status(), Status::SWITCHING_PROTOCOLS);
        assert_eq!(resp.headers().get("upgrade"), Some("h2c"));
        assert_eq!(parser.take_remaining(), b"\x00\x00\x00\x04");
    }

    #[test]
    fn test_response_parser_incremental() {
        let mut parser = ResponseParser::new();

        assert!(parser.parse(b"HTTP/1.1 ").unwrap().is_none());
        assert!(parser.parse(b"200 OK\r\n").unwrap().is_none());
        assert!(parser.parse(b"Content-Type: text/plain\r\n").unwrap().is_none());
        assert!(parser.parse(b"Content-Length: 4\r\n\r\n").unwrap().is_none());
        let resp = parser.parse(b"Test").unwrap().unwrap();

        assert_eq!(resp.body(), b"Test");
        assert_eq!(resp.headers().get("Content-Type"), Some("text/plain"));
    }
}

//! HTTP message types
//!
//! These are the request and response types handed to and returned by the
//! application handler. They carry no framing information: the legacy driver
//! and the HTTP/2 server both translate to and from them.

use super::{Error, Headers, Result, CRLF};
use std::fmt;
use std::str::FromStr;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP version a request arrived with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
    /// Framed HTTP/2, either upgraded or with prior knowledge
    Http2,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2.0",
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    /// Parse the version of an HTTP/1.x request or status line
    ///
    /// `HTTP/2.0` only appears in the connection preface, which is never
    /// parsed as a request line.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    pub const SWITCHING_PROTOCOLS: Status = Status { code: 101 };
    pub const OK: Status = Status { code: 200 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };

    /// Create a status code in the 100..600 range
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Canonical reason phrase for the code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            426 => "Upgrade Required",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Responses with these codes never carry a body (RFC 9110 6.4.1)
    pub fn forbids_body(&self) -> bool {
        self.is_informational() || self.code == 204 || self.code == 304
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// A logical HTTP request as the handler sees it
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    uri: String,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
    secure: bool,
    stream_id: Option<u32>,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        HttpRequest {
            method,
            uri: uri.into(),
            version: Version::default(),
            headers: Headers::new(),
            body: Vec::new(),
            secure: false,
            stream_id: None,
        }
    }

    pub fn builder() -> HttpRequestBuilder {
        HttpRequestBuilder::default()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Request target exactly as received (path plus optional query)
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Path component of the request target, without the query
    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(pos) => &self.uri[..pos],
            None => &self.uri,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Whether the transport the request arrived on was encrypted
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// HTTP/2 stream the request arrived on, `None` for HTTP/1.x
    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub(crate) fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = Some(stream_id);
    }

    /// HTTP/1.1 keep-alive decision for this request
    pub fn wants_keep_alive(&self) -> bool {
        match self.version {
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
            _ => !self.headers.has_token("Connection", "close"),
        }
    }

    /// Serialize as an HTTP/1.1 request
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.body.len());

        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.uri.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }

        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct HttpRequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: Vec<u8>,
    secure: bool,
}

impl HttpRequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn build(self) -> HttpRequest {
        HttpRequest {
            method: self.method.unwrap_or(Method::Get),
            uri: self.uri.unwrap_or_else(|| "/".to_string()),
            version: self.version.unwrap_or_default(),
            headers: self.headers,
            body: self.body,
            secure: self.secure,
            stream_id: None,
        }
    }
}

/// An HTTP response produced by the handler
#[derive(Debug, Clone)]
pub struct HttpResponse {
    version: Version,
    status: Status,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: Status) -> Self {
        HttpResponse {
            version: Version::default(),
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn builder() -> HttpResponseBuilder {
        HttpResponseBuilder::default()
    }

    /// Plain-text response with the given status, used for server errors
    pub fn text(status: Status, body: &str) -> Self {
        HttpResponse::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.as_bytes().to_vec())
            .build()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Serialize as an HTTP/1.1 response
    ///
    /// `include_body` is false for responses to HEAD, which keep their
    /// headers (including Content-Length) but send no payload.
    pub fn to_wire(&self, include_body: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.body.len());

        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.code().to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.reason.as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }

        buf.extend_from_slice(CRLF.as_bytes());
        if include_body {
            buf.extend_from_slice(&self.body);
        }
        buf
    }
}

/// Builder for HTTP responses
#[derive(Debug, Default)]
pub struct HttpResponseBuilder {
    version: Option<Version>,
    status: Option<Status>,
    reason: Option<String>,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpResponseBuilder {
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> HttpResponse {
        let status = self.status.unwrap_or(Status::OK);
        let reason = self.reason.unwrap_or_else(|| status.reason_phrase().to_string());
        HttpResponse {
            version: self.version.unwrap_or_default(),
            status,
            reason,
            headers: self.headers,
            body: self.body,
        }
    }
}

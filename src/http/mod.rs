//! HTTP/1.1 and h2c server implementation
//!
//! # Architecture
//!
//! A connection moves through three layers:
//!
//! - `SessionOps` abstracts the byte transport (poll, read, write, close), so
//!   the drivers never touch a socket directly
//! - `detect` looks at the first bytes and picks legacy HTTP/1.1, the h2c
//!   upgrade handshake, or HTTP/2 prior knowledge
//! - `driver` runs the legacy request loop inline, or hands the connection to
//!   the framed HTTP/2 server in [`h2`]
//!
//! # Examples
//!
//! ```no_run
//! use h2c_server::http::{handler_fn, HttpResponse, ServerConfig, Status};
//! use h2c_server::net::Listener;
//!
//! let handler = handler_fn(|request| {
//!     Ok(HttpResponse::builder()
//!         .status(Status::OK)
//!         .body(format!("Hi, <{}>!\n", request.uri()).into_bytes())
//!         .build())
//! });
//!
//! let listener = Listener::bind("127.0.0.1:8080", handler, ServerConfig::default()).unwrap();
//! listener.serve().unwrap();
//! ```

pub mod chunked;
pub mod config;
pub mod detect;
pub mod driver;
pub mod h2;
pub mod handler;
pub mod headers;
pub mod message;
pub mod parser;
pub mod session;

pub use config::{ServeMode, ServerConfig, ServerConfigBuilder};
pub use detect::Detection;
pub use driver::{Connection, Mode};
pub use handler::{handler_fn, Handler, HandlerFn};
pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse, Method, Status, Version};
pub use parser::{RequestParser, ResponseParser};
pub use session::{HttpSession, SessionOps, TcpSession};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("HTTP/2 error: {0}")]
    H2(Box<h2::Error>),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handler error: {0}")]
    Handler(String),
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Self {
        Error::H2(Box::new(err))
    }
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 100;

/// Default HTTP port used by the demo binary
pub const DEFAULT_HTTP_PORT: u16 = 1010;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

//! HTTP/2 over cleartext (h2c)
//!
//! # Architecture
//!
//! A framed connection is split across threads:
//!
//! - the read loop in [`server`] owns the socket's read side. It decodes
//!   frames with [`codec`] and feeds them to the [`multiplexer`], which
//!   tracks stream state, header blocks and receive windows
//! - the [`writer`] owns the write side. It holds the HPACK encoder and the
//!   send windows, and interleaves DATA from all ready streams
//! - each complete request runs its handler on a thread of its own and
//!   hands the response to the writer
//!
//! The read loop talks to the writer through a command channel; the writer
//! reports finished streams and send-side violations back through an event
//! channel.
//!
//! [`client`] holds a frame-level client for driving the server in tests.
//!
//! # Example
//!
//! ```no_run
//! use h2c_server::http::h2::H2Client;
//! use h2c_server::http::TcpSession;
//! use std::net::TcpStream;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:1010")?;
//! let mut client = H2Client::new(TcpSession::new(stream))?;
//! client.connect()?;
//!
//! let response = client.get("/foo")?;
//! println!("{} {}", response.status(), response.body_string()?);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod hpack;
pub mod multiplexer;
pub mod server;
pub mod settings;
pub mod stream;
pub mod writer;

pub use client::{H2Client, H2ClientBuilder, H2Response};
pub use error::{Error, ErrorCode, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use multiplexer::StreamMultiplexer;
pub use server::H2Server;
pub use settings::{Settings, SettingsBuilder};
pub use stream::{H2Stream, StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;

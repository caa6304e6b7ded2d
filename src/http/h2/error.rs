//! HTTP/2 error types
//!
//! Errors are split by scope. [`Error::Stream`] affects a single stream and
//! is answered with RST_STREAM; every other protocol variant is a connection
//! error answered with GOAWAY carrying [`Error::code`].

use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error from underlying HTTP layer
    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    /// Protocol error detected (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error (RFC 7540 Section 7 - Error code 0x2)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Flow control error (RFC 7540 Section 7 - Error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Compression error (RFC 7540 Section 7 - Error code 0x9)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Error confined to one stream, answered with RST_STREAM
    #[error("Stream {stream_id} error {code}: {reason}")]
    Stream {
        stream_id: u32,
        code: ErrorCode,
        reason: String,
    },

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Peer sent GOAWAY
    #[error("GOAWAY received: last stream {last_stream_id}, {code}")]
    GoAway { last_stream_id: u32, code: ErrorCode },

    /// Peer reset a stream we were waiting on
    #[error("Stream {stream_id} reset by peer: {code}")]
    Reset { stream_id: u32, code: ErrorCode },

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Missing connection preface
    #[error("Missing connection preface")]
    MissingPreface,

    /// Timeout waiting for operation
    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Build a stream-scoped error
    pub fn stream(stream_id: u32, code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Stream {
            stream_id,
            code,
            reason: reason.into(),
        }
    }

    /// Error code to put on the wire for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) | Error::InvalidSettings(_) | Error::MissingPreface => {
                ErrorCode::ProtocolError
            }
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Stream { code, .. } => *code,
            Error::GoAway { code, .. } | Error::Reset { code, .. } => *code,
            Error::Io(_)
            | Error::Http(_)
            | Error::Internal(_)
            | Error::ConnectionClosed
            | Error::Timeout => ErrorCode::InternalError,
        }
    }

    /// True when the error only affects one stream
    pub fn is_stream_error(&self) -> bool {
        matches!(self, Error::Stream { .. })
    }

    /// True for transport failures, where nothing more can be written
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionClosed => true,
            Error::Http(err) => matches!(
                err,
                crate::http::Error::Io(_) | crate::http::Error::ConnectionClosed
            ),
            _ => false,
        }
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Decode a code received on the wire
    ///
    /// Unknown codes carry no special meaning and read as INTERNAL_ERROR
    /// (RFC 7540 Section 7).
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

//! Protocol detection on a fresh connection
//!
//! The first bytes decide how a connection is served, once and for all:
//!
//! - the 24-byte HTTP/2 preface means prior knowledge, decided from those
//!   bytes alone
//! - anything else is read as an HTTP/1.1 request, which is either a valid
//!   h2c upgrade or a legacy request

use super::config::ServeMode;
use super::h2::settings::Settings;
use super::h2::CONNECTION_PREFACE;
use super::parser::RequestParser;
use super::session::{HttpSession, SessionOps};
use super::{Error, HttpRequest, Result, Version};

/// Result of looking at the first request on a connection
#[derive(Debug)]
pub enum Detection {
    /// The client sent the HTTP/2 connection preface
    PriorKnowledge,
    /// A complete HTTP/1.1 request asking to switch to h2c
    Upgrade(UpgradeRequest),
    /// A plain HTTP/1.1 request
    Legacy(HttpRequest),
}

/// An accepted h2c upgrade request
#[derive(Debug)]
pub struct UpgradeRequest {
    pub request: HttpRequest,
    /// Decoded from the `HTTP2-Settings` header
    pub settings: Settings,
}

/// What the bytes seen so far look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preface {
    /// A proper prefix of the preface; more bytes are needed
    Partial,
    /// The complete preface
    Http2,
    /// Not the preface
    Http1,
}

/// Compare the start of a connection against the HTTP/2 preface
pub fn classify(data: &[u8]) -> Preface {
    if data.len() >= CONNECTION_PREFACE.len() {
        if data.starts_with(CONNECTION_PREFACE) {
            Preface::Http2
        } else {
            Preface::Http1
        }
    } else if CONNECTION_PREFACE.starts_with(data) {
        Preface::Partial
    } else {
        Preface::Http1
    }
}

/// Decide between an h2c upgrade and a legacy request
///
/// An upgrade needs `Upgrade: h2c`, a `Connection` header listing both
/// `Upgrade` and `HTTP2-Settings`, and exactly one decodable
/// `HTTP2-Settings` header. Anything short of that is served as HTTP/1.1.
pub fn classify_request(request: HttpRequest) -> Detection {
    let headers = request.headers();
    let wants_upgrade = request.version() == Version::Http11
        && headers.has_token("Upgrade", "h2c")
        && headers.has_token("Connection", "Upgrade")
        && headers.has_token("Connection", "HTTP2-Settings");

    if !wants_upgrade {
        return Detection::Legacy(request);
    }

    if headers.count("HTTP2-Settings") != 1 {
        tracing::debug!("h2c upgrade without exactly one HTTP2-Settings header");
        return Detection::Legacy(request);
    }

    let value = headers.get("HTTP2-Settings").unwrap_or_default();
    match Settings::from_http2_settings_header(value) {
        Ok(settings) => Detection::Upgrade(UpgradeRequest { request, settings }),
        Err(err) => {
            tracing::debug!(error = %err, "ignoring h2c upgrade with bad HTTP2-Settings");
            Detection::Legacy(request)
        }
    }
}

/// Read from a fresh connection until its protocol is known
///
/// On `PriorKnowledge` the preface and whatever followed it stay in
/// `buffer`. On `Upgrade` the bytes after the request are moved back into
/// `buffer`. On `Legacy` they stay in `parser` for the next request.
pub fn detect<S: SessionOps>(
    session: &mut HttpSession<S>,
    buffer: &mut Vec<u8>,
    parser: &mut RequestParser,
    mode: ServeMode,
) -> Result<Detection> {
    loop {
        match classify(buffer) {
            Preface::Http2 => return Ok(Detection::PriorKnowledge),
            Preface::Http1 => break,
            Preface::Partial => {
                if session.read_into(buffer)? == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }
        }
    }

    if mode == ServeMode::PriorKnowledgeOnly {
        return Err(Error::Protocol(
            "connection did not start with the HTTP/2 preface".to_string(),
        ));
    }

    let mut pending = std::mem::take(buffer);
    let request = loop {
        if let Some(request) = parser.parse(&pending)? {
            break request;
        }
        pending.clear();
        if session.read_into(&mut pending)? == 0 {
            return Err(Error::ConnectionClosed);
        }
    };

    let detection = classify_request(request);
    if let Detection::Upgrade(_) = detection {
        *buffer = parser.take_remaining();
    }
    Ok(detection)
}

//! Per-connection driver
//!
//! [`Connection`] owns an accepted session from the first byte to close. It
//! runs detection, then either serves HTTP/1.1 requests inline or hands the
//! session to the framed [`H2Server`]. A connection never changes mode after
//! detection; a legacy connection stays HTTP/1.1 even if a later request
//! looks like the HTTP/2 preface.

use super::config::ServerConfig;
use super::detect::{self, Detection};
use super::h2::H2Server;
use super::handler::{self, Handler};
use super::parser::RequestParser;
use super::session::{HttpSession, SessionOps};
use super::{Error, HttpRequest, HttpResponse, Method, Result, Version};
use std::fmt;
use std::sync::Arc;

/// How a connection was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain HTTP/1.1 for the life of the connection
    Legacy,
    /// HTTP/1.1 upgraded to h2c after a 101 response
    UpgradedH2c,
    /// HTTP/2 from the first byte
    PriorKnowledgeH2c,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Legacy => "http/1.1",
            Mode::UpgradedH2c => "h2c-upgrade",
            Mode::PriorKnowledgeH2c => "h2c-prior-knowledge",
        };
        f.write_str(name)
    }
}

const SWITCHING_PROTOCOLS: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n";

/// An accepted connection and everything needed to serve it
pub struct Connection<S: SessionOps> {
    session: HttpSession<S>,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
}

impl<S: SessionOps> Connection<S> {
    pub fn new(session: HttpSession<S>, handler: Arc<dyn Handler>, config: ServerConfig) -> Self {
        Connection {
            session,
            handler,
            config,
        }
    }

    /// Serve the connection until it closes, returning the detected mode
    ///
    /// Malformed first input closes the connection without a response.
    pub fn serve(mut self) -> Result<Mode> {
        self.session.set_timeout(Some(self.config.idle_timeout));

        let mut buffer = Vec::new();
        let mut parser =
            RequestParser::with_limits(self.config.max_head_size, self.config.max_body_size);

        let detection =
            match detect::detect(&mut self.session, &mut buffer, &mut parser, self.config.mode) {
                Ok(detection) => detection,
                Err(err) => {
                    let _ = self.session.close();
                    return Err(err);
                }
            };

        match detection {
            Detection::PriorKnowledge => {
                tracing::debug!(peer = ?self.session.peer_addr(), mode = %Mode::PriorKnowledgeH2c, "detected");
                H2Server::new(self.session, self.handler, self.config)
                    .serve_prior_knowledge(buffer)?;
                Ok(Mode::PriorKnowledgeH2c)
            }
            Detection::Upgrade(upgrade) => {
                tracing::debug!(peer = ?self.session.peer_addr(), mode = %Mode::UpgradedH2c, "detected");
                self.session.write_all(SWITCHING_PROTOCOLS)?;
                H2Server::new(self.session, self.handler, self.config)
                    .serve_upgraded(upgrade, buffer)?;
                Ok(Mode::UpgradedH2c)
            }
            Detection::Legacy(request) => {
                tracing::debug!(peer = ?self.session.peer_addr(), mode = %Mode::Legacy, "detected");
                let result = self.serve_legacy(request, parser);
                let _ = self.session.close();
                result.map(|()| Mode::Legacy)
            }
        }
    }

    /// HTTP/1.1 request loop
    fn serve_legacy(&mut self, first: HttpRequest, mut parser: RequestParser) -> Result<()> {
        let mut request = first;
        loop {
            let keep_alive = request.wants_keep_alive();
            let version = request.version();
            let head_only = request.method() == Method::Head;
            tracing::debug!(method = %request.method(), path = request.path(), "request");

            let response =
                handler::call_with_deadline(&self.handler, request, self.config.stream_timeout)?;
            let response = finish_response(response, version, keep_alive);
            self.session.write_all(&response.to_wire(!head_only))?;

            if !keep_alive {
                return Ok(());
            }
            request = match self.next_request(&mut parser)? {
                Some(request) => request,
                None => return Ok(()),
            };
        }
    }

    /// Read the next request, or `None` once the client is done
    fn next_request(&mut self, parser: &mut RequestParser) -> Result<Option<HttpRequest>> {
        // Pipelined requests may already be buffered
        if let Some(request) = parser.parse(&[])? {
            return Ok(Some(request));
        }

        let mut chunk = Vec::with_capacity(8192);
        loop {
            chunk.clear();
            match self.session.read_into(&mut chunk) {
                Ok(0) => {
                    if !parser.is_idle() {
                        tracing::debug!("connection closed mid-request");
                    }
                    return Ok(None);
                }
                Ok(_) => {}
                Err(Error::Timeout) if parser.is_idle() => {
                    tracing::debug!(timeout = ?self.config.idle_timeout, "closing idle connection");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
            if let Some(request) = parser.parse(&chunk)? {
                return Ok(Some(request));
            }
        }
    }
}

/// Fill in the framing headers the handler left out
fn finish_response(mut response: HttpResponse, version: Version, keep_alive: bool) -> HttpResponse {
    let forbids_body = response.status().forbids_body();
    let length = response.body().len();
    let headers = response.headers_mut();

    headers.remove("Transfer-Encoding");
    if forbids_body {
        headers.remove("Content-Length");
    } else {
        headers.set("Content-Length", length.to_string());
    }

    if !keep_alive {
        headers.set("Connection", "close");
    } else if version == Version::Http10 {
        headers.set("Connection", "keep-alive");
    }

    if forbids_body {
        response.set_body(Vec::new());
    }
    response
}

//! HTTP/2 server connection
//!
//! [`H2Server`] serves one framed connection, whether it started with the
//! preface or arrived through an h2c upgrade. The calling thread becomes the
//! read loop; a second thread runs the [`FrameWriter`]; each request gets a
//! thread of its own for the handler call.
//!
//! The read loop wakes up at least every `poll_interval` to pick up writer
//! events and check the stream and idle timers.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::frames::{PingFrame, SettingsFrame, WindowUpdateFrame};
use super::hpack::HeaderEncoder;
use super::multiplexer::{CloseReason, Effect, StreamMultiplexer};
use super::writer::{CancelHandle, FrameWriter, WriterCommand, WriterEvent};
use super::CONNECTION_PREFACE;
use crate::http::config::ServerConfig;
use crate::http::detect::UpgradeRequest;
use crate::http::handler::{self, Handler};
use crate::http::session::{HttpSession, SessionOps};
use crate::http::{HttpRequest, Method};
use bytes::{Buf, BytesMut};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Framed HTTP/2 connection on the server side
pub struct H2Server<S: SessionOps> {
    session: HttpSession<S>,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
}

enum Flow {
    Continue,
    Stop,
}

impl<S: SessionOps> H2Server<S> {
    pub fn new(session: HttpSession<S>, handler: Arc<dyn Handler>, config: ServerConfig) -> Self {
        H2Server {
            session,
            handler,
            config,
        }
    }

    /// Serve a connection that opened with the preface
    ///
    /// `buffered` holds the bytes read during detection, preface included.
    pub fn serve_prior_knowledge(self, buffered: Vec<u8>) -> Result<()> {
        self.run(buffered, None)
    }

    /// Serve a connection after `101 Switching Protocols` was sent
    ///
    /// The upgrade request becomes stream 1. `buffered` holds whatever the
    /// client sent after the request.
    pub fn serve_upgraded(self, upgrade: UpgradeRequest, buffered: Vec<u8>) -> Result<()> {
        self.run(buffered, Some(upgrade))
    }

    fn run(mut self, buffered: Vec<u8>, upgrade: Option<UpgradeRequest>) -> Result<()> {
        let (commands, command_rx) = mpsc::channel();
        let (event_tx, events) = mpsc::channel();

        let write_half = self.session.try_clone()?;
        let writer = FrameWriter::new(write_half, HeaderEncoder::new(), command_rx, event_tx);
        let cancel = writer.cancel_handle();
        let writer_thread = thread::Builder::new()
            .name("h2-writer".to_string())
            .spawn(move || writer.run())?;

        let mux = StreamMultiplexer::new(
            self.config.settings.clone(),
            self.config.max_head_size,
            self.session.is_secure(),
        )
        .with_max_body_size(self.config.max_body_size);
        let mut conn = ReadLoop {
            commands: commands.clone(),
            events,
            cancel,
            mux,
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            buf: BytesMut::from(&buffered[..]),
            last_activity: Instant::now(),
        };

        let result = conn.serve(&mut self.session, upgrade);
        match &result {
            Ok(()) => {}
            Err(err) if err.is_transport() => {
                tracing::debug!(error = %err, "connection lost");
            }
            Err(err) => {
                tracing::warn!(code = %err.code(), error = %err, "connection error, sending GOAWAY");
                let _ = commands.send(WriterCommand::GoAway {
                    last_stream_id: conn.mux.last_stream_id(),
                    code: err.code(),
                    debug: err.to_string(),
                });
            }
        }

        let _ = commands.send(WriterCommand::Shutdown);
        drop(conn);
        drop(commands);
        if writer_thread.join().is_err() {
            tracing::error!("frame writer panicked");
        }
        let _ = self.session.close();
        result
    }
}

/// State owned by the read loop
struct ReadLoop {
    commands: Sender<WriterCommand>,
    events: Receiver<WriterEvent>,
    /// Set when the peer sends GOAWAY; queued responses are not written
    cancel: CancelHandle,
    mux: StreamMultiplexer,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    buf: BytesMut,
    last_activity: Instant,
}

impl ReadLoop {
    fn serve<S: SessionOps>(
        &mut self,
        session: &mut HttpSession<S>,
        upgrade: Option<UpgradeRequest>,
    ) -> Result<()> {
        // Our SETTINGS are the first frame on the connection
        let settings = SettingsFrame::new(self.config.settings.clone());
        self.send(WriterCommand::Send(FrameCodec::encode_settings_frame(&settings)))?;

        if let Some(upgrade) = upgrade {
            // The 101 response acknowledges HTTP2-Settings implicitly
            self.send(WriterCommand::PeerSettings {
                settings: upgrade.settings,
                ack: false,
            })?;
            let request = self.mux.open_upgraded_stream(upgrade.request)?;
            self.send(WriterCommand::OpenStream(1))?;
            self.spawn_handler(request)?;
        }

        self.read_preface(session)?;

        let max_frame_size = self.config.settings.get_max_frame_size();
        loop {
            self.drain_events()?;

            while let Some(frame) = FrameCodec::decode(&mut self.buf, max_frame_size)? {
                for effect in self.mux.dispatch(frame)? {
                    if let Flow::Stop = self.apply(effect)? {
                        return Ok(());
                    }
                }
            }

            if let Flow::Stop = self.check_timers()? {
                return Ok(());
            }

            if session.poll_read(Some(self.config.poll_interval))? {
                let mut chunk = [0u8; 16384];
                let n = session.read(&mut chunk)?;
                if n == 0 {
                    tracing::debug!("peer closed the connection");
                    return Ok(());
                }
                self.buf.extend_from_slice(&chunk[..n]);
                self.last_activity = Instant::now();
            }
        }
    }

    /// Wait for and consume the client connection preface
    fn read_preface<S: SessionOps>(&mut self, session: &mut HttpSession<S>) -> Result<()> {
        let len = CONNECTION_PREFACE.len();
        while self.buf.len() < len {
            let received = &self.buf[..];
            if !CONNECTION_PREFACE.starts_with(received) {
                break;
            }
            let mut chunk = [0u8; 1024];
            let n = session.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }

        if !self.buf.starts_with(CONNECTION_PREFACE) {
            return Err(Error::MissingPreface);
        }
        self.buf.advance(len);
        Ok(())
    }

    fn drain_events(&mut self) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(WriterEvent::Finished(stream_id)) => {
                    self.mux.close_stream(stream_id, CloseReason::Completed);
                    self.last_activity = Instant::now();
                }
                Ok(WriterEvent::Violation(Error::Stream {
                    stream_id,
                    code,
                    reason,
                })) => {
                    tracing::info!(stream_id, %code, %reason, "resetting stream");
                    self.mux.close_stream(stream_id, CloseReason::Reset);
                    self.send(WriterCommand::Reset { stream_id, code })?;
                }
                Ok(WriterEvent::Violation(err)) | Ok(WriterEvent::Failed(err)) => return Err(err),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(Error::ConnectionClosed),
            }
        }
    }

    fn apply(&mut self, effect: Effect) -> Result<Flow> {
        match effect {
            Effect::Opened(stream_id) => self.send(WriterCommand::OpenStream(stream_id))?,
            Effect::Request(request) => self.spawn_handler(request)?,
            Effect::Reset { stream_id, code } => {
                self.send(WriterCommand::Reset { stream_id, code })?
            }
            Effect::Cancelled(stream_id) => self.send(WriterCommand::Cancel(stream_id))?,
            Effect::WindowUpdate {
                stream_id,
                increment,
            } => {
                let frame = WindowUpdateFrame::new(stream_id, increment);
                self.send(WriterCommand::Send(FrameCodec::encode_window_update_frame(&frame)))?;
            }
            Effect::SendCredit {
                stream_id,
                increment,
            } => self.send(WriterCommand::SendCredit {
                stream_id,
                increment,
            })?,
            Effect::PeerSettings(settings) => {
                self.send(WriterCommand::PeerSettings { settings, ack: true })?
            }
            Effect::SettingsAcked => {}
            Effect::PingAck(data) => {
                let frame = PingFrame::ack(data);
                self.send(WriterCommand::Send(FrameCodec::encode_ping_frame(&frame)))?;
            }
            Effect::GoAway { code, .. } => {
                if code != ErrorCode::NoError {
                    tracing::warn!(%code, "peer closed the connection with an error");
                }
                self.cancel.cancel();
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Run the handler for a complete request on its own thread
    fn spawn_handler(&mut self, request: HttpRequest) -> Result<()> {
        let stream_id = request
            .stream_id()
            .ok_or_else(|| Error::Internal("request without a stream".to_string()))?;
        let head_only = request.method() == Method::Head;
        let handler = Arc::clone(&self.handler);
        let commands = self.commands.clone();

        tracing::debug!(stream_id, method = %request.method(), path = request.path(), "dispatching request");
        thread::Builder::new()
            .name(format!("h2-stream-{}", stream_id))
            .spawn(move || {
                let response = handler::call(&*handler, request);
                let _ = commands.send(WriterCommand::Response {
                    stream_id,
                    response,
                    head_only,
                });
            })?;
        Ok(())
    }

    fn check_timers(&mut self) -> Result<Flow> {
        let now = Instant::now();

        for stream_id in self.mux.expired_streams(now, self.config.stream_timeout) {
            tracing::warn!(stream_id, timeout = ?self.config.stream_timeout, "stream timed out");
            self.mux.close_stream(stream_id, CloseReason::TimedOut);
            self.send(WriterCommand::Reset {
                stream_id,
                code: ErrorCode::Cancel,
            })?;
        }

        if self.mux.is_idle()
            && now.saturating_duration_since(self.last_activity) >= self.config.idle_timeout
        {
            tracing::info!(timeout = ?self.config.idle_timeout, "closing idle connection");
            self.send(WriterCommand::GoAway {
                last_stream_id: self.mux.last_stream_id(),
                code: ErrorCode::NoError,
                debug: "idle timeout".to_string(),
            })?;
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    fn send(&self, command: WriterCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }
}

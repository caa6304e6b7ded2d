//! Serialized write path of a framed connection
//!
//! A [`FrameWriter`] runs on its own thread and is the only code that writes
//! to the socket once a connection is framed. It owns the HPACK encoder and
//! every send window, and takes work from the read loop and from handler
//! threads over one channel. Responses are interleaved at frame
//! granularity: each pass sends at most one DATA frame per stream, in
//! round-robin order, as far as the windows allow.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use super::frames::{
    ContinuationFrame, DataFrame, GoawayFrame, HeadersFrame, RstStreamFrame, SettingsFrame,
};
use super::hpack::HeaderEncoder;
use super::settings::Settings;
use super::stream::StreamId;
use super::CONNECTION_STREAM_ID;
use crate::http::session::{HttpSession, SessionOps};
use crate::http::HttpResponse;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;

/// Work for the writer thread
#[derive(Debug)]
pub enum WriterCommand {
    /// Write frames that are already encoded
    Send(Bytes),
    /// A stream was opened; start tracking its send window
    OpenStream(StreamId),
    /// A handler's response
    Response {
        stream_id: StreamId,
        response: HttpResponse,
        /// Response to HEAD: headers only
        head_only: bool,
    },
    /// WINDOW_UPDATE from the peer
    SendCredit { stream_id: StreamId, increment: u32 },
    /// Apply the peer's SETTINGS, acknowledging them if `ack`
    PeerSettings { settings: Settings, ack: bool },
    /// Send RST_STREAM and drop anything queued for the stream
    Reset { stream_id: StreamId, code: ErrorCode },
    /// The peer reset the stream; drop it silently
    Cancel(StreamId),
    /// Send GOAWAY, then stop
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug: String,
    },
    /// Stop without sending anything more
    Shutdown,
}

/// Reports from the writer back to the read loop
#[derive(Debug)]
pub enum WriterEvent {
    /// The last frame of this stream's response is about to be written
    Finished(StreamId),
    /// The peer broke a flow-control rule the writer enforces
    Violation(Error),
    /// Writing failed; the writer has stopped
    Failed(Error),
}

/// Stops a writer ahead of whatever is still in its queue
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-stream send state
struct OutStream {
    window: FlowControlWindow,
    body: Bytes,
    offset: usize,
}

impl OutStream {
    fn remaining(&self) -> usize {
        self.body.len() - self.offset
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Headers that must not appear in an HTTP/2 response
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

pub struct FrameWriter<S: SessionOps> {
    session: HttpSession<S>,
    encoder: HeaderEncoder,
    peer_settings: Settings,
    conn_window: FlowControlWindow,
    streams: HashMap<StreamId, OutStream>,
    /// Streams with body bytes left, in round-robin order
    ready: VecDeque<StreamId>,
    commands: Receiver<WriterCommand>,
    events: Sender<WriterEvent>,
    cancel: CancelHandle,
}

impl<S: SessionOps> FrameWriter<S> {
    pub fn new(
        session: HttpSession<S>,
        encoder: HeaderEncoder,
        commands: Receiver<WriterCommand>,
        events: Sender<WriterEvent>,
    ) -> Self {
        FrameWriter {
            session,
            encoder,
            peer_settings: Settings::default(),
            conn_window: FlowControlWindow::new(),
            streams: HashMap::new(),
            ready: VecDeque::new(),
            commands,
            events,
            cancel: CancelHandle::default(),
        }
    }

    /// Handle for discarding queued work once the connection is going away
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run until told to stop, the channel closes or a write fails
    pub fn run(mut self) {
        if let Err(err) = self.serve() {
            tracing::debug!(error = %err, "frame writer stopped");
            let _ = self.events.send(WriterEvent::Failed(err));
        }
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            let command = if self.can_send_data() {
                match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            } else {
                match self.commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => return Ok(()),
                }
            };

            if self.cancel.is_cancelled() {
                tracing::debug!(streams = self.streams.len(), "writer cancelled, dropping queued output");
                return Ok(());
            }

            // Commands first; DATA only goes out once the queue is drained
            match command {
                Some(command) => {
                    if let Flow::Stop = self.handle(command)? {
                        return Ok(());
                    }
                }
                None => self.send_round()?,
            }
        }
    }

    fn handle(&mut self, command: WriterCommand) -> Result<Flow> {
        match command {
            WriterCommand::Send(bytes) => self.write(bytes)?,
            WriterCommand::OpenStream(stream_id) => {
                let window =
                    FlowControlWindow::with_initial_size(self.peer_settings.get_initial_window_size());
                self.streams.insert(
                    stream_id,
                    OutStream {
                        window,
                        body: Bytes::new(),
                        offset: 0,
                    },
                );
            }
            WriterCommand::Response {
                stream_id,
                response,
                head_only,
            } => self.start_response(stream_id, response, head_only)?,
            WriterCommand::SendCredit {
                stream_id,
                increment,
            } => self.add_credit(stream_id, increment),
            WriterCommand::PeerSettings { settings, ack } => {
                self.apply_settings(settings);
                if ack {
                    self.write(FrameCodec::encode_settings_frame(&SettingsFrame::ack()))?;
                }
            }
            WriterCommand::Reset { stream_id, code } => {
                self.drop_stream(stream_id);
                self.write(FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(
                    stream_id, code,
                )))?;
            }
            WriterCommand::Cancel(stream_id) => self.drop_stream(stream_id),
            WriterCommand::GoAway {
                last_stream_id,
                code,
                debug,
            } => {
                let frame = GoawayFrame::new(last_stream_id, code, Bytes::from(debug));
                self.write(FrameCodec::encode_goaway_frame(&frame))?;
                return Ok(Flow::Stop);
            }
            WriterCommand::Shutdown => return Ok(Flow::Stop),
        }
        Ok(Flow::Continue)
    }

    /// Send the response head and queue its body
    fn start_response(
        &mut self,
        stream_id: StreamId,
        response: HttpResponse,
        head_only: bool,
    ) -> Result<()> {
        if !self.streams.contains_key(&stream_id) {
            tracing::debug!(stream_id, "discarding response for closed stream");
            return Ok(());
        }

        let status = response.status();
        let mut fields = vec![(":status".to_string(), status.code().to_string())];
        for (name, value) in response.headers().iter() {
            let name = name.to_ascii_lowercase();
            if CONNECTION_SPECIFIC.contains(&name.as_str()) {
                continue;
            }
            fields.push((name, value.to_string()));
        }
        if !status.forbids_body() && !response.headers().contains("content-length") {
            fields.push(("content-length".to_string(), response.body().len().to_string()));
        }

        let body = if head_only || status.forbids_body() {
            Bytes::new()
        } else {
            Bytes::from(response.into_body())
        };
        let end_stream = body.is_empty();

        let block = self.encoder.encode(&fields);
        if end_stream {
            self.finish(stream_id);
        }
        self.write_header_block(stream_id, block, end_stream)?;

        if !end_stream {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.body = body;
                stream.offset = 0;
                self.ready.push_back(stream_id);
            }
        }
        Ok(())
    }

    /// HEADERS plus as many CONTINUATION frames as the peer's frame size needs
    fn write_header_block(&mut self, stream_id: StreamId, block: Bytes, end_stream: bool) -> Result<()> {
        let max = self.peer_settings.get_max_frame_size() as usize;
        if block.len() <= max {
            let frame = HeadersFrame::new(stream_id, block, end_stream, true);
            return self.write(FrameCodec::encode_headers_frame(&frame));
        }

        let mut rest = block;
        let first = rest.split_to(max);
        let frame = HeadersFrame::new(stream_id, first, end_stream, false);
        self.write(FrameCodec::encode_headers_frame(&frame))?;

        while !rest.is_empty() {
            let fragment = rest.split_to(max.min(rest.len()));
            let frame = ContinuationFrame {
                stream_id,
                header_block: fragment,
                end_headers: rest.is_empty(),
            };
            self.write(FrameCodec::encode_continuation_frame(&frame))?;
        }
        Ok(())
    }

    /// Whether some queued body could be sent right now
    fn can_send_data(&self) -> bool {
        self.conn_window.available() > 0
            && self.ready.iter().any(|id| {
                self.streams
                    .get(id)
                    .is_some_and(|stream| stream.window.available() > 0)
            })
    }

    /// One DATA frame for each stream that has credit
    fn send_round(&mut self) -> Result<()> {
        let max_frame = self.peer_settings.get_max_frame_size() as usize;

        for _ in 0..self.ready.len() {
            let Some(stream_id) = self.ready.pop_front() else {
                break;
            };
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };

            let wanted = stream.remaining().min(max_frame).min(stream.window.available());
            let granted = self.conn_window.consume(wanted);
            if granted == 0 {
                self.ready.push_back(stream_id);
                continue;
            }
            stream.window.consume(granted);

            let start = stream.offset;
            stream.offset += granted;
            let chunk = stream.body.slice(start..stream.offset);
            let end_stream = stream.remaining() == 0;

            if end_stream {
                self.finish(stream_id);
            } else {
                self.ready.push_back(stream_id);
            }
            self.write(FrameCodec::encode_data_frame(&DataFrame::new(
                stream_id, chunk, end_stream,
            )))?;
        }
        Ok(())
    }

    fn add_credit(&mut self, stream_id: StreamId, increment: u32) {
        let result = if stream_id == CONNECTION_STREAM_ID {
            self.conn_window.increase(increment).map(|_| ())
        } else {
            match self.streams.get_mut(&stream_id) {
                Some(stream) => stream.window.increase(increment).map(|_| ()).map_err(|e| {
                    Error::stream(stream_id, ErrorCode::FlowControlError, e.to_string())
                }),
                None => Ok(()),
            }
        };

        if let Err(err) = result {
            if err.is_stream_error() {
                self.drop_stream(stream_id);
            }
            let _ = self.events.send(WriterEvent::Violation(err));
        }
    }

    fn apply_settings(&mut self, settings: Settings) {
        if let Some(size) = settings.header_table_size {
            self.encoder.set_peer_table_size(size);
        }

        if let Some(initial) = settings.initial_window_size {
            for stream in self.streams.values_mut() {
                if let Err(err) = stream.window.update_initial_size(initial) {
                    let _ = self.events.send(WriterEvent::Violation(err));
                    break;
                }
            }
        }

        tracing::debug!(?settings, "peer settings applied");
        self.peer_settings.merge(&settings);
    }

    /// Tell the read loop the stream is done and forget it
    fn finish(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
        let _ = self.events.send(WriterEvent::Finished(stream_id));
    }

    fn drop_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
        self.ready.retain(|id| *id != stream_id);
    }

    fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.session.write_all(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::frames::{Frame, FrameType};
    use crate::http::h2::hpack::HeaderDecoder;
    use crate::http::session::{from_tcp_stream, TcpSession};
    use crate::http::Status;
    use bytes::BytesMut;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct Harness {
        commands: Sender<WriterCommand>,
        events: Receiver<WriterEvent>,
        peer: TcpStream,
        buf: BytesMut,
        handle: thread::JoinHandle<()>,
    }

    impl Harness {
        fn start() -> Self {
            Self::start_with(Vec::new())
        }

        /// Queue `initial` before the writer thread starts
        fn start_with(initial: Vec<WriterCommand>) -> Self {
            Self::spawn(initial, false)
        }

        /// Like `start_with`, with the writer cancelled before it runs
        fn start_cancelled(initial: Vec<WriterCommand>) -> Self {
            Self::spawn(initial, true)
        }

        fn spawn(initial: Vec<WriterCommand>, cancelled: bool) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let peer = TcpStream::connect(addr).unwrap();
            peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let (server, _) = listener.accept().unwrap();

            let session: HttpSession<TcpSession> = from_tcp_stream(server);
            let (commands, command_rx) = mpsc::channel();
            let (event_tx, events) = mpsc::channel();
            for command in initial {
                commands.send(command).unwrap();
            }
            let writer = FrameWriter::new(session, HeaderEncoder::new(), command_rx, event_tx);
            if cancelled {
                writer.cancel_handle().cancel();
            }
            let handle = thread::spawn(move || writer.run());

            Harness {
                commands,
                events,
                peer,
                buf: BytesMut::new(),
                handle,
            }
        }

        fn frame(&mut self) -> Frame {
            loop {
                if let Some(frame) = FrameCodec::decode(&mut self.buf, 1 << 24).unwrap() {
                    return frame;
                }
                let mut chunk = [0u8; 4096];
                let n = self.peer.read(&mut chunk).unwrap();
                assert!(n > 0, "writer closed the connection");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        fn stop(self) {
            self.commands.send(WriterCommand::Shutdown).unwrap();
            self.handle.join().unwrap();
        }
    }

    fn response(body: &[u8]) -> HttpResponse {
        HttpResponse::builder()
            .status(Status::OK)
            .header("Content-Type", "text/plain")
            .header("Connection", "keep-alive")
            .body(body.to_vec())
            .build()
    }

    #[test]
    fn test_response_headers_and_data() {
        let mut h = Harness::start();
        h.commands.send(WriterCommand::OpenStream(1)).unwrap();
        h.commands
            .send(WriterCommand::Response {
                stream_id: 1,
                response: response(b"hello"),
                head_only: false,
            })
            .unwrap();

        let headers = h.frame();
        assert_eq!(headers.frame_type, FrameType::Headers);
        assert!(!headers.flags.is_end_stream());
        let fields = HeaderDecoder::new(4096).decode(1, &headers.payload).unwrap();
        assert_eq!(fields[0], (":status".to_string(), "200".to_string()));
        assert!(fields.iter().all(|(name, _)| name != "connection"));
        assert!(fields.contains(&("content-length".to_string(), "5".to_string())));

        let data = h.frame();
        assert_eq!(data.frame_type, FrameType::Data);
        assert!(data.flags.is_end_stream());
        assert_eq!(&data.payload[..], b"hello");

        assert!(matches!(h.events.recv().unwrap(), WriterEvent::Finished(1)));
        h.stop();
    }

    #[test]
    fn test_head_response_has_no_data() {
        let mut h = Harness::start();
        h.commands.send(WriterCommand::OpenStream(1)).unwrap();
        h.commands
            .send(WriterCommand::Response {
                stream_id: 1,
                response: response(b"hello"),
                head_only: true,
            })
            .unwrap();

        let headers = h.frame();
        assert!(headers.flags.is_end_stream());
        let fields = HeaderDecoder::new(4096).decode(1, &headers.payload).unwrap();
        assert!(fields.contains(&("content-length".to_string(), "5".to_string())));
        h.stop();
    }

    #[test]
    fn test_body_split_by_frame_size_and_window() {
        let mut h = Harness::start();
        let peer = Settings {
            initial_window_size: Some(20_000),
            ..Settings::default()
        };
        h.commands
            .send(WriterCommand::PeerSettings {
                settings: peer,
                ack: true,
            })
            .unwrap();
        assert!(h.frame().flags.is_ack());

        h.commands.send(WriterCommand::OpenStream(1)).unwrap();
        h.commands
            .send(WriterCommand::Response {
                stream_id: 1,
                response: response(&vec![b'x'; 30_000]),
                head_only: false,
            })
            .unwrap();

        h.frame();
        assert_eq!(h.frame().payload_len(), 16384);
        assert_eq!(h.frame().payload_len(), 20_000 - 16384);

        // Starved until the peer grants more
        h.commands
            .send(WriterCommand::SendCredit {
                stream_id: 1,
                increment: 10_000,
            })
            .unwrap();
        let last = h.frame();
        assert_eq!(last.payload_len(), 10_000);
        assert!(last.flags.is_end_stream());
        h.stop();
    }

    #[test]
    fn test_streams_interleave() {
        let mut initial = vec![WriterCommand::OpenStream(1), WriterCommand::OpenStream(3)];
        for id in [1, 3] {
            initial.push(WriterCommand::Response {
                stream_id: id,
                response: response(&vec![b'a'; 40_000]),
                head_only: false,
            });
        }
        let mut h = Harness::start_with(initial);

        let mut data_order = Vec::new();
        while data_order.len() < 4 {
            let frame = h.frame();
            if frame.frame_type == FrameType::Data {
                data_order.push(frame.stream_id);
            }
        }
        assert_eq!(data_order, vec![1, 3, 1, 3]);
        h.stop();
    }

    #[test]
    fn test_continuation_for_large_header_block() {
        let mut h = Harness::start();
        h.commands.send(WriterCommand::OpenStream(1)).unwrap();
        let mut big = HttpResponse::new(Status::OK);
        for i in 0..40 {
            big.headers_mut().insert(format!("x-filler-{}", i), "v".repeat(1000));
        }
        h.commands
            .send(WriterCommand::Response {
                stream_id: 1,
                response: big,
                head_only: false,
            })
            .unwrap();

        let headers = h.frame();
        assert_eq!(headers.frame_type, FrameType::Headers);
        assert!(!headers.flags.is_end_headers());
        let mut block = BytesMut::from(&headers.payload[..]);
        loop {
            let frame = h.frame();
            assert_eq!(frame.frame_type, FrameType::Continuation);
            block.extend_from_slice(&frame.payload);
            if frame.flags.is_end_headers() {
                break;
            }
        }
        let fields = HeaderDecoder::new(4096).decode(1, &block).unwrap();
        assert_eq!(fields.len(), 42);
        h.stop();
    }

    #[test]
    fn test_reset_drops_queued_body() {
        let mut h = Harness::start();
        let peer = Settings {
            initial_window_size: Some(100),
            ..Settings::default()
        };
        h.commands
            .send(WriterCommand::PeerSettings {
                settings: peer,
                ack: false,
            })
            .unwrap();
        h.commands.send(WriterCommand::OpenStream(1)).unwrap();
        h.commands
            .send(WriterCommand::Response {
                stream_id: 1,
                response: response(&[0u8; 1000]),
                head_only: false,
            })
            .unwrap();
        h.frame();
        assert_eq!(h.frame().payload_len(), 100);

        h.commands
            .send(WriterCommand::Reset {
                stream_id: 1,
                code: ErrorCode::Cancel,
            })
            .unwrap();
        let rst = h.frame();
        assert_eq!(rst.frame_type, FrameType::RstStream);

        h.commands
            .send(WriterCommand::SendCredit {
                stream_id: 1,
                increment: 1000,
            })
            .unwrap();
        h.commands
            .send(WriterCommand::GoAway {
                last_stream_id: 1,
                code: ErrorCode::NoError,
                debug: String::new(),
            })
            .unwrap();
        assert_eq!(h.frame().frame_type, FrameType::Goaway);
        h.handle.join().unwrap();
    }

    #[test]
    fn test_cancelled_writer_drops_queued_responses() {
        let h = Harness::start_cancelled(vec![
            WriterCommand::OpenStream(1),
            WriterCommand::Response {
                stream_id: 1,
                response: response(b"too late"),
                head_only: false,
            },
            WriterCommand::Shutdown,
        ]);
        let Harness {
            mut peer,
            events,
            handle,
            ..
        } = h;
        handle.join().unwrap();

        // Nothing was written before the socket closed
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_window_overflow_reported() {
        let h = Harness::start();
        h.commands
            .send(WriterCommand::SendCredit {
                stream_id: 0,
                increment: 0x7FFF_FFFF,
            })
            .unwrap();
        match h.events.recv().unwrap() {
            WriterEvent::Violation(err) => assert_eq!(err.code(), ErrorCode::FlowControlError),
            other => panic!("unexpected event {:?}", other),
        }
        h.stop();
    }
}

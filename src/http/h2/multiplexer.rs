//! Stream multiplexer
//!
//! Owns everything the read loop knows about a framed connection: the
//! stream table, receive windows, the HPACK decoder and the header block
//! being reassembled from CONTINUATION frames. [`StreamMultiplexer::dispatch`]
//! takes one decoded frame and returns the [`Effect`]s the connection has to
//! carry out. Connection errors come back as `Err`; stream errors are turned
//! into [`Effect::Reset`] here and never escalate.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use super::frames::{Frame, FrameType};
use super::hpack::HeaderDecoder;
use super::settings::Settings;
use super::stream::{H2Stream, StreamEvent, StreamId};
use super::{CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::http::parser::DEFAULT_MAX_BODY_SIZE;
use crate::http::{Headers, HttpRequest, Method, Version};
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// How many reset stream ids to remember for ignoring late frames
const RESET_HISTORY: usize = 32;

/// Work produced by a frame, carried out by the connection
#[derive(Debug)]
pub enum Effect {
    /// HEADERS opened a stream
    Opened(StreamId),
    /// A complete request, ready for the handler
    Request(HttpRequest),
    /// Send RST_STREAM
    Reset { stream_id: StreamId, code: ErrorCode },
    /// The peer reset a stream; its pending response is dropped
    Cancelled(StreamId),
    /// Send WINDOW_UPDATE to give the peer more credit
    WindowUpdate { stream_id: StreamId, increment: u32 },
    /// The peer gave us send credit
    SendCredit { stream_id: StreamId, increment: u32 },
    /// The peer's SETTINGS, to be applied and acknowledged
    PeerSettings(Settings),
    /// Our SETTINGS were acknowledged
    SettingsAcked,
    /// Answer a PING
    PingAck([u8; 8]),
    /// The peer sent GOAWAY
    GoAway { last_stream_id: StreamId, code: ErrorCode },
}

/// Why a stream left the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Response fully handed to the writer
    Completed,
    /// We sent RST_STREAM
    Reset,
    /// The peer sent RST_STREAM
    Cancelled,
    /// Open longer than the stream timeout
    TimedOut,
}

/// A header block still waiting for CONTINUATION frames
struct PendingBlock {
    stream_id: StreamId,
    end_stream: bool,
    block: BytesMut,
    /// Stream error found before the block was complete
    error: Option<Error>,
}

/// Request-side state of one HTTP/2 connection
pub struct StreamMultiplexer {
    streams: HashMap<StreamId, H2Stream>,
    /// Highest stream id the peer has opened
    last_stream_id: StreamId,
    local_settings: Settings,
    settings_acked: bool,
    /// The first frame from the client must be SETTINGS
    awaiting_settings: bool,
    recv_window: FlowControlWindow,
    decoder: HeaderDecoder,
    pending: Option<PendingBlock>,
    recently_reset: VecDeque<StreamId>,
    max_header_block: usize,
    /// Largest request body buffered for one stream
    max_body_size: usize,
    secure: bool,
}

impl StreamMultiplexer {
    /// Create the state for a connection that advertised `local_settings`
    pub fn new(local_settings: Settings, max_header_block: usize, secure: bool) -> Self {
        let decoder = HeaderDecoder::new(local_settings.get_header_table_size());
        StreamMultiplexer {
            streams: HashMap::new(),
            last_stream_id: 0,
            local_settings,
            settings_acked: false,
            awaiting_settings: true,
            // The connection window is not affected by SETTINGS
            recv_window: FlowControlWindow::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE),
            decoder,
            pending: None,
            recently_reset: VecDeque::new(),
            max_header_block,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            secure,
        }
    }

    /// Cap the request body buffered per stream
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_idle(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream(&self, id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&id)
    }

    /// Open a client-initiated stream
    ///
    /// Even or non-increasing ids are connection errors. When the
    /// concurrency limit is reached the stream is refused while our SETTINGS
    /// are unacknowledged, and is a connection error afterwards.
    pub fn open_stream(&mut self, id: StreamId) -> Result<&mut H2Stream> {
        if id % 2 == 0 {
            return Err(Error::Protocol(format!("client opened even stream {}", id)));
        }
        if id <= self.last_stream_id {
            return Err(Error::Protocol(format!(
                "stream {} not above last stream {}",
                id, self.last_stream_id
            )));
        }
        self.last_stream_id = id;

        if let Some(max) = self.local_settings.get_max_concurrent_streams() {
            if self.streams.len() >= max as usize {
                if self.settings_acked {
                    return Err(Error::Protocol(format!(
                        "stream {} exceeds {} concurrent streams",
                        id, max
                    )));
                }
                return Err(Error::stream(
                    id,
                    ErrorCode::RefusedStream,
                    format!("{} concurrent streams already open", max),
                ));
            }
        }

        let window = self.local_settings.get_initial_window_size();
        Ok(self.streams.entry(id).or_insert_with(|| H2Stream::new(id, window)))
    }

    /// Register stream 1 for a request that arrived in an h2c upgrade
    ///
    /// The request was complete on the HTTP/1.1 side, so the stream starts
    /// half-closed (remote).
    pub fn open_upgraded_stream(&mut self, mut request: HttpRequest) -> Result<HttpRequest> {
        let stream = self.open_stream(1)?;
        stream.apply(StreamEvent::RecvHeaders)?;
        stream.apply(StreamEvent::RecvEndStream)?;

        request.set_stream_id(1);
        request.set_version(Version::Http2);
        Ok(request)
    }

    /// Remove a stream from the table
    pub fn close_stream(&mut self, id: StreamId, reason: CloseReason) {
        let Some(mut stream) = self.streams.remove(&id) else {
            return;
        };
        match reason {
            CloseReason::Completed => {
                let _ = stream.apply(StreamEvent::SendEndStream);
            }
            CloseReason::Reset | CloseReason::Cancelled | CloseReason::TimedOut => {
                let _ = stream.apply(StreamEvent::Reset);
                self.remember_reset(id);
            }
        }
        tracing::debug!(stream_id = id, ?reason, active = self.streams.len(), "stream closed");
    }

    /// Streams that have been open longer than `timeout`
    pub fn expired_streams(&self, now: Instant, timeout: Duration) -> Vec<StreamId> {
        let mut expired: Vec<StreamId> = self
            .streams
            .values()
            .filter(|stream| stream.is_expired(now, timeout))
            .map(|stream| stream.id())
            .collect();
        expired.sort_unstable();
        expired
    }

    /// Process one frame from the peer
    pub fn dispatch(&mut self, frame: Frame) -> Result<Vec<Effect>> {
        tracing::trace!(
            frame_type = %frame.frame_type,
            stream_id = frame.stream_id,
            flags = frame.flags.as_u8(),
            len = frame.payload_len(),
            "frame received"
        );

        if self.awaiting_settings {
            if frame.frame_type != FrameType::Settings || frame.flags.is_ack() {
                return Err(Error::Protocol(format!(
                    "expected SETTINGS as first frame, got {}",
                    frame.frame_type
                )));
            }
            self.awaiting_settings = false;
        }

        if let Some(pending) = &self.pending {
            if frame.frame_type != FrameType::Continuation || frame.stream_id != pending.stream_id {
                return Err(Error::Protocol(format!(
                    "{} on stream {} while header block for stream {} is open",
                    frame.frame_type, frame.stream_id, pending.stream_id
                )));
            }
        }

        let mut effects = Vec::new();
        let result = match frame.frame_type {
            FrameType::Data => self.on_data(&frame, &mut effects),
            FrameType::Headers => self.on_headers(&frame, &mut effects),
            FrameType::Continuation => self.on_continuation(&frame, &mut effects),
            FrameType::Priority => self.on_priority(&frame),
            FrameType::RstStream => self.on_rst_stream(&frame, &mut effects),
            FrameType::Settings => self.on_settings(&frame, &mut effects),
            FrameType::PushPromise => {
                Err(Error::Protocol("PUSH_PROMISE sent by client".to_string()))
            }
            FrameType::Ping => self.on_ping(&frame, &mut effects),
            FrameType::Goaway => self.on_goaway(&frame, &mut effects),
            FrameType::WindowUpdate => self.on_window_update(&frame, &mut effects),
            FrameType::Unknown(kind) => {
                tracing::debug!(kind, "ignoring unknown frame type");
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(effects),
            Err(Error::Stream {
                stream_id,
                code,
                reason,
            }) => {
                tracing::info!(stream_id, %code, %reason, "resetting stream");
                self.close_stream(stream_id, CloseReason::Reset);
                self.remember_reset(stream_id);
                effects.push(Effect::Reset { stream_id, code });
                Ok(effects)
            }
            Err(err) => Err(err),
        }
    }

    fn on_data(&mut self, frame: &Frame, effects: &mut Vec<Effect>) -> Result<()> {
        let data = FrameCodec::parse_data(frame)?;
        let len = data.flow_controlled_len();

        // Connection-level accounting happens even for streams we dropped
        self.recv_window.receive(len)?;
        if let Some(increment) = self.recv_window.should_send_window_update() {
            self.recv_window.release(increment);
            effects.push(Effect::WindowUpdate {
                stream_id: CONNECTION_STREAM_ID,
                increment,
            });
        }

        let id = data.stream_id;
        let Some(stream) = self.streams.get_mut(&id) else {
            if self.recently_reset.contains(&id) {
                return Ok(());
            }
            let code = if id > self.last_stream_id {
                ErrorCode::ProtocolError
            } else {
                ErrorCode::StreamClosed
            };
            return Err(Error::stream(id, code, "DATA on a stream that is not open"));
        };

        stream.apply(StreamEvent::RecvData)?;
        stream
            .recv_window_mut()
            .receive(len)
            .map_err(|e| Error::stream(id, ErrorCode::FlowControlError, e.to_string()))?;
        if stream.body().len() + data.data.len() > self.max_body_size {
            return Err(Error::stream(id, ErrorCode::Cancel, "request body too large"));
        }
        stream.append_body(&data.data);

        if data.end_stream {
            stream.apply(StreamEvent::RecvEndStream)?;
            let request = self.complete_request(id)?;
            effects.push(Effect::Request(request));
        } else if let Some(increment) = stream.recv_window().should_send_window_update() {
            stream.recv_window_mut().release(increment);
            effects.push(Effect::WindowUpdate {
                stream_id: id,
                increment,
            });
        }
        Ok(())
    }

    fn on_headers(&mut self, frame: &Frame, effects: &mut Vec<Effect>) -> Result<()> {
        let headers = FrameCodec::parse_headers(frame)?;

        let error = match headers.priority {
            Some(priority) if priority.stream_dependency == headers.stream_id => Some(Error::stream(
                headers.stream_id,
                ErrorCode::ProtocolError,
                "stream depends on itself",
            )),
            _ => None,
        };

        let pending = PendingBlock {
            stream_id: headers.stream_id,
            end_stream: headers.end_stream,
            block: BytesMut::from(&headers.header_block[..]),
            error,
        };

        if headers.end_headers {
            self.complete_block(pending, effects)
        } else {
            self.check_block_size(&pending)?;
            self.pending = Some(pending);
            Ok(())
        }
    }

    fn on_continuation(&mut self, frame: &Frame, effects: &mut Vec<Effect>) -> Result<()> {
        let continuation = FrameCodec::parse_continuation(frame)?;
        let Some(mut pending) = self.pending.take() else {
            return Err(Error::Protocol(format!(
                "CONTINUATION on stream {} without HEADERS",
                continuation.stream_id
            )));
        };

        pending.block.extend_from_slice(&continuation.header_block);
        self.check_block_size(&pending)?;

        if continuation.end_headers {
            self.complete_block(pending, effects)
        } else {
            self.pending = Some(pending);
            Ok(())
        }
    }

    fn check_block_size(&self, pending: &PendingBlock) -> Result<()> {
        if pending.block.len() > self.max_header_block {
            return Err(Error::Protocol(format!(
                "header block on stream {} exceeds {} bytes",
                pending.stream_id, self.max_header_block
            )));
        }
        Ok(())
    }

    /// Decode a finished header block and act on it
    ///
    /// The block is always decoded first, whatever happens to the stream, so
    /// the HPACK state matches the peer's.
    fn complete_block(&mut self, pending: PendingBlock, effects: &mut Vec<Effect>) -> Result<()> {
        let id = pending.stream_id;
        let decoded = self
            .decoder
            .decode(id, &pending.block)
            .and_then(|fields| self.check_list_size(id, fields));
        if let Err(err) = &decoded {
            if !err.is_stream_error() {
                return decoded.map(|_| ());
            }
        }

        if self.streams.contains_key(&id) {
            return self.on_trailers(id, pending.end_stream, decoded, effects);
        }
        if self.recently_reset.contains(&id) {
            return Ok(());
        }

        self.open_stream(id)?;
        if let Some(err) = pending.error {
            return Err(err);
        }
        let fields = decoded?;

        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| Error::Internal(format!("stream {} missing after open", id)))?;
        stream.apply(StreamEvent::RecvHeaders)?;
        stream.set_headers(fields);
        tracing::debug!(stream_id = id, end_stream = pending.end_stream, "stream opened");
        effects.push(Effect::Opened(id));

        if pending.end_stream {
            stream.apply(StreamEvent::RecvEndStream)?;
            let request = self.complete_request(id)?;
            effects.push(Effect::Request(request));
        }
        Ok(())
    }

    /// Enforce the SETTINGS_MAX_HEADER_LIST_SIZE we advertised
    fn check_list_size(
        &self,
        id: StreamId,
        fields: Vec<(String, String)>,
    ) -> Result<Vec<(String, String)>> {
        let Some(limit) = self.local_settings.get_max_header_list_size() else {
            return Ok(fields);
        };
        // Each field counts its name and value plus 32 octets of overhead
        let size: usize = fields.iter().map(|(name, value)| name.len() + value.len() + 32).sum();
        if size > limit as usize {
            return Err(Error::stream(
                id,
                ErrorCode::ProtocolError,
                format!("header list of {} octets exceeds {}", size, limit),
            ));
        }
        Ok(fields)
    }

    /// A second HEADERS on an open stream carries trailers
    fn on_trailers(
        &mut self,
        id: StreamId,
        end_stream: bool,
        decoded: Result<Vec<(String, String)>>,
        effects: &mut Vec<Effect>,
    ) -> Result<()> {
        let fields = decoded?;
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };

        stream.apply(StreamEvent::RecvHeaders)?;
        if !end_stream {
            return Err(Error::stream(
                id,
                ErrorCode::ProtocolError,
                "trailers without END_STREAM",
            ));
        }
        if fields.iter().any(|(name, _)| name.starts_with(':')) {
            return Err(Error::stream(
                id,
                ErrorCode::ProtocolError,
                "pseudo-header in trailers",
            ));
        }

        stream.apply(StreamEvent::RecvEndStream)?;
        let request = self.complete_request(id)?;
        effects.push(Effect::Request(request));
        Ok(())
    }

    /// Turn a stream whose client side is finished into a request
    fn complete_request(&mut self, id: StreamId) -> Result<HttpRequest> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| Error::Internal(format!("stream {} missing at end of request", id)))?;

        let mut request = build_request(id, stream.take_headers(), self.secure)?;
        let body = stream.take_body();

        if let Some(length) = request.headers().get("content-length") {
            if length.trim().parse::<usize>().ok() != Some(body.len()) {
                return Err(Error::stream(
                    id,
                    ErrorCode::ProtocolError,
                    format!("content-length {} but {} body bytes", length, body.len()),
                ));
            }
        }

        request.set_body(body);
        Ok(request)
    }

    fn on_priority(&mut self, frame: &Frame) -> Result<()> {
        let priority = FrameCodec::parse_priority(frame)?;
        if priority.priority.stream_dependency == priority.stream_id {
            return Err(Error::stream(
                priority.stream_id,
                ErrorCode::ProtocolError,
                "stream depends on itself",
            ));
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, frame: &Frame, effects: &mut Vec<Effect>) -> Result<()> {
        let rst = FrameCodec::parse_rst_stream(frame)?;
        if rst.stream_id > self.last_stream_id {
            return Err(Error::Protocol(format!(
                "RST_STREAM on idle stream {}",
                rst.stream_id
            )));
        }

        if self.streams.contains_key(&rst.stream_id) {
            tracing::debug!(stream_id = rst.stream_id, code = %rst.error_code, "stream reset by peer");
            self.close_stream(rst.stream_id, CloseReason::Cancelled);
            effects.push(Effect::Cancelled(rst.stream_id));
        }
        Ok(())
    }

    fn on_settings(&mut self, frame: &Frame, effects: &mut Vec<Effect>) -> Result<()> {
        let settings = FrameCodec::parse_settings(frame)?;
        if settings.ack {
            if !self.settings_acked {
                tracing::debug!("local SETTINGS acknowledged");
            }
            self.settings_acked = true;
            effects.push(Effect::SettingsAcked);
        } else {
            effects.push(Effect::PeerSettings(settings.settings));
        }
        Ok(())
    }

    fn on_ping(&mut self, frame: &Frame, effects: &mut Vec<Effect>) -> Result<()> {
        let ping = FrameCodec::parse_ping(frame)?;
        if !ping.ack {
            effects.push(Effect::PingAck(ping.data));
        }
        Ok(())
    }

    fn on_goaway(&mut self, frame: &Frame, effects: &mut Vec<Effect>) -> Result<()> {
        let goaway = FrameCodec::parse_goaway(frame)?;
        tracing::info!(
            last_stream_id = goaway.last_stream_id,
            code = %goaway.error_code,
            debug = %String::from_utf8_lossy(&goaway.debug_data),
            "GOAWAY received"
        );
        effects.push(Effect::GoAway {
            last_stream_id: goaway.last_stream_id,
            code: goaway.error_code,
        });
        Ok(())
    }

    fn on_window_update(&mut self, frame: &Frame, effects: &mut Vec<Effect>) -> Result<()> {
        let update = FrameCodec::parse_window_update(frame)?;
        let id = update.stream_id;

        if id == CONNECTION_STREAM_ID {
            if update.size_increment == 0 {
                return Err(Error::Protocol(
                    "connection WINDOW_UPDATE with zero increment".to_string(),
                ));
            }
        } else {
            if id > self.last_stream_id {
                return Err(Error::Protocol(format!("WINDOW_UPDATE on idle stream {}", id)));
            }
            if update.size_increment == 0 {
                return Err(Error::stream(
                    id,
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE with zero increment",
                ));
            }
        }

        effects.push(Effect::SendCredit {
            stream_id: id,
            increment: update.size_increment,
        });
        Ok(())
    }

    fn remember_reset(&mut self, id: StreamId) {
        if self.recently_reset.contains(&id) {
            return;
        }
        if self.recently_reset.len() == RESET_HISTORY {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(id);
    }
}

/// Names that only make sense on an HTTP/1.1 connection (RFC 7540 Section 8.1.2.2)
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Build a request from a decoded header list
fn build_request(id: StreamId, fields: Vec<(String, String)>, secure: bool) -> Result<HttpRequest> {
    let malformed = |reason: String| Error::stream(id, ErrorCode::ProtocolError, reason);

    let mut method = None;
    let mut scheme = None;
    let mut path = None;
    let mut authority = None;
    let mut headers = Headers::new();
    let mut regular_seen = false;

    for (name, value) in fields {
        if let Some(pseudo) = name.strip_prefix(':') {
            if regular_seen {
                return Err(malformed(format!("pseudo-header {} after regular header", name)));
            }
            let slot = match pseudo {
                "method" => &mut method,
                "scheme" => &mut scheme,
                "path" => &mut path,
                "authority" => &mut authority,
                _ => return Err(malformed(format!("unknown pseudo-header {}", name))),
            };
            if slot.replace(value).is_some() {
                return Err(malformed(format!("duplicate pseudo-header {}", name)));
            }
            continue;
        }

        regular_seen = true;
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            return Err(malformed(format!("connection-specific header {}", name)));
        }
        if name == "te" && value != "trailers" {
            return Err(malformed(format!("te header value {:?}", value)));
        }
        if headers.is_full() {
            return Err(malformed("too many header fields".to_string()));
        }
        headers.insert(name, value);
    }

    let method = method.ok_or_else(|| malformed("missing :method".to_string()))?;
    let method: Method = method
        .parse()
        .map_err(|_| malformed(format!("unsupported method {:?}", method)))?;
    if scheme.is_none() {
        return Err(malformed("missing :scheme".to_string()));
    }
    let path = match path {
        Some(path) if !path.is_empty() => path,
        _ => return Err(malformed("missing :path".to_string())),
    };

    if let Some(authority) = authority {
        if !headers.contains("host") {
            headers.insert("host", authority);
        }
    }

    let mut request = HttpRequest::builder()
        .method(method)
        .uri(path)
        .version(Version::Http2)
        .headers(headers)
        .secure(secure)
        .build();
    request.set_stream_id(id);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::frames::{
        DataFrame, FrameFlags, HeadersFrame, PrioritySpec, RstStreamFrame, SettingsFrame,
        WindowUpdateFrame,
    };
    use crate::http::h2::hpack::HeaderEncoder;
    use crate::http::h2::settings::SettingsBuilder;
    use bytes::{Bytes, BytesMut};

    fn raw(bytes: Bytes) -> Frame {
        let mut buf = BytesMut::from(&bytes[..]);
        FrameCodec::decode(&mut buf, 1 << 20).unwrap().unwrap()
    }

    fn request_block(encoder: &mut HeaderEncoder, path: &str) -> Bytes {
        encoder.encode(&[
            (":method".to_string(), "GET".to_string()),
            (":scheme".to_string(), "http".to_string()),
            (":path".to_string(), path.to_string()),
            (":authority".to_string(), "localhost".to_string()),
        ])
    }

    fn headers(stream_id: u32, block: Bytes, end_stream: bool) -> Frame {
        raw(FrameCodec::encode_headers_frame(&HeadersFrame::new(
            stream_id, block, end_stream, true,
        )))
    }

    fn started(max_streams: u32) -> StreamMultiplexer {
        let local = SettingsBuilder::new()
            .max_concurrent_streams(max_streams)
            .build()
            .unwrap();
        let mut mux = StreamMultiplexer::new(local, 64 * 1024, false);
        let settings = raw(FrameCodec::encode_settings_frame(&SettingsFrame::new(
            Settings::new(),
        )));
        let effects = mux.dispatch(settings).unwrap();
        assert!(matches!(effects[..], [Effect::PeerSettings(_)]));
        mux
    }

    fn ack(mux: &mut StreamMultiplexer) {
        let frame = raw(FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
        mux.dispatch(frame).unwrap();
    }

    #[test]
    fn test_first_frame_must_be_settings() {
        let mut mux = StreamMultiplexer::new(Settings::new(), 1024, false);
        let ping = Frame::new(FrameType::Ping, FrameFlags::empty(), 0, Bytes::from_static(&[0; 8]));
        let err = mux.dispatch(ping).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_get_request() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        let frame = headers(1, request_block(&mut encoder, "/foo"), true);

        let effects = mux.dispatch(frame).unwrap();
        let [Effect::Opened(1), Effect::Request(request)] = &effects[..] else {
            panic!("expected request, got {:?}", effects);
        };
        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/foo");
        assert_eq!(request.stream_id(), Some(1));
        assert_eq!(request.headers().get("host"), Some("localhost"));
        assert_eq!(mux.active_streams(), 1);

        mux.close_stream(1, CloseReason::Completed);
        assert!(mux.is_idle());
    }

    #[test]
    fn test_request_with_body() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        let effects = mux
            .dispatch(headers(1, request_block(&mut encoder, "/upload"), false))
            .unwrap();
        assert!(matches!(effects[..], [Effect::Opened(1)]));

        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from_static(b"hello"),
            false,
        )));
        assert!(mux.dispatch(data).unwrap().is_empty());

        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from_static(b" world"),
            true,
        )));
        let effects = mux.dispatch(data).unwrap();
        match &effects[..] {
            [Effect::Request(request)] => assert_eq!(request.body(), b"hello world"),
            other => panic!("unexpected effects {:?}", other),
        }
    }

    fn post(mux: &mut StreamMultiplexer, stream_id: u32) {
        let mut encoder = HeaderEncoder::new();
        let block = encoder.encode(&[
            (":method".to_string(), "POST".to_string()),
            (":scheme".to_string(), "http".to_string()),
            (":path".to_string(), "/upload".to_string()),
            (":authority".to_string(), "localhost".to_string()),
        ]);
        mux.dispatch(headers(stream_id, block, false)).unwrap();
    }

    #[test]
    fn test_body_over_limit_resets_stream() {
        let mut mux = started(100).with_max_body_size(8);
        post(&mut mux, 1);

        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from_static(b"12345"),
            false,
        )));
        assert!(mux.dispatch(data).unwrap().is_empty());

        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from_static(b"6789"),
            true,
        )));
        let effects = mux.dispatch(data).unwrap();
        assert!(matches!(
            effects[..],
            [Effect::Reset {
                stream_id: 1,
                code: ErrorCode::Cancel
            }]
        ));
        assert!(mux.stream(1).is_none());

        // Late frames for the reset stream are ignored
        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from_static(b"0"),
            true,
        )));
        assert!(mux.dispatch(data).unwrap().is_empty());
    }

    #[test]
    fn test_default_body_limit_applies() {
        let mut mux = started(100);
        post(&mut mux, 1);

        let chunk = Bytes::from(vec![0u8; 16384]);
        let frames = DEFAULT_MAX_BODY_SIZE / chunk.len() + 64;
        let mut reset = false;
        for _ in 0..frames {
            let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
                1,
                chunk.clone(),
                false,
            )));
            let effects = mux.dispatch(data).unwrap();
            if effects
                .iter()
                .any(|e| matches!(e, Effect::Reset { stream_id: 1, code: ErrorCode::Cancel }))
            {
                reset = true;
                break;
            }
        }
        assert!(reset);
        assert!(mux.stream(1).is_none());
    }

    #[test]
    fn test_header_list_over_advertised_size() {
        let local = SettingsBuilder::new()
            .max_header_list_size(200)
            .build()
            .unwrap();
        let mut mux = StreamMultiplexer::new(local, 64 * 1024, false);
        mux.dispatch(raw(FrameCodec::encode_settings_frame(&SettingsFrame::new(
            Settings::new(),
        ))))
        .unwrap();
        let mut encoder = HeaderEncoder::new();

        // Four fields of 32 octets overhead each fit
        let effects = mux
            .dispatch(headers(1, request_block(&mut encoder, "/"), true))
            .unwrap();
        assert!(matches!(effects[..], [Effect::Opened(1), Effect::Request(_)]));

        let long_path = format!("/{}", "a".repeat(100));
        let effects = mux
            .dispatch(headers(3, request_block(&mut encoder, &long_path), true))
            .unwrap();
        assert!(matches!(
            effects[..],
            [Effect::Reset {
                stream_id: 3,
                code: ErrorCode::ProtocolError
            }]
        ));

        // The decoder stayed in step: the next request decodes fine
        let effects = mux
            .dispatch(headers(5, request_block(&mut encoder, "/next"), true))
            .unwrap();
        match &effects[..] {
            [Effect::Opened(5), Effect::Request(request)] => assert_eq!(request.path(), "/next"),
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn test_stream_id_reuse_is_connection_error() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(3, request_block(&mut encoder, "/"), true))
            .unwrap();

        let err = mux
            .dispatch(headers(1, request_block(&mut encoder, "/"), true))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_concurrency_limit_before_and_after_ack() {
        let mut mux = started(1);
        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(1, request_block(&mut encoder, "/a"), true))
            .unwrap();

        let effects = mux
            .dispatch(headers(3, request_block(&mut encoder, "/b"), true))
            .unwrap();
        assert!(matches!(
            effects[..],
            [Effect::Reset {
                stream_id: 3,
                code: ErrorCode::RefusedStream
            }]
        ));
        assert_eq!(mux.active_streams(), 1);

        ack(&mut mux);
        let err = mux
            .dispatch(headers(5, request_block(&mut encoder, "/c"), true))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_data_after_end_stream_resets() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(1, request_block(&mut encoder, "/"), true))
            .unwrap();

        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from_static(b"late"),
            false,
        )));
        let effects = mux.dispatch(data).unwrap();
        assert!(matches!(
            effects[..],
            [Effect::Reset {
                stream_id: 1,
                code: ErrorCode::StreamClosed
            }]
        ));
        assert!(mux.is_idle());
    }

    #[test]
    fn test_stream_flow_control_violation() {
        let local = SettingsBuilder::new()
            .initial_window_size(10)
            .build()
            .unwrap();
        let mut mux = StreamMultiplexer::new(local, 1024, false);
        mux.dispatch(raw(FrameCodec::encode_settings_frame(&SettingsFrame::new(
            Settings::new(),
        ))))
        .unwrap();

        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(1, request_block(&mut encoder, "/"), false))
            .unwrap();
        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from_static(b"more than ten bytes"),
            false,
        )));
        let effects = mux.dispatch(data).unwrap();
        assert!(matches!(
            effects[..],
            [Effect::Reset {
                stream_id: 1,
                code: ErrorCode::FlowControlError
            }]
        ));
    }

    #[test]
    fn test_connection_flow_control_violation() {
        let local = SettingsBuilder::new()
            .initial_window_size(1 << 20)
            .build()
            .unwrap();
        let mut mux = StreamMultiplexer::new(local, 1024, false);
        mux.dispatch(raw(FrameCodec::encode_settings_frame(&SettingsFrame::new(
            Settings::new(),
        ))))
        .unwrap();

        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(1, request_block(&mut encoder, "/"), false))
            .unwrap();
        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from(vec![0u8; 70_000]),
            false,
        )));
        let err = mux.dispatch(data).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FlowControlError);
        assert!(!err.is_stream_error());
    }

    #[test]
    fn test_window_update_replenishes_receive_window() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(1, request_block(&mut encoder, "/"), false))
            .unwrap();

        let data = raw(FrameCodec::encode_data_frame(&DataFrame::new(
            1,
            Bytes::from(vec![0u8; 16384]),
            false,
        )));
        // Two full frames leave exactly half the window, which is not yet low
        assert!(mux.dispatch(data.clone()).unwrap().is_empty());
        assert!(mux.dispatch(data.clone()).unwrap().is_empty());
        let effects = mux.dispatch(data).unwrap();
        let updated: Vec<u32> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::WindowUpdate { stream_id, .. } => Some(*stream_id),
                _ => None,
            })
            .collect();
        assert_eq!(updated, vec![0, 1]);
    }

    #[test]
    fn test_uppercase_header_resets_stream_only() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        let block = encoder.encode(&[
            (":method".to_string(), "GET".to_string()),
            (":scheme".to_string(), "http".to_string()),
            (":path".to_string(), "/".to_string()),
            ("X-Bad".to_string(), "1".to_string()),
        ]);
        let effects = mux.dispatch(headers(1, block, true)).unwrap();
        assert!(matches!(
            effects[..],
            [Effect::Reset {
                stream_id: 1,
                code: ErrorCode::ProtocolError
            }]
        ));

        // The decoder stayed in sync, so the next request still decodes
        let effects = mux
            .dispatch(headers(3, request_block(&mut encoder, "/ok"), true))
            .unwrap();
        assert!(matches!(effects[..], [Effect::Opened(3), Effect::Request(_)]));
    }

    #[test]
    fn test_continuation_assembly() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        let block = request_block(&mut encoder, "/split");
        let (first, second) = block.split_at(3);

        let frame = raw(FrameCodec::encode_headers_frame(&HeadersFrame::new(
            1,
            Bytes::copy_from_slice(first),
            true,
            false,
        )));
        assert!(mux.dispatch(frame).unwrap().is_empty());

        let ping = Frame::new(FrameType::Ping, FrameFlags::empty(), 0, Bytes::from_static(&[0; 8]));
        let mut interleaved = started(100);
        interleaved
            .dispatch(raw(FrameCodec::encode_headers_frame(&HeadersFrame::new(
                1,
                Bytes::copy_from_slice(first),
                true,
                false,
            ))))
            .unwrap();
        assert!(interleaved.dispatch(ping).is_err());

        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::END_HEADERS);
        let continuation = Frame::new(
            FrameType::Continuation,
            flags,
            1,
            Bytes::copy_from_slice(second),
        );
        let effects = mux.dispatch(continuation).unwrap();
        match &effects[..] {
            [Effect::Opened(1), Effect::Request(request)] => assert_eq!(request.path(), "/split"),
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn test_self_dependent_priority() {
        let mut mux = started(100);
        let frame = raw(FrameCodec::encode_priority_frame(
            &crate::http::h2::frames::PriorityFrame {
                stream_id: 5,
                priority: PrioritySpec::new(5, false, 15),
            },
        ));
        let effects = mux.dispatch(frame).unwrap();
        assert!(matches!(effects[..], [Effect::Reset { stream_id: 5, .. }]));
    }

    #[test]
    fn test_window_update_zero_increment() {
        let mut mux = started(100);
        let frame = raw(FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(0, 0)));
        assert_eq!(mux.dispatch(frame).unwrap_err().code(), ErrorCode::ProtocolError);

        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(1, request_block(&mut encoder, "/"), false))
            .unwrap();
        let frame = raw(FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(1, 0)));
        let effects = mux.dispatch(frame).unwrap();
        assert!(matches!(effects[..], [Effect::Reset { stream_id: 1, .. }]));
    }

    #[test]
    fn test_peer_reset_cancels() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(1, request_block(&mut encoder, "/"), true))
            .unwrap();

        let frame = raw(FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(
            1,
            ErrorCode::Cancel,
        )));
        let effects = mux.dispatch(frame).unwrap();
        assert!(matches!(effects[..], [Effect::Cancelled(1)]));
        assert!(mux.is_idle());

        let idle = raw(FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(
            9,
            ErrorCode::Cancel,
        )));
        assert!(mux.dispatch(idle).is_err());
    }

    #[test]
    fn test_push_promise_from_client() {
        let mut mux = started(100);
        let frame = Frame::new(
            FrameType::PushPromise,
            FrameFlags::empty(),
            1,
            Bytes::from_static(&[0, 0, 0, 2]),
        );
        assert_eq!(mux.dispatch(frame).unwrap_err().code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_upgraded_stream() {
        let mut mux = StreamMultiplexer::new(Settings::new(), 1024, false);
        let request = HttpRequest::new(Method::Get, "/upgraded");
        let request = mux.open_upgraded_stream(request).unwrap();
        assert_eq!(request.stream_id(), Some(1));
        assert_eq!(mux.last_stream_id(), 1);
        assert_eq!(
            mux.stream(1).map(|s| s.state()),
            Some(crate::http::h2::stream::StreamState::HalfClosedRemote)
        );
    }

    #[test]
    fn test_expired_streams() {
        let mut mux = started(100);
        let mut encoder = HeaderEncoder::new();
        mux.dispatch(headers(1, request_block(&mut encoder, "/"), true))
            .unwrap();

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(mux.expired_streams(later, Duration::from_secs(60)), vec![1]);
        assert!(mux.expired_streams(Instant::now(), Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_build_request_rejects_malformed() {
        let fields = |list: &[(&str, &str)]| -> Vec<(String, String)> {
            list.iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect()
        };

        assert!(build_request(1, fields(&[(":method", "GET"), (":scheme", "http")]), false).is_err());
        assert!(build_request(
            1,
            fields(&[(":method", "GET"), (":scheme", "http"), (":path", "/"), ("connection", "close")]),
            false
        )
        .is_err());
        assert!(build_request(
            1,
            fields(&[(":method", "GET"), ("accept", "*/*"), (":scheme", "http"), (":path", "/")]),
            false
        )
        .is_err());
        assert!(build_request(
            1,
            fields(&[(":method", "GET"), (":scheme", "http"), (":path", "/"), ("te", "trailers")]),
            true
        )
        .unwrap()
        .secure());
    }
}

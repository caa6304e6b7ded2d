//! HTTP/2 client with low-level frame control
//!
//! `H2Client` is the peer used to exercise the server. It speaks h2c either
//! with prior knowledge or through the HTTP/1.1 upgrade, and can put any
//! frame on the wire, including ones a well-behaved client never would.
//!
//! Header blocks are decoded as they arrive, so responses on interleaved
//! streams keep the HPACK tables in sync no matter which stream the caller
//! waits for first.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use super::frames::*;
use super::hpack::HeaderContext;
use super::settings::{Settings, SettingsBuilder};
use super::stream::StreamId;
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID};
use crate::http::parser::ResponseParser;
use crate::http::session::{HttpSession, SessionOps};
use crate::http::Status;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::time::Duration;

/// HTTP/2 client
pub struct H2Client<S: SessionOps> {
    session: HttpSession<S>,
    hpack: HeaderContext,
    buf: BytesMut,
    local_settings: Settings,
    remote_settings: Settings,
    next_stream_id: StreamId,
    recv_window: FlowControlWindow,
    responses: HashMap<StreamId, Pending>,
    /// Header block being assembled from HEADERS and CONTINUATION frames
    block: Option<(StreamId, BytesMut, bool)>,
    goaway: Option<GoawayFrame>,
    settings_acked: bool,
}

#[derive(Debug)]
struct Pending {
    response: H2Response,
    window: FlowControlWindow,
    complete: bool,
    reset: Option<ErrorCode>,
}

impl Pending {
    fn new(stream_id: StreamId, initial_window: u32) -> Self {
        Pending {
            response: H2Response {
                stream_id,
                status: 0,
                headers: HashMap::new(),
                body: Vec::new(),
            },
            window: FlowControlWindow::with_initial_size(initial_window),
            complete: false,
            reset: None,
        }
    }
}

impl<S: SessionOps> H2Client<S> {
    /// Create a client with default settings
    pub fn new(session: S) -> Result<Self> {
        H2ClientBuilder::new().build(session)
    }

    /// Start an h2c connection with prior knowledge
    ///
    /// Sends the preface and our SETTINGS, then waits for the server's
    /// SETTINGS and acknowledges them.
    pub fn connect(&mut self) -> Result<()> {
        self.send_raw(CONNECTION_PREFACE)?;
        self.send_settings(&SettingsFrame::new(self.local_settings.clone()))?;
        self.recv_settings()
    }

    /// Start an h2c connection through the HTTP/1.1 upgrade
    ///
    /// The request for `path` becomes stream 1; its response is read with
    /// [`recv_response`](Self::recv_response). Fails with a protocol error
    /// when the server answers with anything but 101.
    pub fn connect_upgrade(&mut self, path: &str) -> Result<()> {
        let request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Connection: Upgrade, HTTP2-Settings\r\n\
             Upgrade: h2c\r\n\
             HTTP2-Settings: {}\r\n\r\n",
            path,
            self.local_settings.to_http2_settings_header()
        );
        self.send_raw(request.as_bytes())?;

        let mut parser = ResponseParser::new();
        let mut chunk = [0u8; 4096];
        let response = loop {
            let n = self.session.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            if let Some(response) = parser.parse(&chunk[..n])? {
                break response;
            }
        };

        if response.status() != Status::SWITCHING_PROTOCOLS {
            return Err(Error::Protocol(format!(
                "upgrade refused with status {}",
                response.status()
            )));
        }
        self.buf.extend_from_slice(&parser.take_remaining());
        let window = self.local_settings.get_initial_window_size();
        self.responses.insert(1, Pending::new(1, window));
        self.next_stream_id = 3;

        self.send_raw(CONNECTION_PREFACE)?;
        self.send_settings(&SettingsFrame::new(self.local_settings.clone()))?;
        self.recv_settings()
    }

    /// Wait for the server's (non-ACK) SETTINGS frame and acknowledge it
    pub fn recv_settings(&mut self) -> Result<()> {
        loop {
            let frame = self.recv_frame()?;
            let is_settings = frame.frame_type == FrameType::Settings && !frame.flags.is_ack();
            self.process(frame)?;
            if is_settings {
                return Ok(());
            }
        }
    }

    /// Send a GET and wait for its response
    pub fn get(&mut self, path: &str) -> Result<H2Response> {
        self.request("GET", path, &[], Bytes::new())
    }

    /// Send a request and wait for its response
    pub fn request(
        &mut self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<H2Response> {
        let stream_id = self.start_request(method, path, headers, body)?;
        self.recv_response(stream_id)
    }

    /// Send a request on a new stream without waiting for the response
    pub fn start_request(
        &mut self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> Result<StreamId> {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let mut fields = vec![
            (":method".to_string(), method.to_string()),
            (":scheme".to_string(), "http".to_string()),
            (":path".to_string(), path.to_string()),
            (":authority".to_string(), "localhost".to_string()),
        ];
        fields.extend(
            headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string())),
        );
        let block = self.hpack.encode_headers(&fields);

        let window = self.local_settings.get_initial_window_size();
        self.responses.insert(stream_id, Pending::new(stream_id, window));
        self.send_headers(&HeadersFrame::new(stream_id, block, body.is_empty(), true))?;

        if !body.is_empty() {
            let max = self.remote_settings.get_max_frame_size() as usize;
            let mut rest = body;
            while rest.len() > max {
                let chunk = rest.split_to(max);
                self.send_data(&DataFrame::new(stream_id, chunk, false))?;
            }
            self.send_data(&DataFrame::new(stream_id, rest, true))?;
        }
        Ok(stream_id)
    }

    /// HPACK-encode a header list with the connection's encoder
    pub fn encode_headers(&mut self, fields: &[(&str, &str)]) -> Bytes {
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.hpack.encode_headers(&fields)
    }

    /// Reserve the next client stream id without sending anything
    pub fn next_stream_id(&mut self) -> StreamId {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        let window = self.local_settings.get_initial_window_size();
        self.responses.insert(stream_id, Pending::new(stream_id, window));
        stream_id
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.session.write_all(bytes)?;
        Ok(())
    }

    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send_raw(&FrameCodec::encode(frame))
    }

    pub fn send_settings(&mut self, frame: &SettingsFrame) -> Result<()> {
        self.send_raw(&FrameCodec::encode_settings_frame(frame))
    }

    pub fn send_settings_ack(&mut self) -> Result<()> {
        self.send_settings(&SettingsFrame::ack())
    }

    pub fn send_headers(&mut self, frame: &HeadersFrame) -> Result<()> {
        self.send_raw(&FrameCodec::encode_headers_frame(frame))
    }

    pub fn send_continuation(&mut self, frame: &ContinuationFrame) -> Result<()> {
        self.send_raw(&FrameCodec::encode_continuation_frame(frame))
    }

    /// Send a DATA frame, ignoring the server's flow-control windows
    pub fn send_data(&mut self, frame: &DataFrame) -> Result<()> {
        self.send_raw(&FrameCodec::encode_data_frame(frame))
    }

    pub fn send_ping(&mut self, data: [u8; 8]) -> Result<()> {
        self.send_raw(&FrameCodec::encode_ping_frame(&PingFrame::new(data)))
    }

    pub fn send_priority(&mut self, stream_id: StreamId, priority: PrioritySpec) -> Result<()> {
        let frame = PriorityFrame {
            stream_id,
            priority,
        };
        self.send_raw(&FrameCodec::encode_priority_frame(&frame))
    }

    pub fn send_window_update(&mut self, stream_id: StreamId, increment: u32) -> Result<()> {
        let frame = WindowUpdateFrame::new(stream_id, increment);
        self.send_raw(&FrameCodec::encode_window_update_frame(&frame))
    }

    pub fn send_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) -> Result<()> {
        let frame = RstStreamFrame::new(stream_id, error_code);
        self.send_raw(&FrameCodec::encode_rst_stream_frame(&frame))
    }

    pub fn send_goaway(
        &mut self,
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug: &str,
    ) -> Result<()> {
        let frame = GoawayFrame::new(last_stream_id, error_code, Bytes::from(debug.to_string()));
        self.send_raw(&FrameCodec::encode_goaway_frame(&frame))
    }

    /// Read the next frame off the wire, without acting on it
    ///
    /// HEADERS read this way bypass the HPACK decoder, so mixing this with
    /// [`recv_response`](Self::recv_response) on a connection where the
    /// server uses its dynamic table is unreliable.
    pub fn recv_frame(&mut self) -> Result<Frame> {
        let max_frame_size = self.local_settings.get_max_frame_size();
        loop {
            if let Some(frame) = FrameCodec::decode(&mut self.buf, max_frame_size)? {
                return Ok(frame);
            }
            let mut chunk = [0u8; 16384];
            let n = self.session.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Wait for the complete response on `stream_id`
    ///
    /// Frames for other streams are processed along the way. A reset of the
    /// stream comes back as [`Error::Reset`], a GOAWAY as [`Error::GoAway`].
    pub fn recv_response(&mut self, stream_id: StreamId) -> Result<H2Response> {
        loop {
            if let Some(pending) = self.responses.get(&stream_id) {
                if let Some(code) = pending.reset {
                    self.responses.remove(&stream_id);
                    return Err(Error::Reset { stream_id, code });
                }
                if pending.complete {
                    if let Some(pending) = self.responses.remove(&stream_id) {
                        return Ok(pending.response);
                    }
                }
            }
            if let Some(goaway) = &self.goaway {
                return Err(Error::GoAway {
                    last_stream_id: goaway.last_stream_id,
                    code: goaway.error_code,
                });
            }

            let frame = self.recv_frame()?;
            self.process(frame)?;
        }
    }

    /// Wait until the server resets `stream_id`, returning the error code
    pub fn recv_reset(&mut self, stream_id: StreamId) -> Result<ErrorCode> {
        match self.recv_response(stream_id) {
            Err(Error::Reset { code, .. }) => Ok(code),
            Err(err) => Err(err),
            Ok(response) => Err(Error::Protocol(format!(
                "stream {} completed with status {} instead of a reset",
                stream_id, response.status
            ))),
        }
    }

    /// Read frames until a GOAWAY arrives
    pub fn recv_goaway(&mut self) -> Result<GoawayFrame> {
        loop {
            if let Some(goaway) = self.goaway.take() {
                return Ok(goaway);
            }
            let frame = self.recv_frame()?;
            self.process(frame)?;
        }
    }

    /// Read and discard frames until the server closes the connection
    pub fn wait_closed(&mut self) -> Result<()> {
        loop {
            match self.recv_frame() {
                Ok(frame) => self.process(frame)?,
                Err(Error::ConnectionClosed) => return Ok(()),
                Err(err) if err.is_transport() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Act on a received frame the way a regular client would
    pub fn process(&mut self, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::Settings => {
                if frame.flags.is_ack() {
                    self.settings_acked = true;
                } else {
                    let settings = Settings::decode_payload(&frame.payload)?;
                    if let Some(size) = settings.header_table_size {
                        self.hpack.encoder_mut().set_peer_table_size(size);
                    }
                    self.remote_settings.merge(&settings);
                    self.send_settings_ack()?;
                }
            }
            FrameType::Ping => {
                if !frame.flags.is_ack() && frame.payload.len() == 8 {
                    let mut data = [0u8; 8];
                    data.copy_from_slice(&frame.payload);
                    self.send_raw(&FrameCodec::encode_ping_frame(&PingFrame::ack(data)))?;
                }
            }
            FrameType::Headers => {
                let fragment = header_fragment(&frame)?;
                let block = BytesMut::from(&fragment[..]);
                self.block = Some((frame.stream_id, block, frame.flags.is_end_stream()));
                if frame.flags.is_end_headers() {
                    self.finish_block()?;
                }
            }
            FrameType::Continuation => {
                let Some((stream_id, block, _)) = self.block.as_mut() else {
                    return Err(Error::Protocol("CONTINUATION without HEADERS".to_string()));
                };
                if *stream_id != frame.stream_id {
                    return Err(Error::Protocol("CONTINUATION on another stream".to_string()));
                }
                block.extend_from_slice(&frame.payload);
                if frame.flags.is_end_headers() {
                    self.finish_block()?;
                }
            }
            FrameType::Data => self.on_data(frame)?,
            FrameType::RstStream => {
                let code = ErrorCode::from_wire(read_u32(&frame.payload)?);
                let window = self.local_settings.get_initial_window_size();
                let pending = self
                    .responses
                    .entry(frame.stream_id)
                    .or_insert_with(|| Pending::new(frame.stream_id, window));
                pending.reset = Some(code);
            }
            FrameType::Goaway => {
                if frame.payload.len() < 8 {
                    return Err(Error::FrameSize("GOAWAY shorter than 8 bytes".to_string()));
                }
                let last_stream_id = read_u32(&frame.payload)? & 0x7FFF_FFFF;
                let code = ErrorCode::from_wire(read_u32(&frame.payload[4..])?);
                let debug_data = frame.payload.slice(8..);
                self.goaway = Some(GoawayFrame::new(last_stream_id, code, debug_data));
            }
            _ => {}
        }
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        let Some((stream_id, block, end_stream)) = self.block.take() else {
            return Ok(());
        };
        let fields = self.hpack.decode_headers(stream_id, &block)?;
        let window = self.local_settings.get_initial_window_size();

        let pending = self
            .responses
            .entry(stream_id)
            .or_insert_with(|| Pending::new(stream_id, window));
        for (name, value) in fields {
            if name == ":status" {
                pending.response.status = value.parse().unwrap_or(0);
            } else {
                pending.response.headers.insert(name, value);
            }
        }
        if end_stream {
            pending.complete = true;
        }
        Ok(())
    }

    fn on_data(&mut self, frame: Frame) -> Result<()> {
        let stream_id = frame.stream_id;
        let mut data = frame.payload;
        if frame.flags.is_padded() {
            data = strip_padding(data)?;
        }

        self.recv_window.receive(data.len())?;
        if let Some(increment) = self.recv_window.should_send_window_update() {
            self.recv_window.release(increment);
            self.send_window_update(CONNECTION_STREAM_ID, increment)?;
        }

        let Some(pending) = self.responses.get_mut(&stream_id) else {
            return Ok(());
        };
        pending.window.receive(data.len())?;
        pending.response.body.extend_from_slice(&data);
        let update = if frame.flags.is_end_stream() {
            pending.complete = true;
            None
        } else {
            pending.window.should_send_window_update()
        };
        if let Some(increment) = update {
            pending.window.release(increment);
            self.send_window_update(stream_id, increment)?;
        }
        Ok(())
    }

    /// Has the server acknowledged our SETTINGS yet
    pub fn settings_acked(&self) -> bool {
        self.settings_acked
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// Set how long reads wait before failing
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.session.set_timeout(timeout);
    }

    /// Close the connection
    pub fn close(&mut self) -> Result<()> {
        self.session.close()?;
        Ok(())
    }
}

fn read_u32(payload: &[u8]) -> Result<u32> {
    match payload {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(Error::FrameSize("payload shorter than 4 bytes".to_string())),
    }
}

fn strip_padding(mut data: Bytes) -> Result<Bytes> {
    if data.is_empty() {
        return Err(Error::Protocol("padded frame without pad length".to_string()));
    }
    let pad = data.get_u8() as usize;
    if pad > data.len() {
        return Err(Error::Protocol("padding exceeds payload".to_string()));
    }
    data.truncate(data.len() - pad);
    Ok(data)
}

/// Header block fragment of a HEADERS frame, minus padding and priority
fn header_fragment(frame: &Frame) -> Result<Bytes> {
    let mut data = frame.payload.clone();
    if frame.flags.is_padded() {
        data = strip_padding(data)?;
    }
    if frame.flags.is_priority() {
        if data.len() < 5 {
            return Err(Error::FrameSize("HEADERS priority block truncated".to_string()));
        }
        data.advance(5);
    }
    Ok(data)
}

/// HTTP/2 response
#[derive(Debug, Clone)]
pub struct H2Response {
    pub stream_id: StreamId,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl H2Response {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_string(&self) -> Result<String> {
        String::from_utf8(self.body.clone())
            .map_err(|e| Error::Internal(format!("Invalid UTF-8 in body: {}", e)))
    }
}

/// Builder for [`H2Client`]
pub struct H2ClientBuilder {
    settings: SettingsBuilder,
    timeout: Option<Duration>,
}

impl H2ClientBuilder {
    pub fn new() -> Self {
        H2ClientBuilder {
            settings: SettingsBuilder::new().enable_push(false),
            timeout: Some(Duration::from_secs(5)),
        }
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings = self.settings.header_table_size(size);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings = self.settings.initial_window_size(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings = self.settings.max_frame_size(size);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings = self.settings.max_concurrent_streams(max);
        self
    }

    /// Read timeout; `None` blocks forever
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build<S: SessionOps>(self, session: S) -> Result<H2Client<S>> {
        let local_settings = self.settings.build()?;
        let mut session = HttpSession::new(session);
        session.set_timeout(self.timeout);

        Ok(H2Client {
            session,
            hpack: HeaderContext::new(local_settings.get_header_table_size()),
            buf: BytesMut::new(),
            recv_window: FlowControlWindow::with_initial_size(
                super::DEFAULT_INITIAL_WINDOW_SIZE,
            ),
            local_settings,
            remote_settings: Settings::new(),
            next_stream_id: 1,
            responses: HashMap::new(),
            block: None,
            goaway: None,
            settings_acked: false,
        })
    }
}

impl Default for H2ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_accessors() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());

        let response = H2Response {
            stream_id: 1,
            status: 200,
            headers,
            body: b"Hello".to_vec(),
        };

        assert_eq!(response.status(), 200);
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.body(), b"Hello");
        assert_eq!(response.body_string().unwrap(), "Hello");
    }

    #[test]
    fn test_header_fragment_strips_padding_and_priority() {
        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::PADDED);
        flags.set(FrameFlags::PRIORITY);
        let payload = Bytes::from_static(&[2, 0, 0, 0, 3, 16, 0x82, 0x84, 0, 0]);
        let frame = Frame::new(FrameType::Headers, flags, 1, payload);

        assert_eq!(&header_fragment(&frame).unwrap()[..], &[0x82, 0x84]);
    }

    #[test]
    fn test_read_u32() {
        assert_eq!(read_u32(&[0, 0, 0, 8]).unwrap(), 8);
        assert!(read_u32(&[0, 0]).is_err());
    }
}

//! HTTP/2 stream state (RFC 7540 Section 5.1)
//!
//! Only client-initiated streams exist on this server, and push is never
//! used, so the reserved states are absent. Transitions are listed in
//! [`TRANSITIONS`]; anything not listed there is illegal for the state.

use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use std::fmt;
use std::time::{Duration, Instant};

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No frames have been sent or received
    Idle,
    /// Both sides can send frames
    Open,
    /// We finished sending, the client may still send
    HalfClosedLocal,
    /// The client finished sending, we still owe the response
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Check if the peer may still send DATA
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if we may still send
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Open => "open",
            StreamState::HalfClosedLocal => "half-closed (local)",
            StreamState::HalfClosedRemote => "half-closed (remote)",
            StreamState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something that moves a stream between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// HEADERS received
    RecvHeaders,
    /// END_STREAM received on HEADERS or DATA
    RecvEndStream,
    /// DATA received without END_STREAM
    RecvData,
    /// Response HEADERS sent
    SendHeaders,
    /// END_STREAM sent
    SendEndStream,
    /// RST_STREAM sent or received
    Reset,
}

/// Legal `(from, event, to)` transitions
pub static TRANSITIONS: &[(StreamState, StreamEvent, StreamState)] = &[
    (StreamState::Idle, StreamEvent::RecvHeaders, StreamState::Open),
    (StreamState::Open, StreamEvent::RecvHeaders, StreamState::Open),
    (StreamState::Open, StreamEvent::RecvData, StreamState::Open),
    (StreamState::Open, StreamEvent::RecvEndStream, StreamState::HalfClosedRemote),
    (StreamState::Open, StreamEvent::SendHeaders, StreamState::Open),
    (StreamState::Open, StreamEvent::SendEndStream, StreamState::HalfClosedLocal),
    (StreamState::Open, StreamEvent::Reset, StreamState::Closed),
    (StreamState::HalfClosedLocal, StreamEvent::RecvData, StreamState::HalfClosedLocal),
    (StreamState::HalfClosedLocal, StreamEvent::RecvEndStream, StreamState::Closed),
    (StreamState::HalfClosedLocal, StreamEvent::Reset, StreamState::Closed),
    (StreamState::HalfClosedRemote, StreamEvent::SendHeaders, StreamState::HalfClosedRemote),
    (StreamState::HalfClosedRemote, StreamEvent::SendEndStream, StreamState::Closed),
    (StreamState::HalfClosedRemote, StreamEvent::Reset, StreamState::Closed),
];

/// Look up the state an event leads to, `None` if it is illegal
pub fn transition(from: StreamState, event: StreamEvent) -> Option<StreamState> {
    TRANSITIONS
        .iter()
        .find(|(state, ev, _)| *state == from && *ev == event)
        .map(|(_, _, to)| *to)
}

/// Error code for a frame the current state does not allow
fn illegal_code(state: StreamState) -> ErrorCode {
    match state {
        StreamState::HalfClosedRemote | StreamState::Closed => ErrorCode::StreamClosed,
        _ => ErrorCode::ProtocolError,
    }
}

/// HTTP/2 stream, as seen by the read loop
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    /// Credit we granted the client on this stream
    recv_window: FlowControlWindow,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    opened_at: Instant,
}

impl H2Stream {
    pub fn new(id: StreamId, initial_window: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            recv_window: FlowControlWindow::with_initial_size(initial_window),
            headers: Vec::new(),
            body: Vec::new(),
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Apply an event, failing with a stream error if the state forbids it
    pub fn apply(&mut self, event: StreamEvent) -> Result<StreamState> {
        match transition(self.state, event) {
            Some(next) => {
                tracing::trace!(stream_id = self.id, from = %self.state, to = %next, ?event, "stream transition");
                self.state = next;
                Ok(next)
            }
            None => Err(Error::stream(
                self.id,
                illegal_code(self.state),
                format!("{:?} not allowed in state {}", event, self.state),
            )),
        }
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    pub fn recv_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.recv_window
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_headers(&mut self, headers: Vec<(String, String)>) {
        self.headers = headers;
    }

    pub fn take_headers(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.headers)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Take body (consumes the body data)
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Whether the stream has been open longer than `timeout` at `now`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.opened_at) > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_body() {
        let mut stream = H2Stream::new(1, 65535);
        assert_eq!(stream.state(), StreamState::Idle);

        stream.apply(StreamEvent::RecvHeaders).unwrap();
        stream.apply(StreamEvent::RecvEndStream).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert!(stream.state().can_send());
        assert!(!stream.state().can_receive());

        stream.apply(StreamEvent::SendHeaders).unwrap();
        stream.apply(StreamEvent::SendEndStream).unwrap();
        assert!(stream.state().is_closed());
    }

    #[test]
    fn test_data_on_idle_stream() {
        let mut stream = H2Stream::new(1, 65535);
        let err = stream.apply(StreamEvent::RecvData).unwrap_err();
        assert!(err.is_stream_error());
        assert_eq!(err.code(), ErrorCode::ProtocolError);
        assert_eq!(stream.state(), StreamState::Idle);
    }

    #[test]
    fn test_data_after_end_stream() {
        let mut stream = H2Stream::new(3, 65535);
        stream.apply(StreamEvent::RecvHeaders).unwrap();
        stream.apply(StreamEvent::RecvEndStream).unwrap();

        let err = stream.apply(StreamEvent::RecvData).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StreamClosed);
    }

    #[test]
    fn test_reset_from_active_states() {
        for state in [
            StreamState::Open,
            StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote,
        ] {
            assert_eq!(transition(state, StreamEvent::Reset), Some(StreamState::Closed));
        }
        assert_eq!(transition(StreamState::Idle, StreamEvent::Reset), None);
        assert_eq!(transition(StreamState::Closed, StreamEvent::Reset), None);
    }

    #[test]
    fn test_closed_is_terminal() {
        let events = [
            StreamEvent::RecvHeaders,
            StreamEvent::RecvEndStream,
            StreamEvent::RecvData,
            StreamEvent::SendHeaders,
            StreamEvent::SendEndStream,
            StreamEvent::Reset,
        ];
        for event in events {
            assert_eq!(transition(StreamState::Closed, event), None);
        }
    }

    #[test]
    fn test_body_accumulation() {
        let mut stream = H2Stream::new(1, 65535);
        stream.append_body(b"body data");
        stream.append_body(b" more");
        assert_eq!(stream.body(), b"body data more");
        assert_eq!(stream.take_body(), b"body data more");
        assert!(stream.body().is_empty());
    }

    #[test]
    fn test_expiry() {
        let stream = H2Stream::new(1, 65535);
        let later = stream.opened_at() + Duration::from_secs(5);
        assert!(stream.is_expired(later, Duration::from_secs(1)));
        assert!(!stream.is_expired(later, Duration::from_secs(10)));
    }
}

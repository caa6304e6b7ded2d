//! HTTP/2 frame encoding and decoding
//!
//! [`FrameCodec`] is stateless. Decoding works on the caller's read buffer:
//! a frame is consumed only once it is complete, so partial input is simply
//! left in place until more bytes arrive. The typed `parse_*` functions turn
//! a raw [`Frame`] into its typed form and enforce the fixed-size and
//! stream-id rules of RFC 7540 Section 6.

use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::settings::Settings;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, reserved bit is 0)
        let stream_id = stream_id & 0x7FFF_FFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header
    ///
    /// Returns type, flags, stream id (reserved bit ignored) and payload length.
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (FrameType, FrameFlags, u32, usize) {
        let length =
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let frame_type = FrameType::from_u8(bytes[3]);
        let flags = FrameFlags::from_u8(bytes[4]);
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        (frame_type, flags, stream_id, length)
    }

    /// Decode one frame from the front of `buf`
    ///
    /// `Ok(None)` means the buffer does not yet hold a whole frame and nothing
    /// was consumed. A declared length above `max_frame_size` is a
    /// FRAME_SIZE_ERROR. Frames of unknown type are consumed and returned
    /// with an empty payload.
    pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let (frame_type, flags, stream_id, length) = Self::decode_header(&header);

        if length > max_frame_size as usize {
            return Err(Error::FrameSize(format!(
                "{} frame of {} bytes exceeds maximum {}",
                frame_type.name(),
                length,
                max_frame_size
            )));
        }

        if buf.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = if let FrameType::Unknown(_) = frame_type {
            buf.advance(length);
            Bytes::new()
        } else {
            buf.split_to(length).freeze()
        };

        Ok(Some(Frame::new(frame_type, flags, stream_id, payload)))
    }

    /// Encode a raw frame
    pub fn encode(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
        buf.put_slice(&Self::encode_header(
            frame.frame_type,
            frame.flags,
            frame.stream_id,
            frame.payload.len(),
        ));
        buf.put_slice(&frame.payload);
        buf.freeze()
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.data.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header = Self::encode_header(FrameType::Data, flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }
        buf.put_slice(&frame.data);
        buf.put_bytes(0, padding_len as usize);

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }

        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header = Self::encode_header(FrameType::Headers, flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }
        if let Some(priority) = &frame.priority {
            put_priority(&mut buf, priority);
        }
        buf.put_slice(&frame.header_block);
        buf.put_bytes(0, padding_len as usize);

        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());
        buf.put_slice(&Self::encode_header(
            FrameType::Continuation,
            flags,
            frame.stream_id,
            frame.header_block.len(),
        ));
        buf.put_slice(&frame.header_block);
        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let (flags, payload) = if frame.ack {
            (FrameFlags::from_u8(FrameFlags::ACK), Bytes::new())
        } else {
            (FrameFlags::empty(), frame.settings.encode_payload())
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&Self::encode_header(FrameType::Settings, flags, 0, payload.len()));
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        buf.put_slice(&Self::encode_header(FrameType::Ping, flags, 0, 8));
        buf.put_slice(&frame.data);
        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let payload_len = 8 + frame.debug_data.len();

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(
            FrameType::Goaway,
            FrameFlags::empty(),
            0,
            payload_len,
        ));
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code.as_u32());
        buf.freeze()
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(frame: &PriorityFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
        buf.put_slice(&Self::encode_header(
            FrameType::Priority,
            FrameFlags::empty(),
            frame.stream_id,
            5,
        ));
        put_priority(&mut buf, &frame.priority);
        buf.freeze()
    }

    /// Parse a DATA frame, stripping padding
    pub fn parse_data(frame: &Frame) -> Result<DataFrame> {
        require_stream(frame)?;
        let (data, padding) = strip_padding(frame, 0)?;
        Ok(DataFrame {
            stream_id: frame.stream_id,
            data,
            end_stream: frame.flags.is_end_stream(),
            padding,
        })
    }

    /// Parse a HEADERS frame, stripping padding and the priority block
    pub fn parse_headers(frame: &Frame) -> Result<HeadersFrame> {
        require_stream(frame)?;
        let priority_len = if frame.flags.is_priority() { 5 } else { 0 };
        let (mut block, padding) = strip_padding(frame, priority_len)?;

        let priority = if frame.flags.is_priority() {
            let spec = read_priority(&block[..5]);
            block.advance(5);
            Some(spec)
        } else {
            None
        };

        Ok(HeadersFrame {
            stream_id: frame.stream_id,
            header_block: block,
            end_stream: frame.flags.is_end_stream(),
            end_headers: frame.flags.is_end_headers(),
            priority,
            padding,
        })
    }

    /// Parse a CONTINUATION frame
    pub fn parse_continuation(frame: &Frame) -> Result<ContinuationFrame> {
        require_stream(frame)?;
        Ok(ContinuationFrame {
            stream_id: frame.stream_id,
            header_block: frame.payload.clone(),
            end_headers: frame.flags.is_end_headers(),
        })
    }

    /// Parse a PRIORITY frame
    ///
    /// A wrong length only affects the stream (RFC 7540 Section 6.3).
    pub fn parse_priority(frame: &Frame) -> Result<PriorityFrame> {
        require_stream(frame)?;
        if frame.payload.len() != 5 {
            return Err(Error::stream(
                frame.stream_id,
                ErrorCode::FrameSizeError,
                format!("PRIORITY payload of {} bytes", frame.payload.len()),
            ));
        }
        Ok(PriorityFrame {
            stream_id: frame.stream_id,
            priority: read_priority(&frame.payload),
        })
    }

    /// Parse a RST_STREAM frame
    pub fn parse_rst_stream(frame: &Frame) -> Result<RstStreamFrame> {
        require_stream(frame)?;
        let code = read_u32(frame, 4)?;
        Ok(RstStreamFrame::new(frame.stream_id, ErrorCode::from_wire(code)))
    }

    /// Parse a SETTINGS frame
    pub fn parse_settings(frame: &Frame) -> Result<SettingsFrame> {
        require_connection(frame)?;
        if frame.flags.is_ack() {
            if !frame.payload.is_empty() {
                return Err(Error::FrameSize("SETTINGS ACK with payload".to_string()));
            }
            return Ok(SettingsFrame::ack());
        }
        Ok(SettingsFrame::new(Settings::decode_payload(&frame.payload)?))
    }

    /// Parse a PING frame
    pub fn parse_ping(frame: &Frame) -> Result<PingFrame> {
        require_connection(frame)?;
        let data: [u8; 8] = (&frame.payload[..])
            .try_into()
            .map_err(|_| Error::FrameSize(format!("PING payload of {} bytes", frame.payload.len())))?;
        Ok(PingFrame {
            ack: frame.flags.is_ack(),
            data,
        })
    }

    /// Parse a GOAWAY frame
    pub fn parse_goaway(frame: &Frame) -> Result<GoawayFrame> {
        require_connection(frame)?;
        if frame.payload.len() < 8 {
            return Err(Error::FrameSize(format!(
                "GOAWAY payload of {} bytes",
                frame.payload.len()
            )));
        }
        let mut payload = frame.payload.clone();
        let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
        let error_code = ErrorCode::from_wire(payload.get_u32());
        Ok(GoawayFrame::new(last_stream_id, error_code, payload))
    }

    /// Parse a WINDOW_UPDATE frame
    ///
    /// A zero increment is left for the caller to reject, since its scope
    /// depends on the stream id.
    pub fn parse_window_update(frame: &Frame) -> Result<WindowUpdateFrame> {
        let increment = read_u32(frame, 4)? & 0x7FFF_FFFF;
        Ok(WindowUpdateFrame::new(frame.stream_id, increment))
    }
}

fn put_priority(buf: &mut BytesMut, priority: &PrioritySpec) {
    let mut dep = priority.stream_dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}

fn read_priority(bytes: &[u8]) -> PrioritySpec {
    let dep = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    PrioritySpec::new(dep & 0x7FFF_FFFF, dep & 0x8000_0000 != 0, bytes[4])
}

/// Read a fixed 4-byte payload
fn read_u32(frame: &Frame, expected: usize) -> Result<u32> {
    if frame.payload.len() != expected {
        return Err(Error::FrameSize(format!(
            "{} payload of {} bytes, expected {}",
            frame.frame_type.name(),
            frame.payload.len(),
            expected
        )));
    }
    let p = &frame.payload;
    Ok(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
}

/// Remove the pad length octet and trailing padding
///
/// `fixed` is the number of octets after the pad length that must remain
/// (the priority block of HEADERS).
fn strip_padding(frame: &Frame, fixed: usize) -> Result<(Bytes, Option<u8>)> {
    let mut payload = frame.payload.clone();

    if !frame.flags.is_padded() {
        if payload.len() < fixed {
            return Err(Error::FrameSize(format!(
                "{} payload too short",
                frame.frame_type.name()
            )));
        }
        return Ok((payload, None));
    }

    if payload.is_empty() {
        return Err(Error::FrameSize(format!(
            "padded {} without pad length",
            frame.frame_type.name()
        )));
    }
    let pad_len = payload.get_u8();
    if pad_len as usize + fixed > payload.len() {
        return Err(Error::Protocol(format!(
            "{} padding of {} exceeds payload",
            frame.frame_type.name(),
            pad_len
        )));
    }
    payload.truncate(payload.len() - pad_len as usize);
    Ok((payload, Some(pad_len)))
}

fn require_stream(frame: &Frame) -> Result<()> {
    if frame.stream_id == 0 {
        return Err(Error::Protocol(format!(
            "{} frame on stream 0",
            frame.frame_type.name()
        )));
    }
    Ok(())
}

fn require_connection(frame: &Frame) -> Result<()> {
    if frame.stream_id != 0 {
        return Err(Error::Protocol(format!(
            "{} frame on stream {}",
            frame.frame_type.name(),
            frame.stream_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::settings::SettingsBuilder;

    #[test]
    fn test_encode_decode_header() {
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);
        let header = FrameCodec::encode_header(FrameType::Headers, flags, 42, 1234);
        let (frame_type, decoded_flags, stream_id, length) = FrameCodec::decode_header(&header);

        assert_eq!(frame_type, FrameType::Headers);
        assert_eq!(decoded_flags, flags);
        assert_eq!(stream_id, 42);
        assert_eq!(length, 1234);
    }

    #[test]
    fn test_decode_ignores_reserved_bit() {
        let mut header = FrameCodec::encode_header(FrameType::Data, FrameFlags::empty(), 7, 0);
        header[5] |= 0x80;
        let (_, _, stream_id, _) = FrameCodec::decode_header(&header);
        assert_eq!(stream_id, 7);
    }

    #[test]
    fn test_decode_incomplete_consumes_nothing() {
        let encoded = FrameCodec::encode_data_frame(&DataFrame::new(1, Bytes::from("Hello"), true));

        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(FrameCodec::decode(&mut buf, 16384).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        let mut buf = BytesMut::from(&encoded[..12]);
        assert!(FrameCodec::decode(&mut buf, 16384).unwrap().is_none());
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn test_decode_consumes_one_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&FrameCodec::encode_ping_frame(&PingFrame::new([1; 8])));
        buf.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));

        let first = FrameCodec::decode(&mut buf, 16384).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Ping);
        assert_eq!(first.payload_len(), 8);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let second = FrameCodec::decode(&mut buf, 16384).unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Settings);
        assert!(second.flags.is_ack());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_oversize_frame() {
        let header = FrameCodec::encode_header(FrameType::Data, FrameFlags::empty(), 1, 16385);
        let mut buf = BytesMut::from(&header[..]);
        let err = FrameCodec::decode(&mut buf, 16384).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn test_decode_unknown_type_skips_payload() {
        let frame = Frame::new(FrameType::Unknown(0xbb), FrameFlags::empty(), 0, Bytes::from("ext"));
        let mut buf = BytesMut::from(&FrameCodec::encode(&frame)[..]);

        let decoded = FrameCodec::decode(&mut buf, 16384).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Unknown(0xbb));
        assert!(decoded.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_data_frame() {
        let frame = DataFrame::new(1, Bytes::from("Hello"), true);
        let encoded = FrameCodec::encode_data_frame(&frame);

        assert_eq!(encoded[0..3], [0, 0, 5]);
        assert_eq!(encoded[3], FrameType::Data.as_u8());
        assert_eq!(encoded[4], FrameFlags::END_STREAM);
        assert_eq!(&encoded[5..9], &[0, 0, 0, 1]);
        assert_eq!(&encoded[9..], b"Hello");
    }

    #[test]
    fn test_parse_padded_data() {
        let encoded =
            FrameCodec::encode_data_frame(&DataFrame::new(3, Bytes::from("Hi"), false).with_padding(10));
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = FrameCodec::decode(&mut buf, 16384).unwrap().unwrap();

        let data = FrameCodec::parse_data(&frame).unwrap();
        assert_eq!(data.data, Bytes::from("Hi"));
        assert_eq!(data.padding, Some(10));
        assert_eq!(data.flow_controlled_len(), 13);
    }

    #[test]
    fn test_parse_padding_too_long() {
        let frame = Frame::new(
            FrameType::Data,
            FrameFlags::from_u8(FrameFlags::PADDED),
            1,
            Bytes::from_static(&[5, b'a', b'b']),
        );
        assert_eq!(FrameCodec::parse_data(&frame).unwrap_err().code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_parse_headers_with_priority_and_padding() {
        let headers = HeadersFrame::new(5, Bytes::from_static(b"\x82\x84"), true, true)
            .with_priority(PrioritySpec::new(3, true, 15))
            .with_padding(4);
        let encoded = FrameCodec::encode_headers_frame(&headers);
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = FrameCodec::decode(&mut buf, 16384).unwrap().unwrap();

        let parsed = FrameCodec::parse_headers(&frame).unwrap();
        assert_eq!(parsed.header_block, Bytes::from_static(b"\x82\x84"));
        assert_eq!(parsed.priority, Some(PrioritySpec::new(3, true, 15)));
        assert!(parsed.end_stream);
        assert!(parsed.end_headers);
    }

    #[test]
    fn test_parse_stream_id_rules() {
        let data_on_zero = Frame::new(FrameType::Data, FrameFlags::empty(), 0, Bytes::new());
        assert_eq!(FrameCodec::parse_data(&data_on_zero).unwrap_err().code(), ErrorCode::ProtocolError);

        let ping_on_stream = Frame::new(FrameType::Ping, FrameFlags::empty(), 1, Bytes::from(vec![0; 8]));
        assert_eq!(FrameCodec::parse_ping(&ping_on_stream).unwrap_err().code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn test_parse_fixed_lengths() {
        let ping = Frame::new(FrameType::Ping, FrameFlags::empty(), 0, Bytes::from(vec![0; 7]));
        assert_eq!(FrameCodec::parse_ping(&ping).unwrap_err().code(), ErrorCode::FrameSizeError);

        let rst = Frame::new(FrameType::RstStream, FrameFlags::empty(), 1, Bytes::from(vec![0; 3]));
        assert_eq!(FrameCodec::parse_rst_stream(&rst).unwrap_err().code(), ErrorCode::FrameSizeError);

        let priority = Frame::new(FrameType::Priority, FrameFlags::empty(), 1, Bytes::from(vec![0; 4]));
        let err = FrameCodec::parse_priority(&priority).unwrap_err();
        assert!(err.is_stream_error());
        assert_eq!(err.code(), ErrorCode::FrameSizeError);

        let ack = Frame::new(FrameType::Settings, FrameFlags::from_u8(FrameFlags::ACK), 0, Bytes::from(vec![0; 6]));
        assert_eq!(FrameCodec::parse_settings(&ack).unwrap_err().code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn test_settings_frame() {
        let settings = SettingsBuilder::new()
            .header_table_size(8192)
            .enable_push(false)
            .initial_window_size(65535)
            .build()
            .unwrap();

        let encoded = FrameCodec::encode_settings_frame(&SettingsFrame::new(settings.clone()));
        assert_eq!(encoded[0..3], [0, 0, 18]);
        assert_eq!(&encoded[5..9], &[0, 0, 0, 0]);

        let mut buf = BytesMut::from(&encoded[..]);
        let frame = FrameCodec::decode(&mut buf, 16384).unwrap().unwrap();
        let parsed = FrameCodec::parse_settings(&frame).unwrap();
        assert!(!parsed.ack);
        assert_eq!(parsed.settings, settings);
    }

    #[test]
    fn test_goaway_frame() {
        let goaway = GoawayFrame::new(7, ErrorCode::CompressionError, Bytes::from("bad index"));
        let mut buf = BytesMut::from(&FrameCodec::encode_goaway_frame(&goaway)[..]);
        let frame = FrameCodec::decode(&mut buf, 16384).unwrap().unwrap();

        let parsed = FrameCodec::parse_goaway(&frame).unwrap();
        assert_eq!(parsed.last_stream_id, 7);
        assert_eq!(parsed.error_code, ErrorCode::CompressionError);
        assert_eq!(parsed.debug_data, Bytes::from("bad index"));
    }

    #[test]
    fn test_window_update_frame() {
        let encoded = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(42, 1000));
        assert_eq!(encoded[0..3], [0, 0, 4]);
        assert_eq!(&encoded[5..9], &[0, 0, 0, 42]);

        let mut buf = BytesMut::from(&encoded[..]);
        let frame = FrameCodec::decode(&mut buf, 16384).unwrap().unwrap();
        let parsed = FrameCodec::parse_window_update(&frame).unwrap();
        assert_eq!(parsed.stream_id, 42);
        assert_eq!(parsed.size_increment, 1000);
    }
}

//! HTTP/2 settings (RFC 7540 Section 6.5)
//!
//! A [`Settings`] value only holds the parameters that were actually sent;
//! getters fall back to the protocol defaults. The same payload format is
//! used by SETTINGS frames and by the base64url `HTTP2-Settings` header of an
//! h2c upgrade request.

use super::error::{Error, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use base64ct::{Base64UrlUnpadded, Encoding};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Largest legal flow-control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Largest legal SETTINGS_MAX_FRAME_SIZE (2^24 - 1)
pub const MAX_MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// Maximum size of the sender's HPACK decoding table
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    /// Initial window size for stream-level flow control
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender is willing to receive
    MaxFrameSize = 0x5,
    /// Advisory limit on the uncompressed header list size
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,

    /// Enable server push (default: true)
    pub enable_push: Option<bool>,

    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,

    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,

    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// `None` means unlimited
    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// `None` means unlimited
    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Validate settings values
    ///
    /// An oversized initial window is a FLOW_CONTROL_ERROR; any other bad
    /// value is a PROTOCOL_ERROR (RFC 7540 Section 6.5.2).
    pub fn validate(&self) -> Result<()> {
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > MAX_WINDOW_SIZE {
                return Err(Error::FlowControl(format!(
                    "Initial window size {} exceeds maximum (2^31-1)",
                    initial_window_size
                )));
            }
        }

        if let Some(max_frame_size) = self.max_frame_size {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&max_frame_size) {
                return Err(Error::InvalidSettings(format!(
                    "Max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        if other.header_table_size.is_some() {
            self.header_table_size = other.header_table_size;
        }
        if other.enable_push.is_some() {
            self.enable_push = other.enable_push;
        }
        if other.max_concurrent_streams.is_some() {
            self.max_concurrent_streams = other.max_concurrent_streams;
        }
        if other.initial_window_size.is_some() {
            self.initial_window_size = other.initial_window_size;
        }
        if other.max_frame_size.is_some() {
            self.max_frame_size = other.max_frame_size;
        }
        if other.max_header_list_size.is_some() {
            self.max_header_list_size = other.max_header_list_size;
        }
    }

    /// Serialize as a SETTINGS payload: 6 octets per parameter present
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(36);
        let mut put = |param: SettingsParameter, value: u32| {
            buf.put_u16(param.as_u16());
            buf.put_u32(value);
        };

        if let Some(val) = self.header_table_size {
            put(SettingsParameter::HeaderTableSize, val);
        }
        if let Some(val) = self.enable_push {
            put(SettingsParameter::EnablePush, u32::from(val));
        }
        if let Some(val) = self.max_concurrent_streams {
            put(SettingsParameter::MaxConcurrentStreams, val);
        }
        if let Some(val) = self.initial_window_size {
            put(SettingsParameter::InitialWindowSize, val);
        }
        if let Some(val) = self.max_frame_size {
            put(SettingsParameter::MaxFrameSize, val);
        }
        if let Some(val) = self.max_header_list_size {
            put(SettingsParameter::MaxHeaderListSize, val);
        }

        buf.freeze()
    }

    /// Parse and validate a SETTINGS payload
    ///
    /// Unknown parameters are ignored; when a parameter repeats, the last
    /// value wins.
    pub fn decode_payload(payload: &[u8]) -> Result<Settings> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);

            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => settings.header_table_size = Some(value),
                Some(SettingsParameter::EnablePush) => {
                    settings.enable_push = Some(match value {
                        0 => false,
                        1 => true,
                        _ => {
                            return Err(Error::InvalidSettings(format!(
                                "ENABLE_PUSH must be 0 or 1, got {}",
                                value
                            )))
                        }
                    })
                }
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                None => {}
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Decode the value of an `HTTP2-Settings` upgrade header
    ///
    /// The value is base64url without padding (RFC 7540 Section 3.2.1);
    /// trailing `=` padding is tolerated.
    pub fn from_http2_settings_header(value: &str) -> Result<Settings> {
        let trimmed = value.trim().trim_end_matches('=');
        let payload = Base64UrlUnpadded::decode_vec(trimmed).map_err(|e| {
            Error::InvalidSettings(format!("HTTP2-Settings is not base64url: {}", e))
        })?;
        Settings::decode_payload(&payload)
    }

    /// Encode as the value of an `HTTP2-Settings` upgrade header
    pub fn to_http2_settings_header(&self) -> String {
        Base64UrlUnpadded::encode_string(&self.encode_payload())
    }
}

/// Builder for HTTP/2 settings
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

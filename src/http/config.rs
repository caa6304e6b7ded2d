//! Server configuration
//!
//! [`ServerConfig`] is shared by every connection a listener accepts. Build
//! one with [`ServerConfigBuilder`]; the defaults suit a small h2c server.

use super::h2::settings::{Settings, SettingsBuilder};
use super::h2::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use super::parser::{DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEAD_SIZE};
use super::{Error, Result};
use std::time::Duration;

/// Default SETTINGS_MAX_CONCURRENT_STREAMS we advertise
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Which client behaviors a listener accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServeMode {
    /// Legacy HTTP/1.1, the h2c upgrade and prior knowledge on one port
    #[default]
    Auto,
    /// Only connections that open with the HTTP/2 preface
    PriorKnowledgeOnly,
}

/// Connection-level configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SETTINGS sent at the start of every framed connection
    pub settings: Settings,
    pub mode: ServeMode,
    /// Close a connection with no open streams after this long without traffic
    pub idle_timeout: Duration,
    /// Reset a framed stream, or fail a legacy handler call, after this long
    pub stream_timeout: Duration,
    /// How often a framed read loop wakes up to check timers
    pub poll_interval: Duration,
    pub max_head_size: usize,
    pub max_body_size: usize,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            settings: default_settings(),
            mode: ServeMode::Auto,
            idle_timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(200),
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

fn default_settings() -> Settings {
    Settings {
        header_table_size: Some(DEFAULT_HEADER_TABLE_SIZE),
        enable_push: Some(false),
        max_concurrent_streams: Some(DEFAULT_MAX_CONCURRENT_STREAMS),
        initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE),
        max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
        max_header_list_size: None,
    }
}

/// Builder for [`ServerConfig`]
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
    settings: SettingsBuilder,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        ServerConfigBuilder::default()
    }

    pub fn mode(mut self, mode: ServeMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings = self.settings.max_concurrent_streams(max);
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

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings = self.settings.header_table_size(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings = self.settings.max_header_list_size(size);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn max_head_size(mut self, size: usize) -> Self {
        self.config.max_head_size = size;
        self
    }

    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Build the configuration, validating the SETTINGS values
    pub fn build(self) -> Result<ServerConfig> {
        let overrides = self.settings.build().map_err(Error::from)?;
        let mut config = self.config;
        config.settings.merge(&overrides);

        if config.poll_interval.is_zero() {
            return Err(Error::Protocol("poll interval must be non-zero".to_string()));
        }
        Ok(config)
    }
}

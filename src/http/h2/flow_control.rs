//! HTTP/2 flow control (RFC 7540 Section 5.2)
//!
//! A [`FlowControlWindow`] is used on both sides of a connection. The read
//! loop keeps receive windows (the credit we granted the peer) for the
//! connection and every stream; the writer keeps send windows (the credit the
//! peer granted us).

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Flow control window
///
/// The current size may go negative when SETTINGS_INITIAL_WINDOW_SIZE shrinks
/// while data is in flight.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    current_size: i64,
}

impl FlowControlWindow {
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Octets that may be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Take up to `amount` octets of send credit
    ///
    /// Returns how much was granted, possibly zero. Running out of credit is
    /// not an error; the sender waits for WINDOW_UPDATE.
    pub fn consume(&mut self, amount: usize) -> usize {
        let granted = amount.min(self.available());
        self.current_size -= granted as i64;
        granted
    }

    /// Account for `amount` octets received from the peer
    ///
    /// Receiving more than the window allows is a FLOW_CONTROL_ERROR; the
    /// caller decides whether it is a stream or connection error.
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.current_size {
            return Err(Error::FlowControl(format!(
                "received {} bytes with only {} available",
                amount, self.current_size
            )));
        }
        self.current_size -= amount as i64;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE increment
    ///
    /// A zero increment is a PROTOCOL_ERROR and growing past 2^31-1 a
    /// FLOW_CONTROL_ERROR (RFC 7540 Section 6.9).
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol(
                "WINDOW_UPDATE increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE
    ///
    /// The difference from the old initial size is added to the current
    /// window (RFC 7540 Section 6.9.2).
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }

    /// Increment to advertise once the window has dropped below half its
    /// initial size, which brings it back to the initial size
    pub fn should_send_window_update(&self) -> Option<u32> {
        let initial = self.initial_size as i64;
        if self.current_size < initial / 2 {
            Some((initial - self.current_size) as u32)
        } else {
            None
        }
    }

    /// Record credit we just granted with WINDOW_UPDATE
    pub fn release(&mut self, increment: u32) {
        self.current_size += increment as i64;
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

//! Transport session abstraction
//!
//! Connection drivers only see [`SessionOps`]: poll, read, write, close and
//! clone. Plain TCP is provided by [`TcpSession`]. A TLS transport would slot
//! in as another implementation reporting `is_secure() == true`.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Operations a connection driver needs from its transport
pub trait SessionOps: Send + 'static {
    /// Wait until the session is ready for `events`
    ///
    /// Returns false if `timeout` expired first. `None` waits forever.
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data; `Ok(0)` means the peer closed its side
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Shut down both directions of the transport
    fn close(&mut self) -> Result<()>;

    /// Another handle on the same transport, used as a dedicated write half
    fn try_clone(&self) -> Result<Self>
    where
        Self: Sized;

    /// Whether the transport is encrypted
    fn is_secure(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// A transport plus the timeout applied to blocking reads and writes
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Set the timeout for reads and writes; `None` blocks indefinitely
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Wait up to `timeout` for readable data, without reading it
    pub fn poll_read(&self, timeout: Option<Duration>) -> Result<bool> {
        self.session.poll(PollEvents::Read, timeout)
    }

    /// Read with the session timeout
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }

        self.session.read(buf)
    }

    /// Read and append to `buffer`; returns 0 on end of stream
    pub fn read_into(&mut self, buffer: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = [0u8; 8192];
        let n = self.read(&mut chunk)?;
        buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Write with the session timeout
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Write, self.timeout)? {
            return Err(Error::Timeout);
        }

        self.session.write(buf)
    }

    /// Write the whole buffer, polling between partial writes
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(Error::ConnectionClosed),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// A second session on the same transport, with the same timeout
    pub fn try_clone(&self) -> Result<Self> {
        Ok(HttpSession {
            session: self.session.try_clone()?,
            timeout: self.timeout,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.session.is_secure()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.peer_addr()
    }
}

/// Plain TCP session
pub struct TcpSession {
    stream: TcpStream,
}

impl TcpSession {
    pub fn new(stream: TcpStream) -> Self {
        TcpSession { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for TcpSession {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        use libc::{poll, pollfd, POLLIN, POLLOUT};

        let mut pfd = pollfd {
            fd: self.stream.as_raw_fd(),
            events: match events {
                PollEvents::Read => POLLIN,
                PollEvents::Write => POLLOUT,
                PollEvents::Both => POLLIN | POLLOUT,
            },
            revents: 0,
        };

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1); // -1 = infinite

        // SAFETY: pfd is a valid pollfd for the duration of the call
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }

        // POLLHUP/POLLERR count as ready so the following read reports them
        Ok(result > 0)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(TcpSession {
            stream: self.stream.try_clone()?,
        })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

/// Wrap an accepted TCP stream in a session
pub fn from_tcp_stream(stream: TcpStream) -> HttpSession<TcpSession> {
    HttpSession::new(TcpSession::new(stream))
}

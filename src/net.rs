//! TCP listener
//!
//! Binds the listening socket with `socket2` and serves every accepted
//! connection on a thread of its own. Connections share the handler and the
//! configuration and nothing else.

use crate::http::config::ServerConfig;
use crate::http::driver::Connection;
use crate::http::handler::Handler;
use crate::http::session::from_tcp_stream;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

/// Pending connection queue length passed to listen(2)
pub const LISTEN_BACKLOG: i32 = 1024;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network setup errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot resolve address: {0}")]
    Resolve(String),

    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Listening socket serving h2c and HTTP/1.1
pub struct Listener {
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
}

impl Listener {
    /// Bind `addr` with SO_REUSEADDR
    ///
    /// Every address `addr` resolves to is tried in turn; the first one that
    /// binds wins.
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        handler: Arc<dyn Handler>,
        config: ServerConfig,
    ) -> Result<Self> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match bind_socket(addr) {
                Ok(listener) => {
                    tracing::info!(%addr, mode = ?config.mode, "listening");
                    return Ok(Listener {
                        listener,
                        handler,
                        config,
                    });
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Resolve("no addresses".to_string())))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever
    ///
    /// Failed accepts are logged and skipped; only a failure to spawn a
    /// connection thread ends the loop.
    pub fn serve(&self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_connection(stream, peer)?,
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %err, "cannot set TCP_NODELAY");
        }
        tracing::debug!(%peer, "accepted connection");

        let connection = Connection::new(
            from_tcp_stream(stream),
            Arc::clone(&self.handler),
            self.config.clone(),
        );
        thread::Builder::new()
            .name(format!("conn-{}", peer))
            .spawn(move || match connection.serve() {
                Ok(mode) => tracing::debug!(%peer, %mode, "connection closed"),
                Err(err) => tracing::info!(%peer, error = %err, "connection failed"),
            })?;
        Ok(())
    }
}

fn bind_socket(addr: SocketAddr) -> Result<TcpListener> {
    let bind = |source| Error::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind)?;
    socket.set_reuse_address(true).map_err(bind)?;
    socket.bind(&addr.into()).map_err(bind)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind)?;
    Ok(socket.into())
}

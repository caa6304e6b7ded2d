//! h2c-server - cleartext HTTP/1.1 and HTTP/2 on a single listening port
//!
//! Every accepted connection is classified from its first bytes as plain
//! HTTP/1.1, an HTTP/1.1 `Upgrade: h2c` handshake, or HTTP/2 with prior
//! knowledge, and is then served by the matching connection driver. The
//! application plugs in through the [`http::Handler`] trait, which sees the
//! same request/response types in every mode.

pub mod http;
pub mod net;

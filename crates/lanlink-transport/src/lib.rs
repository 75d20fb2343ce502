//! Transport abstraction layer for lanlink.
//!
//! Provides the [`Transport`], [`Connector`] and [`Connection`] traits that
//! the session protocol is written against, plus the TCP implementation
//! used on every desktop target.
//!
//! The capability set is deliberately small: listen/accept on the host side,
//! connect on the peer side, and send/receive/close on a connection. Bytes
//! are delivered exactly as the stream hands them over, so a single
//! [`Connection::recv`] may carry a fraction of a frame or several frames
//! back-to-back. Reassembly is the protocol layer's job.

mod error;
mod tcp;

pub use error::TransportError;
pub use tcp::{TcpConnection, TcpConnector, TcpTransport};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
///
/// The returned futures are `Send` so the host can drive them from
/// spawned Tokio tasks without knowing the concrete transport.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &self,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Returns the address the transport is listening on.
    fn local_addr(&self) -> std::io::Result<SocketAddr>;

    /// Stops accepting new connections and releases the listening endpoint,
    /// so later connection attempts are refused. Already accepted
    /// connections are unaffected.
    fn shutdown(&self);
}

/// Opens outbound connections to a host.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Connection: Connection;

    /// Connects to `addr` (`host:port`).
    fn connect(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// A single connection that can send and receive bytes.
pub trait Connection: Send + Sync + 'static {
    /// Writes all of `data` to the remote peer.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next chunk of bytes from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed, either by
    /// the remote side or by a local call to [`close`](Self::close).
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection. Calling this more than once is harmless.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}

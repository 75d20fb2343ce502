//! TCP transport implementation on top of `tokio::net`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};

use crate::{Connection, ConnectionId, Connector, Transport, TransportError};

/// Size of the buffer handed to each socket read.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A TCP [`Transport`] that listens for incoming connections.
///
/// [`shutdown`](Transport::shutdown) drops the listener, so the port stops
/// accepting at the socket level once any in-flight `accept` has returned
/// or been cancelled.
pub struct TcpTransport {
    listener: std::sync::Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    next_id: AtomicU64,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        let local_addr = listener.local_addr().map_err(TransportError::AcceptFailed)?;
        tracing::info!(%local_addr, "TCP transport listening");
        Ok(Self {
            listener: std::sync::Mutex::new(Some(Arc::new(listener))),
            local_addr,
            next_id: AtomicU64::new(1),
        })
    }

    fn listener(&self) -> Option<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn accept(&self) -> Result<Self::Connection, TransportError> {
        let listener = self.listener().ok_or(TransportError::Shutdown)?;
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, %addr, "accepted TCP connection");

        TcpConnection::from_stream(id, stream)
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn shutdown(&self) {
        let released = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            tracing::debug!(addr = %self.local_addr, "TCP listener released");
        }
    }
}

/// Opens outbound TCP connections.
#[derive(Debug)]
pub struct TcpConnector {
    next_id: AtomicU64,
}

impl TcpConnector {
    /// Creates a connector whose connections are numbered from 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    type Connection = TcpConnection;

    async fn connect(&self, addr: &str) -> Result<Self::Connection, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransportError::ConnectFailed)?;

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, addr, "opened TCP connection");

        TcpConnection::from_stream(id, stream)
    }
}

/// A single TCP connection.
///
/// The stream is split so that a pending [`recv`](Connection::recv) never
/// blocks a concurrent [`send`](Connection::send).
pub struct TcpConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl TcpConnection {
    fn from_stream(
        id: ConnectionId,
        stream: TcpStream,
    ) -> Result<Self, TransportError> {
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionClosed(e.to_string()))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| TransportError::ConnectionClosed(e.to_string()))?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed,
        })
    }

    /// Returns the remote address of this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Connection for TcpConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(
                "connection closed locally".into(),
            ));
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(TransportError::SendFailed)?;
        writer.flush().await.map_err(TransportError::SendFailed)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    tracing::trace!(id = %self.id, bytes = n, "received");
                    Ok(Some(buf))
                }
                Err(e) => Err(TransportError::ReceiveFailed(e)),
            },
            _ = closed.changed() => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        match self.writer.lock().await.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e)),
        }
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

//! The host's handle on one accepted connection.
//!
//! Writes never happen on the routing path. Each session owns an unbounded
//! outbound queue drained by a dedicated writer task, so a broadcast is a
//! loop of non-blocking pushes and a slow peer only delays itself.

use std::sync::Arc;

use lanlink_transport::{Connection, ConnectionId};
use tokio::sync::mpsc;

/// An encoded frame, shared between every session it is broadcast to.
pub(crate) type Frame = Arc<[u8]>;

/// Where a connection is in the identity handshake.
///
/// ```text
/// Unidentified ──NicknameAsk──→ Identified ──close──→ (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Unidentified,
    Identified,
}

/// One live connection on the host.
///
/// Dropping the session closes its queue; the writer flushes whatever is
/// still queued and then closes the connection.
pub(crate) struct Session {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Frame>,
    pub(crate) state: SessionState,
}

impl Session {
    /// Wraps `conn` and spawns its writer task.
    pub(crate) fn spawn<C: Connection>(conn: Arc<C>) -> Self {
        let id = conn.id();
        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(conn, rx));
        Self {
            id,
            outbound,
            state: SessionState::Unidentified,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_identified(&self) -> bool {
        self.state == SessionState::Identified
    }

    /// Queues a frame. Returns `false` if the writer has already stopped,
    /// in which case the receive loop is about to run the close path.
    pub(crate) fn push(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Drains `rx` into the connection until the queue closes or a write fails,
/// then closes the connection.
pub(crate) async fn write_loop<C, F>(conn: Arc<C>, mut rx: mpsc::UnboundedReceiver<F>)
where
    C: Connection,
    F: AsRef<[u8]> + Send + 'static,
{
    let conn_id = conn.id();
    while let Some(frame) = rx.recv().await {
        if let Err(e) = conn.send(frame.as_ref()).await {
            tracing::debug!(%conn_id, error = %e, "write failed, closing");
            break;
        }
        tracing::trace!(%conn_id, bytes = frame.as_ref().len(), "frame written");
    }
    if let Err(e) = conn.close().await {
        tracing::debug!(%conn_id, error = %e, "close failed");
    }
}

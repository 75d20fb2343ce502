//! Error types for the session layer.

use lanlink_protocol::PeerId;
use lanlink_transport::ConnectionId;

/// Errors that can occur while managing peer identities.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Every id in the configured range is taken. With the default range
    /// this means 255 peers are already connected.
    #[error("no free peer id (all {0} in use)")]
    Exhausted(usize),

    /// The connection already completed the handshake. Renaming mid-session
    /// is not supported.
    #[error("{0} is already identified")]
    AlreadyIdentified(ConnectionId),

    /// No live identity has this id.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

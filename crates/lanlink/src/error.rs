//! Unified error type for lanlink.

use lanlink_protocol::ProtocolError;
use lanlink_session::SessionError;
use lanlink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Host and peer APIs return this single type, and it is what `on_error`
/// subscribers receive. The `#[from]` attribute on each wrapper variant
/// lets `?` convert sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum LanError {
    /// A transport-level error (connect, send, recv, timeout).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (corrupt or oversize frame).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (identities exhausted).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// No peer with this nickname is known.
    #[error("no peer named {0:?}")]
    NotFound(String),

    /// The peer has no live connection to a host.
    #[error("not connected to a host")]
    NotConnected,

    /// The host has been stopped.
    #[error("host is not running")]
    NotRunning,

    /// Reconnection gave up after this many attempts.
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

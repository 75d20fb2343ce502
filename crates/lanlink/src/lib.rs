//! # lanlink
//!
//! Host/peer session layer for LAN multiplayer games.
//!
//! One process runs a [`Host`]; every player runs a [`Peer`] that connects
//! to it over TCP. The host hands each peer a small numeric id and a unique
//! nickname, keeps every peer's directory of who is connected in sync, and
//! relays traffic:
//!
//! | send call                  | reaches                          |
//! |----------------------------|----------------------------------|
//! | `Peer::send_to_server`     | the host                         |
//! | `Peer::send_to_all`        | the host and every other peer    |
//! | `Peer::send_to_client`     | the host and the named peer      |
//! | `Host::send_to_all`        | every peer                       |
//! | `Host::send_to_client`     | the named peer                   |
//!
//! Game code reacts through callbacks (`on_client_connect`,
//! `on_client_disconnect`, `on_receive`, `on_error`, and on peers
//! `on_lost_connection` / `on_reconnection_attempt`).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lanlink::prelude::*;
//!
//! # async fn run() -> Result<(), LanError> {
//! let host = Host::start(9000).await?;
//! host.on_receive(|msg| println!("{:?} says {:?}", msg.from_nickname, msg.payload));
//!
//! let peer = Peer::new("Alice");
//! peer.connect("127.0.0.1", 9000).await?;
//! peer.send_to_server("hello", 0)?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod events;
mod handler;
mod host;
mod peer;
mod reconnect;
mod session;

pub use config::{HostConfig, PeerConfig, ReconnectConfig};
pub use error::LanError;
pub use events::{Incoming, Subscribers};
pub use host::{Host, HostBuilder};
pub use peer::{Peer, PeerBuilder, PeerState};

pub use lanlink_protocol::{CodecConfig, Message, Payload, PeerId, RoutingTag};
pub use lanlink_session::PeerDirectory;

/// Re-exports of the sub-crates, for custom transports and tooling.
pub mod transport {
    pub use lanlink_transport::*;
}

pub mod protocol {
    pub use lanlink_protocol::*;
}

pub mod prelude {
    pub use crate::{
        CodecConfig, Host, HostBuilder, HostConfig, Incoming, LanError, Payload, Peer,
        PeerBuilder, PeerConfig, PeerDirectory, PeerId, PeerState, ReconnectConfig, RoutingTag,
    };
}

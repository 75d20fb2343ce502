//! Peer identity bookkeeping for lanlink.
//!
//! Two views of "who is connected":
//!
//! 1. **[`IdentityRegistry`]**: the host's authoritative table. It hands
//!    out ids and nicknames, keeps both unique, and frees them again when a
//!    connection closes.
//! 2. **[`PeerDirectory`]**: the id → nickname mirror every peer keeps,
//!    fed by the host's `Nickname` and `Disconnect` broadcasts.
//!
//! # How it fits in the stack
//!
//! ```text
//! Host / Peer (above)  ← consults identities to route and label traffic
//!     ↕
//! Session Layer (this crate)
//!     ↕
//! Protocol + Transport (below)  ← provide PeerId and ConnectionId
//! ```

mod directory;
mod error;
mod registry;

pub use directory::PeerDirectory;
pub use error::SessionError;
pub use registry::{DEFAULT_NICKNAME, Identity, IdentityRegistry, MAX_PEERS};

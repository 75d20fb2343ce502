//! Wire protocol for lanlink.
//!
//! This crate defines what host and peers say to each other:
//!
//! - **Types** ([`Message`], [`RoutingTag`], [`PeerId`], [`Payload`]):
//!   the values that travel on the wire.
//! - **Codec** ([`WireCodec`], [`FrameBuffer`]): how a message becomes a
//!   compressed, length-prefixed frame and how frames are cut back out of a
//!   byte stream.
//! - **Errors** ([`ProtocolError`]).
//!
//! It knows nothing about sockets; the transport hands it bytes.
//!
//! ```text
//! Transport (bytes) → Protocol (Message) → Host / Peer routing
//! ```

mod codec;
mod error;
mod types;

pub use codec::{CodecConfig, FrameBuffer, LENGTH_PREFIX_SIZE, WireCodec};
pub use error::ProtocolError;
pub use types::{Message, Payload, PeerId, RoutingTag};

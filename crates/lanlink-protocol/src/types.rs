//! Core protocol types for the lanlink wire format.
//!
//! Every [`Message`] travels as one frame. The protocol layer only looks at
//! the addressing fields (`from_id`, `to_id`) and the [`RoutingTag`]; the
//! application tag and the text/binary payload are opaque and passed through
//! untouched.

use serde::{Deserialize, Serialize};

use std::fmt;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The numeric identity the host assigns to a peer.
///
/// One byte on the wire, so at most 255 peers can be live at once.
/// [`PeerId::HOST`] (0) is reserved for the host itself and, depending on
/// the routing tag, also means "everyone".
///
/// `#[serde(transparent)]` keeps it a plain number in any serde format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub u8);

impl PeerId {
    /// The host, or "nobody in particular" for broadcasts.
    pub const HOST: PeerId = PeerId(0);

    /// Returns `true` for the reserved host id.
    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "host")
        } else {
            write!(f, "peer-{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// RoutingTag
// ---------------------------------------------------------------------------

/// Selects how a message is distributed.
///
/// The discriminants are the byte written on the wire, so the order of the
/// variants is part of the protocol and must never change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum RoutingTag {
    /// Peer → host: "I'd like this nickname." `value` carries the request.
    NicknameAsk = 0,
    /// Host → new peer: "This is your id." `to_id` is the assigned id.
    Id = 1,
    /// Host → everyone: "`to_id` is called `value`."
    Nickname = 2,
    /// Host → everyone: "the peer whose id is in `value` has left."
    Disconnect = 3,
    /// Peer → host only.
    ClientToServer = 4,
    /// Peer → every peer, relayed by the host.
    ClientToAll = 5,
    /// Peer → the peer named by `to_id`, relayed by the host.
    ClientToClient = 6,
    /// Host → every peer.
    ServerToAll = 7,
    /// Host → the peer named by `to_id`.
    ServerToClient = 8,
}

impl RoutingTag {
    /// Every tag, in wire order.
    pub const ALL: [RoutingTag; 9] = [
        RoutingTag::NicknameAsk,
        RoutingTag::Id,
        RoutingTag::Nickname,
        RoutingTag::Disconnect,
        RoutingTag::ClientToServer,
        RoutingTag::ClientToAll,
        RoutingTag::ClientToClient,
        RoutingTag::ServerToAll,
        RoutingTag::ServerToClient,
    ];

    /// Returns the byte written on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns `true` for the handshake/bookkeeping tags the core consumes
    /// itself, as opposed to application traffic.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            RoutingTag::NicknameAsk
                | RoutingTag::Id
                | RoutingTag::Nickname
                | RoutingTag::Disconnect
        )
    }
}

impl TryFrom<u8> for RoutingTag {
    type Error = u8;

    /// Converts a wire byte back into a tag, handing back the byte if it
    /// names no tag.
    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(usize::from(byte)).copied().ok_or(byte)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// What an application sends: either UTF-8 text or raw bytes.
///
/// On the wire these are the `value` and `data` fields of a [`Message`].
/// The `From` impls let every send call accept `"text"`, a `String`, a
/// `Vec<u8>` or a byte slice directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Carried in the message's `value` field.
    Text(String),
    /// Carried in the message's `data` field.
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns the text, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    /// Returns the bytes, if this is a binary payload.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Text(_) => None,
            Payload::Binary(bytes) => Some(bytes),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Binary(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One protocol message. Every frame on the wire carries exactly one.
///
/// ```text
/// ┌──────────┬────────┬─────────────┬─────────┬──────────────┬──────────────┐
/// │ from_id  │ to_id  │ routing_tag │ app_tag │ value (text) │ data (bytes) │
/// └──────────┴────────┴─────────────┴─────────┴──────────────┴──────────────┘
/// ```
///
/// A message is a value: it is built once with [`Message::new`] and the
/// `with_*` methods, then only read. An empty `value`/`data` and an absent
/// one are the same thing on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    from_id: PeerId,
    to_id: PeerId,
    routing_tag: RoutingTag,
    app_tag: u8,
    value: String,
    data: Vec<u8>,
}

impl Message {
    /// Starts a message with no application tag and no payload.
    pub fn new(routing_tag: RoutingTag, from_id: PeerId, to_id: PeerId) -> Self {
        Self {
            from_id,
            to_id,
            routing_tag,
            app_tag: 0,
            value: String::new(),
            data: Vec::new(),
        }
    }

    /// Sets the opaque application sub-category.
    pub fn with_app_tag(mut self, app_tag: u8) -> Self {
        self.app_tag = app_tag;
        self
    }

    /// Sets the text payload.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    /// Sets the binary payload.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Places `payload` in the matching field.
    pub fn with_payload(self, payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => self.with_value(text),
            Payload::Binary(bytes) => self.with_data(bytes),
        }
    }

    /// Sender id; [`PeerId::HOST`] when the host sent it.
    pub fn from_id(&self) -> PeerId {
        self.from_id
    }

    /// Addressee id; its meaning depends on [`routing_tag`](Self::routing_tag).
    pub fn to_id(&self) -> PeerId {
        self.to_id
    }

    /// How the message is distributed.
    pub fn routing_tag(&self) -> RoutingTag {
        self.routing_tag
    }

    /// Application sub-category, never interpreted here.
    pub fn app_tag(&self) -> u8 {
        self.app_tag
    }

    /// Text payload (empty if none).
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Binary payload (empty if none).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The payload as the application sees it: binary when `data` is set,
    /// text otherwise.
    ///
    /// The wire format cannot tell an empty binary payload from an empty
    /// text one, so an empty [`Payload::Binary`] arrives as
    /// `Payload::Text("")`. A message built with both fields set yields
    /// only `data`; use [`value`](Self::value) to read the text as well.
    pub fn payload(&self) -> Payload {
        if self.data.is_empty() {
            Payload::Text(self.value.clone())
        } else {
            Payload::Binary(self.data.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_serializes_as_plain_number() {
        let json = serde_json::to_string(&PeerId(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId(7).to_string(), "peer-7");
        assert_eq!(PeerId::HOST.to_string(), "host");
    }

    #[test]
    fn test_routing_tag_wire_bytes_follow_declaration_order() {
        for (index, tag) in RoutingTag::ALL.iter().enumerate() {
            assert_eq!(usize::from(tag.as_byte()), index);
            assert_eq!(RoutingTag::try_from(tag.as_byte()), Ok(*tag));
        }
    }

    #[test]
    fn test_routing_tag_unknown_byte_is_rejected() {
        assert_eq!(RoutingTag::try_from(9), Err(9));
        assert_eq!(RoutingTag::try_from(255), Err(255));
    }

    #[test]
    fn test_routing_tag_control_tags() {
        assert!(RoutingTag::NicknameAsk.is_control());
        assert!(RoutingTag::Disconnect.is_control());
        assert!(!RoutingTag::ClientToAll.is_control());
        assert!(!RoutingTag::ServerToClient.is_control());
    }

    #[test]
    fn test_message_defaults_to_empty_payload() {
        let msg = Message::new(RoutingTag::ClientToServer, PeerId(1), PeerId::HOST);
        assert_eq!(msg.app_tag(), 0);
        assert_eq!(msg.value(), "");
        assert!(msg.data().is_empty());
        assert_eq!(msg.payload(), Payload::Text(String::new()));
    }

    #[test]
    fn test_message_payload_prefers_non_empty_data() {
        let both = Message::new(RoutingTag::ClientToAll, PeerId(1), PeerId::HOST)
            .with_value("caption")
            .with_data(vec![9]);
        assert_eq!(both.payload(), Payload::Binary(vec![9]));
        assert_eq!(both.value(), "caption");

        let empty = Message::new(RoutingTag::ClientToAll, PeerId(1), PeerId::HOST)
            .with_payload(Payload::Binary(Vec::new()));
        assert_eq!(empty.payload(), Payload::Text(String::new()));
    }

    #[test]
    fn test_message_with_payload_routes_to_matching_field() {
        let text = Message::new(RoutingTag::ClientToAll, PeerId(1), PeerId::HOST)
            .with_payload("hi".into());
        assert_eq!(text.value(), "hi");
        assert!(text.data().is_empty());

        let bytes = Message::new(RoutingTag::ClientToAll, PeerId(1), PeerId::HOST)
            .with_payload(vec![1u8, 2, 3].into());
        assert_eq!(bytes.value(), "");
        assert_eq!(bytes.payload(), Payload::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn test_payload_accessors() {
        let text = Payload::from("hello");
        assert_eq!(text.as_text(), Some("hello"));
        assert_eq!(text.as_bytes(), None);

        let bytes = Payload::from(&b"\x01\x02"[..]);
        assert_eq!(bytes.as_bytes(), Some(&[1u8, 2][..]));
        assert_eq!(bytes.as_text(), None);
    }
}

//! The host's identity registry: who is connected, under which id and name.
//!
//! # Concurrency note
//!
//! `IdentityRegistry` is NOT thread-safe by itself; it is a plain
//! `HashMap`. The host keeps it behind the same mutex as its live
//! connection set, so an assignment and the broadcasts announcing it can
//! never interleave with another connection's handshake or departure.

use std::collections::HashMap;

use lanlink_protocol::PeerId;
use lanlink_transport::ConnectionId;

use crate::SessionError;

/// Highest id the 1-byte id field can carry.
pub const MAX_PEERS: u8 = u8::MAX;

/// Nickname given to peers that ask for an empty one.
pub const DEFAULT_NICKNAME: &str = "Player";

/// One identified peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The transport connection this identity belongs to. Never leaves the
    /// host.
    pub connection: ConnectionId,
    /// Assigned id, unique among live identities, never [`PeerId::HOST`].
    pub id: PeerId,
    /// Assigned nickname, unique among live identities (case-sensitive).
    pub nickname: String,
}

/// Hands out peer ids and nicknames and keeps them unique.
///
/// ## Lifecycle
///
/// ```text
/// NicknameAsk ──→ assign() ──→ [live] ──→ release() / release_connection()
///                                │                      │
///                                ▼                      ▼
///                        lookups succeed       id + nickname reusable
/// ```
///
/// Lookups are linear scans. A LAN session has tens of peers at most and
/// the 1-byte id caps it at 255, so an index would cost more than it saves.
#[derive(Debug)]
pub struct IdentityRegistry {
    /// Live identities keyed by the connection that owns them.
    identities: HashMap<ConnectionId, Identity>,

    /// Ids are assigned from `1..=max_peers`.
    max_peers: u8,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegistry {
    /// Creates an empty registry using the full id range `1..=255`.
    pub fn new() -> Self {
        Self::with_max_peers(MAX_PEERS)
    }

    /// Creates an empty registry that assigns ids from `1..=max_peers`.
    pub fn with_max_peers(max_peers: u8) -> Self {
        Self {
            identities: HashMap::new(),
            max_peers,
        }
    }

    /// Identifies `connection`, giving it the lowest free id and a free
    /// nickname derived from `requested`.
    ///
    /// An empty request becomes [`DEFAULT_NICKNAME`]. A taken nickname gets
    /// a numeric suffix: `"Player"` → `"Player1"` → `"Player2"`, and an
    /// already suffixed `"Player3"` continues at `"Player4"`.
    ///
    /// # Errors
    /// - [`SessionError::AlreadyIdentified`]: the connection has an identity.
    /// - [`SessionError::Exhausted`]: no id left in the range.
    pub fn assign(
        &mut self,
        connection: ConnectionId,
        requested: &str,
    ) -> Result<Identity, SessionError> {
        if self.identities.contains_key(&connection) {
            return Err(SessionError::AlreadyIdentified(connection));
        }

        let id = (1..=self.max_peers)
            .map(PeerId)
            .find(|id| self.nickname_of(*id).is_none())
            .ok_or(SessionError::Exhausted(usize::from(self.max_peers)))?;

        let nickname = self.free_nickname(requested);
        let identity = Identity {
            connection,
            id,
            nickname,
        };
        self.identities.insert(connection, identity.clone());

        tracing::info!(%connection, peer_id = %id, nickname = %identity.nickname, "identity assigned");
        Ok(identity)
    }

    /// Frees the identity holding `id`, making the id and nickname
    /// available again.
    ///
    /// # Errors
    /// [`SessionError::UnknownPeer`] if no live identity has this id.
    pub fn release(&mut self, id: PeerId) -> Result<Identity, SessionError> {
        let connection = self
            .identities
            .values()
            .find(|identity| identity.id == id)
            .map(|identity| identity.connection)
            .ok_or(SessionError::UnknownPeer(id))?;
        self.release_connection(connection)
            .ok_or(SessionError::UnknownPeer(id))
    }

    /// Frees whatever identity `connection` holds. Returns `None` if the
    /// connection never completed the handshake.
    pub fn release_connection(&mut self, connection: ConnectionId) -> Option<Identity> {
        let identity = self.identities.remove(&connection)?;
        tracing::info!(%connection, peer_id = %identity.id, "identity released");
        Some(identity)
    }

    /// Returns the identity owned by `connection`, if any.
    pub fn identity_of(&self, connection: ConnectionId) -> Option<&Identity> {
        self.identities.get(&connection)
    }

    /// Returns the nickname of the peer with `id`.
    pub fn nickname_of(&self, id: PeerId) -> Option<&str> {
        self.identities
            .values()
            .find(|identity| identity.id == id)
            .map(|identity| identity.nickname.as_str())
    }

    /// Returns the id of the peer called `nickname`.
    pub fn id_of(&self, nickname: &str) -> Option<PeerId> {
        self.identities
            .values()
            .find(|identity| identity.nickname == nickname)
            .map(|identity| identity.id)
    }

    /// Snapshot of every live identity, ordered by id.
    pub fn identities(&self) -> Vec<Identity> {
        let mut all: Vec<Identity> = self.identities.values().cloned().collect();
        all.sort_by_key(|identity| identity.id);
        all
    }

    /// Number of live identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Returns `true` if nobody is identified.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Drops every identity.
    pub fn clear(&mut self) {
        self.identities.clear();
    }

    fn free_nickname(&self, requested: &str) -> String {
        let requested = if requested.trim().is_empty() {
            DEFAULT_NICKNAME
        } else {
            requested
        };
        if self.id_of(requested).is_none() {
            return requested.to_owned();
        }

        let (base, mut suffix) = split_numeric_suffix(requested);
        loop {
            let candidate = format!("{base}{suffix}");
            if self.id_of(&candidate).is_none() {
                return candidate;
            }
            suffix += 1;
        }
    }
}

/// Splits `"Player3"` into `("Player", 4)`: the base name and the first
/// suffix worth trying. Names without a usable suffix start at 1.
fn split_numeric_suffix(name: &str) -> (&str, u64) {
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    match name[base.len()..].parse::<u32>() {
        Ok(n) => (base, u64::from(n) + 1),
        Err(_) => (name, 1),
    }
}

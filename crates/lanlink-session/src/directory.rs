//! The id → nickname mirror each peer keeps.

use std::collections::BTreeMap;

use lanlink_protocol::PeerId;

/// Who the local side believes is connected.
///
/// Eventually consistent with the host's [`IdentityRegistry`]: every entry
/// arrives in a self-contained `Nickname` broadcast and leaves with a
/// `Disconnect` broadcast, so applying them in any interleaving converges.
/// The host itself (id 0) is implicit and never stored.
///
/// [`IdentityRegistry`]: crate::IdentityRegistry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDirectory {
    entries: BTreeMap<PeerId, String>,
}

impl PeerDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `id` is called `nickname`. Returns `true` if `id` was
    /// not known before, i.e. this is the first time we hear of the peer.
    pub fn upsert(&mut self, id: PeerId, nickname: impl Into<String>) -> bool {
        self.entries.insert(id, nickname.into()).is_none()
    }

    /// Forgets `id`, returning its nickname if it was known.
    pub fn remove(&mut self, id: PeerId) -> Option<String> {
        self.entries.remove(&id)
    }

    /// Returns the nickname for `id`.
    pub fn nickname(&self, id: PeerId) -> Option<&str> {
        self.entries.get(&id).map(String::as_str)
    }

    /// Returns the id of the peer called `nickname`.
    pub fn id_of(&self, nickname: &str) -> Option<PeerId> {
        self.entries
            .iter()
            .find(|(_, name)| name.as_str() == nickname)
            .map(|(id, _)| *id)
    }

    /// Returns `true` if `id` is known.
    pub fn contains(&self, id: PeerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Iterates entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &str)> {
        self.entries.iter().map(|(id, name)| (*id, name.as_str()))
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no peer is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets everyone.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_reports_first_sighting_only() {
        let mut dir = PeerDirectory::new();

        assert!(dir.upsert(PeerId(1), "Alice"));
        assert!(!dir.upsert(PeerId(1), "Alice"));
        assert!(!dir.upsert(PeerId(1), "Alicia"), "rename is not a new peer");
        assert_eq!(dir.nickname(PeerId(1)), Some("Alicia"));
    }

    #[test]
    fn test_remove_returns_nickname() {
        let mut dir = PeerDirectory::new();
        dir.upsert(PeerId(2), "Bob");

        assert_eq!(dir.remove(PeerId(2)).as_deref(), Some("Bob"));
        assert_eq!(dir.remove(PeerId(2)), None);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_id_of_resolves_nickname() {
        let mut dir = PeerDirectory::new();
        dir.upsert(PeerId(1), "Alice");
        dir.upsert(PeerId(2), "Bob");

        assert_eq!(dir.id_of("Bob"), Some(PeerId(2)));
        assert_eq!(dir.id_of("Carol"), None);
    }

    #[test]
    fn test_updates_in_any_order_converge() {
        let mut a = PeerDirectory::new();
        a.upsert(PeerId(1), "Alice");
        a.upsert(PeerId(2), "Bob");
        a.upsert(PeerId(3), "Carol");
        a.remove(PeerId(3));

        let mut b = PeerDirectory::new();
        b.upsert(PeerId(3), "Carol");
        b.upsert(PeerId(2), "Bob");
        b.remove(PeerId(3));
        b.upsert(PeerId(1), "Alice");

        assert_eq!(a, b);
        let entries: Vec<(PeerId, &str)> = a.iter().collect();
        assert_eq!(entries, [(PeerId(1), "Alice"), (PeerId(2), "Bob")]);
    }
}

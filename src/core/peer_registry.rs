//! Room membership registry: the peers currently sharing our room.
//!
//! Populated from relay announcements (`new-user`, `user-connection-reply`)
//! and pruned on `user-disconnected`. Purely in-memory; membership does not
//! outlive the relay session.

use std::collections::HashMap;
use tracing::debug;

/// What we know about one room member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Relay-assigned peer id.
    pub peer_id: String,
    /// Display name the peer advertised when joining.
    pub display_name: String,
    /// Avatar image bytes. Nothing on the wire carries these; a front end
    /// fills them in on its roster copies (generating them is its concern).
    pub avatar: Option<Vec<u8>>,
}

/// In-memory registry of the room's current members, keyed by peer id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a member. Re-announcing an existing id refreshes its name.
    pub fn add(&mut self, peer_id: &str, display_name: &str) {
        debug!(
            event = "peer_joined",
            peer_id = %peer_id,
            display_name = %display_name,
            "Peer added to room registry"
        );
        self.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                display_name: display_name.to_string(),
                avatar: None,
            },
        );
    }

    /// Drop a member. Returns the record if it was present.
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        let record = self.peers.remove(peer_id);
        if record.is_some() {
            debug!(
                event = "peer_left",
                peer_id = %peer_id,
                "Peer removed from room registry"
            );
        }
        record
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Display name for a peer, falling back to the raw id for unknown peers.
    pub fn display_name<'a>(&'a self, peer_id: &'a str) -> &'a str {
        self.peers
            .get(peer_id)
            .map(|p| p.display_name.as_str())
            .unwrap_or(peer_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_remove() {
        let mut reg = PeerRegistry::new();
        reg.add("p1", "alice");
        reg.add("p2", "bob");
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.display_name("p1"), "alice");

        let gone = reg.remove("p1");
        assert_eq!(gone.map(|p| p.display_name), Some("alice".to_string()));
        assert!(!reg.contains("p1"));
        assert!(reg.remove("p1").is_none());
    }

    #[test]
    fn readd_refreshes_display_name() {
        let mut reg = PeerRegistry::new();
        reg.add("p1", "alice");
        reg.add("p1", "alice-on-laptop");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.display_name("p1"), "alice-on-laptop");
    }

    #[test]
    fn unknown_peer_falls_back_to_id() {
        let reg = PeerRegistry::new();
        assert_eq!(reg.display_name("mystery"), "mystery");
    }

    #[test]
    fn roster_copies_take_avatars_without_touching_the_registry() {
        let mut reg = PeerRegistry::new();
        reg.add("p1", "alice");
        let mut roster: Vec<PeerRecord> = reg.all().cloned().collect();
        roster[0].avatar = Some(vec![1, 2, 3]);
        assert!(reg.get("p1").is_some_and(|p| p.avatar.is_none()));
    }
}

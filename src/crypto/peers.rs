//! Peer Key Table
//!
//! Maps peer usernames to the session key shared with them. Entries live
//! as long as the client session.

use std::collections::HashMap;

use super::session::SessionKey;

#[derive(Debug)]
struct PeerEntry {
    key: SessionKey,
    /// We generated this key in reply to the peer's public key
    initiated_locally: bool,
}

/// Session keys by peer username
#[derive(Debug)]
pub struct PeerKeyTable {
    own_username: String,
    entries: HashMap<String, PeerEntry>,
}

impl PeerKeyTable {
    pub fn new(own_username: impl Into<String>) -> Self {
        Self {
            own_username: own_username.into(),
            entries: HashMap::new(),
        }
    }

    /// Record a key we generated for `peer`. A fresh public key from a peer
    /// means a fresh session on their side, so this always replaces.
    pub fn insert_initiated(&mut self, peer: &str, key: SessionKey) {
        self.entries.insert(
            peer.to_string(),
            PeerEntry {
                key,
                initiated_locally: true,
            },
        );
    }

    /// Record a key `peer` wrapped for us. Returns false when the key is
    /// discarded because both sides initiated and ours wins: the key made
    /// by the lexicographically smaller username is kept on both ends.
    pub fn accept_remote(&mut self, peer: &str, key: SessionKey) -> bool {
        if let Some(existing) = self.entries.get(peer) {
            if existing.initiated_locally && self.own_username.as_str() < peer {
                return false;
            }
        }
        self.entries.insert(
            peer.to_string(),
            PeerEntry {
                key,
                initiated_locally: false,
            },
        );
        true
    }

    pub fn get(&self, peer: &str) -> Option<&SessionKey> {
        self.entries.get(peer).map(|entry| &entry.key)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.entries.contains_key(peer)
    }

    /// Peers with an established key, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.entries.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SessionKey)> {
        self.entries
            .iter()
            .map(|(peer, entry)| (peer.as_str(), &entry.key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

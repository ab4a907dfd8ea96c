//! Discovery Manager (spec §4.3): a topic-based peer registry.
//!
//! In a distributed deployment this would be a DHT client; the core's
//! contract requires only the operations below plus one ordering
//! guarantee: an `announce` must be visible to any subsequent `lookup` by
//! another participant. We model "the network" as a directory shared
//! (via `Arc`) between every `DiscoveryManager` instance constructed
//! against it, which is enough to test that guarantee in-process without
//! inventing a real transport.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use hyperforge_common::{sha256_hex, EventBus, EventBusExt, Unsubscribe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerAdded { topic: String, peer: PeerInfo },
    PeerRemoved { topic: String, peer: PeerInfo },
    LookupComplete { topic: String, peers: Vec<PeerInfo> },
}

/// Shared "network" state: which peers have announced on which topic
/// fingerprint. Construct one `TopicDirectory` per simulated network and
/// hand a clone of it to every participant's `DiscoveryManager`.
#[derive(Default)]
pub struct TopicDirectory {
    topics: RwLock<HashMap<String, Vec<PeerInfo>>>,
}

impl TopicDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Topics are hashed to a 32-char fingerprint (the first 16 bytes, i.e.
/// 32 hex chars, of `SHA-256(topic)`).
pub fn topic_fingerprint(topic: &str) -> String {
    let full = sha256_hex(&[topic.as_bytes()]);
    full[..32].to_string()
}

pub struct DiscoveryManager {
    self_peer: PeerInfo,
    directory: Arc<TopicDirectory>,
    events: Arc<EventBus<DiscoveryEvent>>,
}

impl DiscoveryManager {
    pub fn new(self_peer: PeerInfo, directory: Arc<TopicDirectory>) -> Self {
        Self {
            self_peer,
            directory,
            events: EventBus::new(),
        }
    }

    pub fn on(&self, handler: impl Fn(&DiscoveryEvent) + Send + Sync + 'static) -> Unsubscribe<DiscoveryEvent> {
        self.events.subscribe(handler)
    }

    pub fn announce(&self, topic: &str) {
        let fp = topic_fingerprint(topic);
        let mut guard = self.directory.topics.write().unwrap();
        let entry = guard.entry(fp.clone()).or_default();
        if !entry.iter().any(|p| p.peer_id == self.self_peer.peer_id) {
            entry.push(self.self_peer.clone());
        }
        drop(guard);
        self.events.emit(&DiscoveryEvent::PeerAdded {
            topic: topic.to_string(),
            peer: self.self_peer.clone(),
        });
    }

    pub fn leave(&self, topic: &str) {
        let fp = topic_fingerprint(topic);
        let mut guard = self.directory.topics.write().unwrap();
        if let Some(entry) = guard.get_mut(&fp) {
            entry.retain(|p| p.peer_id != self.self_peer.peer_id);
        }
        drop(guard);
        self.events.emit(&DiscoveryEvent::PeerRemoved {
            topic: topic.to_string(),
            peer: self.self_peer.clone(),
        });
    }

    /// Self is never returned in lookups.
    pub fn lookup(&self, topic: &str) -> Vec<PeerInfo> {
        let fp = topic_fingerprint(topic);
        let peers: Vec<PeerInfo> = self
            .directory
            .topics
            .read()
            .unwrap()
            .get(&fp)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.peer_id != self.self_peer.peer_id)
            .collect();
        self.events.emit(&DiscoveryEvent::LookupComplete {
            topic: topic.to_string(),
            peers: peers.clone(),
        });
        peers
    }

    pub fn get_peers(&self, topic: Option<&str>) -> Vec<PeerInfo> {
        match topic {
            Some(t) => self.lookup(t),
            None => {
                let guard = self.directory.topics.read().unwrap();
                let mut all: Vec<PeerInfo> = guard
                    .values()
                    .flatten()
                    .filter(|p| p.peer_id != self.self_peer.peer_id)
                    .cloned()
                    .collect();
                all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
                all.dedup_by(|a, b| a.peer_id == b.peer_id);
                all
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_is_visible_to_another_participants_lookup() {
        let net = TopicDirectory::new();
        let a = DiscoveryManager::new(
            PeerInfo {
                peer_id: "a".into(),
                address: "mem://a".into(),
            },
            net.clone(),
        );
        let b = DiscoveryManager::new(
            PeerInfo {
                peer_id: "b".into(),
                address: "mem://b".into(),
            },
            net.clone(),
        );

        a.announce("agent-memory");
        let seen_by_b = b.lookup("agent-memory");
        assert_eq!(seen_by_b.len(), 1);
        assert_eq!(seen_by_b[0].peer_id, "a");

        let seen_by_a = a.lookup("agent-memory");
        assert!(seen_by_a.is_empty(), "self must never be returned");
    }

    #[test]
    fn leave_removes_peer_from_subsequent_lookups() {
        let net = TopicDirectory::new();
        let a = DiscoveryManager::new(
            PeerInfo {
                peer_id: "a".into(),
                address: "mem://a".into(),
            },
            net.clone(),
        );
        let b = DiscoveryManager::new(
            PeerInfo {
                peer_id: "b".into(),
                address: "mem://b".into(),
            },
            net.clone(),
        );
        a.announce("topic");
        assert_eq!(b.lookup("topic").len(), 1);
        a.leave("topic");
        assert!(b.lookup("topic").is_empty());
    }

    #[test]
    fn fingerprint_is_32_hex_chars_and_stable() {
        let fp1 = topic_fingerprint("agent-memory");
        let fp2 = topic_fingerprint("agent-memory");
        assert_eq!(fp1.len(), 32);
        assert_eq!(fp1, fp2);
    }
}

//! Presence: online/offline tracking fanned out through `me` topics.
//!
//! Topic actors emit [`PresenceEvent`]s on subscriber-count transitions
//! and metadata changes; the hub's dispatcher delivers each event to the
//! live `me` topics of the addressed users, which update their peer
//! tables and forward `pres` frames to attached sessions.

use crate::types::{p2p_pair, Uid};
use std::collections::HashMap;

/// What changed about a peer topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceWhat {
    /// Peer came online (first session joined).
    On,
    /// Peer went offline (last session left).
    Off,
    /// Peer metadata changed.
    Upd,
    /// Peer topic was deleted.
    Gone,
    /// Access change requiring the recipient's attention.
    Acs,
}

impl PresenceWhat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceWhat::On => "on",
            PresenceWhat::Off => "off",
            PresenceWhat::Upd => "upd",
            PresenceWhat::Gone => "gone",
            PresenceWhat::Acs => "acs",
        }
    }
}

/// A notification emitted by a topic actor toward users' `me` topics.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    /// Users whose `me` topic should see this.
    pub to: Vec<Uid>,
    /// Canonical routing name of the topic the event is about.
    pub src: String,
    pub what: PresenceWhat,
    pub seq: Option<u64>,
    /// Ask the receiving `me` topic to echo its own online state back.
    /// Set on the initial `on` of an online transition so both sides of
    /// a p2p pair converge without polling.
    pub reply: bool,
}

/// Render a routing name the way a given viewer addresses it.
///
/// The viewer's own `me`/`fnd` routing names collapse back to their
/// aliases; p2p topics are addressed by the other party's user tag;
/// everything else keeps its canonical name.
#[must_use]
pub fn presentable_name(routing: &str, viewer: Uid) -> String {
    if routing == format!("usr{}", viewer.as_hex()) {
        return "me".to_string();
    }
    if routing == format!("fnd{}", viewer.as_hex()) {
        return "fnd".to_string();
    }
    if let Some((a, b)) = p2p_pair(routing) {
        let peer = if a == viewer { b } else { a };
        return peer.as_tag();
    }
    routing.to_string()
}

/// Last-known state of one peer topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerState {
    pub online: bool,
    pub touched: u64,
}

/// Peer topics known to one `me` topic.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerState>,
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an online-state change.
    ///
    /// Returns `true` when the state actually flipped.
    pub fn set_online(&mut self, src: impl Into<String>, online: bool, now: u64) -> bool {
        let state = self.peers.entry(src.into()).or_default();
        let changed = state.online != online;
        state.online = online;
        state.touched = now;
        changed
    }

    /// Bump a peer's activity timestamp.
    pub fn touch(&mut self, src: &str, now: u64) {
        if let Some(state) = self.peers.get_mut(src) {
            state.touched = now;
        }
    }

    pub fn remove(&mut self, src: &str) -> Option<PeerState> {
        self.peers.remove(src)
    }

    #[must_use]
    pub fn get(&self, src: &str) -> Option<&PeerState> {
        self.peers.get(src)
    }

    /// All known peer names, in no particular order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Snapshot ordered by most recent activity, online peers only.
    #[must_use]
    pub fn online_snapshot(&self) -> Vec<(String, PeerState)> {
        let mut all: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, s)| s.online)
            .map(|(k, s)| (k.clone(), *s))
            .collect();
        all.sort_by(|a, b| b.1.touched.cmp(&a.1.touched));
        all
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presentable_name() {
        let a = Uid::from_raw(0xA);
        let b = Uid::from_raw(0xB);

        assert_eq!(presentable_name("p2pa-b", a), "usrb");
        assert_eq!(presentable_name("p2pa-b", b), "usra");
        assert_eq!(presentable_name("grpx1", a), "grpx1");
        assert_eq!(presentable_name("usra", a), "me");
        assert_eq!(presentable_name("usra", b), "usra");
        assert_eq!(presentable_name("fnda", a), "fnd");
    }

    #[test]
    fn test_peer_table_transitions() {
        let mut table = PeerTable::new();

        assert!(table.set_online("grpx", true, 1));
        assert!(!table.set_online("grpx", true, 2));
        assert!(table.set_online("grpx", false, 3));
        assert!(!table.get("grpx").unwrap().online);
    }

    #[test]
    fn test_online_snapshot_ordering() {
        let mut table = PeerTable::new();
        table.set_online("grpa", true, 10);
        table.set_online("grpb", true, 30);
        table.set_online("grpc", true, 20);
        table.set_online("grpd", false, 99);

        let snap = table.online_snapshot();
        let names: Vec<_> = snap.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["grpb", "grpc", "grpa"]);
    }
}

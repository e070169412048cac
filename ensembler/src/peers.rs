use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::protocol::PeerRole;
use crate::realization::Iens;

/// Liveness and attribution record for one connected peer.
#[derive(Clone, Debug)]
pub struct PeerState {
    pub role: PeerRole,
    /// Fresh for every CONNECT, so log lines of successive sessions of the
    /// same identity can be told apart.
    pub session: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_seen: Instant,
    /// Realizations this peer has reported step events for.
    pub realizations: BTreeSet<Iens>,
    /// Highest event sequence number acknowledged by this peer, for monitors.
    pub last_acked: Option<u64>,
    /// Highest event sequence number applied in this session.
    pub last_applied: Option<u64>,
}

/// A peer whose heartbeat lapsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiredPeer {
    pub identity: String,
    pub role: PeerRole,
    pub realizations: BTreeSet<Iens>,
}

/// Connected peers, their liveness and the last event sequence applied per
/// session.
///
/// Sequence numbers are scoped to a session: every `CONNECT` starts a fresh
/// count, so a resubmitted worker reusing its identity is applied from its
/// first event. Replays within a session are acknowledged but not applied.
#[derive(Debug)]
pub struct PeerRegistry {
    heartbeat_timeout: Duration,
    peers: HashMap<String, PeerState>,
}

impl PeerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            peers: HashMap::new(),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Register a peer. Reconnecting replaces the previous session but keeps
    /// the realizations it was attributed.
    pub fn connect(&mut self, identity: &str, role: PeerRole, now: Instant) -> &PeerState {
        let realizations = self
            .peers
            .remove(identity)
            .map(|previous| previous.realizations)
            .unwrap_or_default();
        self.peers.entry(identity.to_string()).or_insert(PeerState {
            role,
            session: Uuid::now_v7(),
            connected_at: Utc::now(),
            last_seen: now,
            realizations,
            last_acked: None,
            last_applied: None,
        })
    }

    pub fn disconnect(&mut self, identity: &str) -> Option<PeerState> {
        self.peers.remove(identity)
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn get(&self, identity: &str) -> Option<&PeerState> {
        self.peers.get(identity)
    }

    pub fn role(&self, identity: &str) -> Option<PeerRole> {
        self.peers.get(identity).map(|peer| peer.role)
    }

    /// Record traffic from a peer. Returns false for unknown peers.
    pub fn touch(&mut self, identity: &str, now: Instant) -> bool {
        match self.peers.get_mut(identity) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Accept `seq` from `identity` if it is newer than anything applied in
    /// its current session.
    pub fn observe_sequence(&mut self, identity: &str, seq: u64) -> Result<(), ProtocolError> {
        let Some(peer) = self.peers.get_mut(identity) else {
            return Err(ProtocolError::NotConnected(identity.to_string()));
        };
        match peer.last_applied {
            Some(last_applied) if seq <= last_applied => Err(ProtocolError::Duplicate {
                identity: identity.to_string(),
                seq,
                last_applied,
            }),
            _ => {
                peer.last_applied = Some(seq);
                Ok(())
            }
        }
    }

    /// Note that `identity` reports on realization `iens`.
    pub fn attribute(&mut self, identity: &str, iens: Iens) {
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.realizations.insert(iens);
        }
    }

    pub fn record_ack(&mut self, identity: &str, event_id: u64) {
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.last_acked = Some(peer.last_acked.map_or(event_id, |last| last.max(event_id)));
        }
    }

    /// Remove and return every peer silent for longer than the heartbeat timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<ExpiredPeer> {
        let timeout = self.heartbeat_timeout;
        let lapsed: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) > timeout)
            .map(|(identity, _)| identity.clone())
            .collect();

        let mut expired: Vec<ExpiredPeer> = lapsed
            .into_iter()
            .filter_map(|identity| {
                let peer = self.peers.remove(&identity)?;
                Some(ExpiredPeer {
                    identity,
                    role: peer.role,
                    realizations: peer.realizations,
                })
            })
            .collect();
        expired.sort_by(|a, b| a.identity.cmp(&b.identity));
        expired
    }

    /// Identities of connected monitors.
    pub fn monitors(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.role == PeerRole::Monitor)
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub fn count(&self, role: PeerRole) -> usize {
        self.peers.values().filter(|peer| peer.role == role).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replayed_sequence_is_duplicate() {
        let mut peers = PeerRegistry::new(Duration::from_secs(5));
        peers.connect("worker-0", PeerRole::Worker, Instant::now());

        peers.observe_sequence("worker-0", 1).unwrap();
        peers.observe_sequence("worker-0", 2).unwrap();
        let err = peers.observe_sequence("worker-0", 2).unwrap_err();
        assert!(matches!(err, ProtocolError::Duplicate { seq: 2, last_applied: 2, .. }));
        assert!(peers.observe_sequence("worker-0", 1).is_err());

        // Sequences are tracked per identity.
        peers.connect("worker-1", PeerRole::Worker, Instant::now());
        peers.observe_sequence("worker-1", 1).unwrap();
        assert!(peers.observe_sequence("ghost", 1).is_err());
    }

    #[test]
    fn test_reconnect_starts_a_fresh_sequence() {
        let mut peers = PeerRegistry::new(Duration::from_secs(5));
        peers.connect("worker-0", PeerRole::Worker, Instant::now());
        peers.observe_sequence("worker-0", 3).unwrap();
        peers.disconnect("worker-0");
        assert!(peers.observe_sequence("worker-0", 4).is_err());

        peers.connect("worker-0", PeerRole::Worker, Instant::now());
        peers.observe_sequence("worker-0", 1).unwrap();
        assert!(peers.observe_sequence("worker-0", 1).is_err());
    }

    #[test]
    fn test_connect_without_disconnect_resets_sequence() {
        let mut peers = PeerRegistry::new(Duration::from_secs(5));
        peers.connect("worker-0", PeerRole::Worker, Instant::now());
        peers.observe_sequence("worker-0", 2).unwrap();
        peers.attribute("worker-0", Iens(7));

        let session = peers.connect("worker-0", PeerRole::Worker, Instant::now());
        assert_eq!(session.last_applied, None);
        assert!(session.realizations.contains(&Iens(7)));
        peers.observe_sequence("worker-0", 1).unwrap();
    }

    #[test]
    fn test_expire_returns_attributed_realizations() {
        let start = Instant::now();
        let mut peers = PeerRegistry::new(Duration::from_millis(100));
        peers.connect("worker-0", PeerRole::Worker, start);
        peers.connect("monitor", PeerRole::Monitor, start);
        peers.attribute("worker-0", Iens(4));
        peers.attribute("worker-0", Iens(2));

        let later = start + Duration::from_millis(150);
        assert!(peers.touch("monitor", later));
        let expired = peers.expire(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].identity, "worker-0");
        assert_eq!(
            expired[0].realizations.iter().copied().collect::<Vec<_>>(),
            vec![Iens(2), Iens(4)]
        );
        assert!(!peers.is_connected("worker-0"));
        assert_eq!(peers.monitors(), vec!["monitor".to_string()]);
    }

    #[test]
    fn test_touch_unknown_peer() {
        let mut peers = PeerRegistry::new(Duration::from_secs(1));
        assert!(!peers.touch("ghost", Instant::now()));
        assert_eq!(peers.count(PeerRole::Worker), 0);
    }

    #[test]
    fn test_record_ack_keeps_highest() {
        let mut peers = PeerRegistry::new(Duration::from_secs(1));
        peers.connect("monitor", PeerRole::Monitor, Instant::now());
        peers.record_ack("monitor", 5);
        peers.record_ack("monitor", 3);
        assert_eq!(peers.get("monitor").unwrap().last_acked, Some(5));
    }
}

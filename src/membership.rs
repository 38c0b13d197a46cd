//! Cluster membership and joint-consensus configuration management.
//!
//! A configuration is either stable (one peer set) or joint (old and new
//! sets side by side). Quorum and membership queries dispatch on the
//! variant, so callers never branch on "is this joint" themselves.
//!
//! The store tracks two configurations: `latest` (most recently appended,
//! possibly uncommitted) and `committed`. `latest` moves the moment a
//! configuration entry is appended; `committed` only once that entry's
//! index is covered by the commit index.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::errors::RaftError;
use crate::message::{LogBody, Peer};

/// An unordered set of peers. Quorum is a strict majority.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerSet {
    peers: Vec<Peer>,
}

impl PeerSet {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.iter().any(|p| p.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Votes or acknowledgements required for a decision in this set.
    pub fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    /// Copy of this set with `peer` added (no-op if the id is present).
    pub fn with(&self, peer: Peer) -> Self {
        let mut peers = self.peers.clone();
        if !self.contains(&peer.id) {
            peers.push(peer);
        }
        Self { peers }
    }

    /// Copy of this set with the peer named `id` removed.
    pub fn without(&self, id: &str) -> Self {
        Self {
            peers: self.peers.iter().filter(|p| p.id != id).cloned().collect(),
        }
    }
}

/// The membership shape of a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    /// A single peer set; decisions need one quorum.
    Stable(PeerSet),
    /// Joint consensus: decisions need a quorum in `current` AND in `next`.
    Joint { current: PeerSet, next: PeerSet },
}

/// A cluster configuration plus the log index it was appended at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub membership: Membership,
    /// Index of the log entry carrying this configuration; 0 for the empty
    /// pre-bootstrap configuration.
    pub log_index: u64,
}

impl Configuration {
    pub fn new(membership: Membership, log_index: u64) -> Self {
        Self {
            membership,
            log_index,
        }
    }

    /// The empty configuration a brand-new server starts from.
    pub fn empty() -> Self {
        Self::new(Membership::Stable(PeerSet::default()), 0)
    }

    pub fn is_joint(&self) -> bool {
        matches!(self.membership, Membership::Joint { .. })
    }

    /// The set decisions are counted against first (the old set while joint).
    pub fn current(&self) -> &PeerSet {
        match &self.membership {
            Membership::Stable(set) => set,
            Membership::Joint { current, .. } => current,
        }
    }

    /// The incoming set, present only during joint consensus.
    pub fn next(&self) -> Option<&PeerSet> {
        match &self.membership {
            Membership::Stable(_) => None,
            Membership::Joint { next, .. } => Some(next),
        }
    }

    /// Union of all member peers, deduplicated by id. Replication targets
    /// and vote solicitations cover this whole union.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.current().peers().to_vec();
        if let Some(next) = self.next() {
            for peer in next.peers() {
                if !peers.iter().any(|p| p.id == peer.id) {
                    peers.push(peer.clone());
                }
            }
        }
        peers
    }

    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.peers().into_iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.current().contains(id) || self.next().is_some_and(|n| n.contains(id))
    }

    /// True when `acked` covers a quorum in every active set.
    ///
    /// `acked` must yield the ids of peers that granted the decision; the
    /// caller includes itself when appropriate.
    pub fn decided(&self, acked: &[&str]) -> bool {
        let in_set = |set: &PeerSet| acked.iter().filter(|id| set.contains(id)).count();
        match &self.membership {
            Membership::Stable(set) => in_set(set) >= set.quorum(),
            Membership::Joint { current, next } => {
                in_set(current) >= current.quorum() && in_set(next) >= next.quorum()
            }
        }
    }

    /// Reject configurations where one id maps to two endpoints.
    fn validate(&self) -> Result<(), RaftError> {
        let peers = match &self.membership {
            Membership::Stable(set) => set.peers().to_vec(),
            Membership::Joint { current, next } => {
                let mut all = current.peers().to_vec();
                all.extend_from_slice(next.peers());
                all
            }
        };
        for (i, a) in peers.iter().enumerate() {
            for b in &peers[i + 1..] {
                if a.id == b.id && a.endpoint != b.endpoint {
                    return Err(RaftError::fatal(format!(
                        "peer {} appears with two endpoints: {} and {}",
                        a.id, a.endpoint, b.endpoint
                    )));
                }
            }
        }
        Ok(())
    }
}

// -- Configuration store ------------------------------------------------------

/// Holds the committed and latest configurations.
///
/// Reads come from any task; mutation happens only on the main loop.
pub struct ConfigurationStore {
    inner: RwLock<ConfigurationPair>,
}

struct ConfigurationPair {
    committed: Configuration,
    latest: Configuration,
}

impl ConfigurationStore {
    /// Start from the newest configuration recovered from the log (or the
    /// empty configuration on a fresh server). The commit index is volatile,
    /// so the recovered configuration is adopted as committed as well; a
    /// later commit re-confirms it.
    pub fn new(recovered: Option<Configuration>) -> Self {
        let configuration = recovered.unwrap_or_else(Configuration::empty);
        Self {
            inner: RwLock::new(ConfigurationPair {
                committed: configuration.clone(),
                latest: configuration,
            }),
        }
    }

    pub fn latest(&self) -> Configuration {
        self.inner.read().expect("configuration lock poisoned").latest.clone()
    }

    pub fn committed(&self) -> Configuration {
        self.inner
            .read()
            .expect("configuration lock poisoned")
            .committed
            .clone()
    }

    /// Adopt a newly appended configuration as latest (possibly uncommitted).
    pub fn set_latest(&self, configuration: Configuration) {
        self.inner.write().expect("configuration lock poisoned").latest = configuration;
    }

    /// Mark a configuration as committed. Called once the entry carrying it
    /// is covered by the commit index (or after a snapshot restore).
    pub fn set_committed(&self, configuration: Configuration) {
        self.inner
            .write()
            .expect("configuration lock poisoned")
            .committed = configuration;
    }

    /// Build the joint configuration entry that starts a transition from the
    /// committed set to `target`.
    ///
    /// The caller appends the returned body through the log-ops queue; the
    /// append path adopts it as latest. Starting a transition while one is
    /// in flight is an error.
    pub fn initiate_transition(&self, target: PeerSet) -> Result<LogBody, RaftError> {
        let pair = self.inner.read().expect("configuration lock poisoned");
        if pair.latest.is_joint() {
            return Err(RaftError::InTransition);
        }
        let joint = Configuration::new(
            Membership::Joint {
                current: pair.committed.current().clone(),
                next: target,
            },
            0, // assigned at append time
        );
        joint.validate()?;
        LogBody::configuration(&joint).map_err(RaftError::from)
    }

    /// Build the final configuration entry that ends the current joint
    /// transition: `current` becomes the previous `next`, `next` is cleared.
    pub fn commit_transition(&self) -> Result<LogBody, RaftError> {
        let pair = self.inner.read().expect("configuration lock poisoned");
        let next = match pair.latest.next() {
            Some(next) => next.clone(),
            None => {
                return Err(RaftError::fatal(
                    "commit_transition called outside a joint consensus",
                ))
            }
        };
        let stable = Configuration::new(Membership::Stable(next), 0);
        LogBody::configuration(&stable).map_err(RaftError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> PeerSet {
        PeerSet::new(ids.iter().map(|id| Peer::new(*id, format!("ep-{id}"))).collect())
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(set(&["a"]).quorum(), 1);
        assert_eq!(set(&["a", "b", "c"]).quorum(), 2);
        assert_eq!(set(&["a", "b", "c", "d"]).quorum(), 3);
        assert_eq!(set(&["a", "b", "c", "d", "e"]).quorum(), 3);
    }

    #[test]
    fn stable_decision_needs_one_quorum() {
        let configuration = Configuration::new(Membership::Stable(set(&["a", "b", "c"])), 1);
        assert!(!configuration.decided(&["a"]));
        assert!(configuration.decided(&["a", "b"]));
    }

    #[test]
    fn joint_decision_needs_both_quorums() {
        let configuration = Configuration::new(
            Membership::Joint {
                current: set(&["a", "b", "c"]),
                next: set(&["a", "b", "d"]),
            },
            5,
        );
        // Quorum in current only.
        assert!(!configuration.decided(&["a", "c"]));
        // Quorum in both.
        assert!(configuration.decided(&["a", "b"]));
        assert!(configuration.decided(&["a", "c", "d"]));
    }

    #[test]
    fn peers_union_deduplicates_by_id() {
        let configuration = Configuration::new(
            Membership::Joint {
                current: set(&["a", "b", "c"]),
                next: set(&["a", "b", "d"]),
            },
            5,
        );
        let mut ids: Vec<String> = configuration.peers().into_iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn transition_rejected_while_joint() {
        let store = ConfigurationStore::new(Some(Configuration::new(
            Membership::Joint {
                current: set(&["a", "b", "c"]),
                next: set(&["a", "b", "d"]),
            },
            5,
        )));
        let err = store.initiate_transition(set(&["a", "b"])).unwrap_err();
        assert!(matches!(err, RaftError::InTransition));
    }

    #[test]
    fn transition_body_encodes_joint_configuration() {
        let store = ConfigurationStore::new(Some(Configuration::new(
            Membership::Stable(set(&["a", "b", "c"])),
            1,
        )));
        let body = store.initiate_transition(set(&["a", "b", "d"])).unwrap();
        let joint = body.decode_configuration().unwrap();
        assert!(joint.is_joint());
        assert!(joint.current().contains("c"));
        assert!(joint.next().unwrap().contains("d"));
    }

    #[test]
    fn duplicate_id_with_distinct_endpoints_is_fatal() {
        let store = ConfigurationStore::new(None);
        let target = PeerSet::new(vec![
            Peer::new("a", "127.0.0.1:9001"),
            Peer::new("a", "127.0.0.1:9002"),
        ]);
        let err = store.initiate_transition(target).unwrap_err();
        assert!(err.is_fatal());
    }
}

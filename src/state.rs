//! Published server state.
//!
//! The main loop is the only writer; every other task reads through the
//! atomic getters here. The leader pointer and vote summary sit behind
//! read-write locks because they are compound values.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;

use serde::Serialize;

use crate::message::Peer;

/// The role a server currently plays.
///
/// Ordered so that a stepdown always moves to a strictly lower role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Role {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
}

impl Role {
    fn from_u8(value: u8) -> Role {
        match value {
            2 => Role::Leader,
            1 => Role::Candidate,
            _ => Role::Follower,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

/// The (term, candidate) pair of the most recent granted vote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteSummary {
    pub term: u64,
    pub candidate: String,
}

/// Shared, readable snapshot of a server's volatile state.
///
/// Invariant: `last_applied <= commit_index <= last_log_index`.
pub struct ServerState {
    role: AtomicU8,
    current_term: AtomicU64,
    first_log_index: AtomicU64,
    last_log_index: AtomicU64,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    last_applied_term: AtomicU64,
    leader: RwLock<Option<Peer>>,
    last_vote: RwLock<VoteSummary>,
    /// Set while a snapshot restore is replacing the log and state machine.
    restoring: AtomicBool,
    shutdown: AtomicBool,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            role: AtomicU8::new(Role::Follower as u8),
            current_term: AtomicU64::new(0),
            first_log_index: AtomicU64::new(0),
            last_log_index: AtomicU64::new(0),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            last_applied_term: AtomicU64::new(0),
            leader: RwLock::new(None),
            last_vote: RwLock::new(VoteSummary::default()),
            restoring: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_term(&self, term: u64) {
        self.current_term.store(term, Ordering::Release);
    }

    pub fn first_log_index(&self) -> u64 {
        self.first_log_index.load(Ordering::Acquire)
    }

    pub fn last_log_index(&self) -> u64 {
        self.last_log_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_log_range(&self, first: u64, last: u64) {
        self.first_log_index.store(first, Ordering::Release);
        self.last_log_index.store(last, Ordering::Release);
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_commit_index(&self, index: u64) {
        self.commit_index.store(index, Ordering::Release);
    }

    pub fn last_applied(&self) -> (u64, u64) {
        (
            self.last_applied.load(Ordering::Acquire),
            self.last_applied_term.load(Ordering::Acquire),
        )
    }

    pub(crate) fn set_last_applied(&self, index: u64, term: u64) {
        self.last_applied.store(index, Ordering::Release);
        self.last_applied_term.store(term, Ordering::Release);
    }

    pub fn leader(&self) -> Option<Peer> {
        self.leader.read().expect("leader lock poisoned").clone()
    }

    pub(crate) fn set_leader(&self, leader: Option<Peer>) {
        *self.leader.write().expect("leader lock poisoned") = leader;
    }

    pub fn last_vote(&self) -> VoteSummary {
        self.last_vote.read().expect("vote lock poisoned").clone()
    }

    pub(crate) fn set_last_vote(&self, summary: VoteSummary) {
        *self.last_vote.write().expect("vote lock poisoned") = summary;
    }

    pub fn restoring(&self) -> bool {
        self.restoring.load(Ordering::Acquire)
    }

    pub(crate) fn set_restoring(&self, value: bool) {
        self.restoring.store(value, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Returns true exactly once, for the caller that wins the race.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::AcqRel)
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_supports_stepdown_checks() {
        assert!(Role::Leader > Role::Candidate);
        assert!(Role::Candidate > Role::Follower);
    }

    #[test]
    fn begin_shutdown_is_once() {
        let state = ServerState::new();
        assert!(state.begin_shutdown());
        assert!(!state.begin_shutdown());
        assert!(state.is_shutdown());
    }

    #[test]
    fn log_range_and_commit_roundtrip() {
        let state = ServerState::new();
        state.set_log_range(1, 10);
        state.set_commit_index(4);
        state.set_last_applied(4, 2);
        assert_eq!(state.first_log_index(), 1);
        assert_eq!(state.last_log_index(), 10);
        assert_eq!(state.commit_index(), 4);
        assert_eq!(state.last_applied(), (4, 2));
    }
}

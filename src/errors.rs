//! Core error taxonomy.
//!
//! Handlers translate `StaleTerm`, `NotLeader`, and `LogInconsistent` into
//! ordinary RPC replies; replication drivers retry `Transport` errors with
//! backoff; `Fatal` indicates programmer or storage corruption and shuts the
//! server down with a non-zero exit.

use thiserror::Error;

use crate::message::Peer;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors produced by the consensus core.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The request carried a term older than the local one.
    #[error("stale term {request_term}, current term is {current_term}")]
    StaleTerm {
        request_term: u64,
        current_term: u64,
    },

    /// A write was addressed to a server that is not the leader. Carries the
    /// currently known leader, if any, for the caller's next attempt; the
    /// hint survives stringification so it crosses the wire too.
    #[error("not the cluster leader{}", .leader.as_ref().map(|p| format!(", current leader is {}", p.id)).unwrap_or_default())]
    NotLeader { leader: Option<Peer> },

    /// prevLogIndex/prevLogTerm did not match the local log.
    #[error("log inconsistent at index {index}")]
    LogInconsistent { index: u64 },

    /// A configuration transition is already in flight.
    #[error("a configuration transition is already in progress")]
    InTransition,

    /// Transient transport failure; safe to retry with backoff.
    #[error("transport: {0}")]
    Transport(String),

    /// The operation was attempted after shutdown began.
    #[error("server is shutting down")]
    Shutdown,

    /// The transport deadline elapsed before a reply arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An error relayed verbatim from a remote peer.
    #[error("remote: {0}")]
    Remote(String),

    /// Storage corruption or a broken internal invariant. Terminates the
    /// process after flushing logs.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Error surfaced by a pluggable provider (log, stable, or snapshot store).
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

impl RaftError {
    /// Fatal errors are never recovered; everything else is replied to or
    /// retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Fatal(_))
    }

    pub(crate) fn fatal(message: impl Into<String>) -> Self {
        RaftError::Fatal(message.into())
    }

    pub(crate) fn transport(message: impl std::fmt::Display) -> Self {
        RaftError::Transport(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_hex_and_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn only_fatal_is_fatal() {
        assert!(RaftError::fatal("log gap").is_fatal());
        assert!(!RaftError::Shutdown.is_fatal());
        assert!(!RaftError::NotLeader { leader: None }.is_fatal());
    }

    #[test]
    fn not_leader_display_carries_the_hint() {
        let with_hint = RaftError::NotLeader {
            leader: Some(Peer::new("s1", "127.0.0.1:9101")),
        };
        assert_eq!(
            with_hint.to_string(),
            "not the cluster leader, current leader is s1"
        );

        let without_hint = RaftError::NotLeader { leader: None };
        assert_eq!(without_hint.to_string(), "not the cluster leader");
    }
}

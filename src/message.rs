//! Wire types shared by the peer transport, the log, and the core.
//!
//! These are plain `serde` structs so any transport can carry them; the
//! bundled HTTP transport serialises them as JSON.

use serde::{Deserialize, Serialize};

use crate::membership::Configuration;

/// A cluster member: a stable identity plus the endpoint it is reachable at.
///
/// Identity is `id`. Two peers sharing an id but disagreeing on the endpoint
/// indicate a corrupted cluster configuration and are treated as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Unique identifier for this member.
    pub id: String,
    /// Network address the member's transport listens on.
    pub endpoint: String,
}

impl Peer {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Position of a log entry: its index and the term it was appended under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogMeta {
    pub index: u64,
    pub term: u64,
}

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    /// Opaque application command, applied to the state machine on commit.
    Command,
    /// Encoded cluster [`Configuration`], effective the moment it is appended.
    Configuration,
}

/// Payload of a log entry, without its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBody {
    pub kind: LogKind,
    pub data: Vec<u8>,
}

impl LogBody {
    /// Wrap raw application bytes as a command body.
    pub fn command(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: LogKind::Command,
            data: data.into(),
        }
    }

    /// Encode a configuration as a log body.
    pub fn configuration(configuration: &Configuration) -> anyhow::Result<Self> {
        Ok(Self {
            kind: LogKind::Configuration,
            data: serde_json::to_vec(configuration)?,
        })
    }

    /// Decode the configuration carried by this body.
    ///
    /// Only meaningful for `LogKind::Configuration` bodies.
    pub fn decode_configuration(&self) -> anyhow::Result<Configuration> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// A single replicated log entry.
///
/// Indices are contiguous and strictly increasing; terms are monotonically
/// non-decreasing. An entry is immutable once appended at a given
/// (index, term).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub body: LogBody,
}

impl LogEntry {
    pub fn meta(&self) -> LogMeta {
        LogMeta {
            index: self.index,
            term: self.term,
        }
    }
}

// -- RPC shapes ---------------------------------------------------------------

/// Leader-to-follower replication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Reply to [`AppendEntriesRequest`]. `server_id` identifies the responder so
/// the replication driver can key its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub server_id: String,
    pub term: u64,
    pub success: bool,
}

/// Candidate-to-peer vote solicitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Reply to [`RequestVoteRequest`]. `server_id` lets the candidate tally
/// votes per configuration set during joint consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub server_id: String,
    pub term: u64,
    pub granted: bool,
}

/// Out-of-band metadata for a streamed snapshot install.
///
/// Delivered before the payload (the HTTP transport carries it in a request
/// header); the payload itself streams in afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotMeta {
    pub leader_id: String,
    pub term: u64,
    /// Index of the last entry covered by the snapshot.
    pub index: u64,
    /// Term of the entry at `index`.
    pub snapshot_term: u64,
    /// Cluster configuration as of `index`.
    pub configuration: Configuration,
}

/// Acknowledgement for a completed snapshot install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub server_id: String,
    pub term: u64,
    pub success: bool,
}

/// Client request to append a body to the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub body: LogBody,
}

/// Outcome of an apply: the assigned log position once durably appended, or
/// an error (notably `NotLeader`, carrying the leader hint as a message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApplyResponse {
    Meta(LogMeta),
    Error(String),
}

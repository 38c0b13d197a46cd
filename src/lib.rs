//! bleepraft -- replicated state machine core built on Raft consensus.
//!
//! This crate turns a cluster of unreliable nodes into a single
//! linearizable log feeding an application-defined state machine. It
//! covers leader election, log replication, commit advancement, membership
//! change via joint consensus, and snapshot installation. The wire
//! transport, log and stable stores, snapshot store, and state machine are
//! pluggable collaborators; HTTP, SQLite, filesystem, and in-memory
//! implementations ship in the box.

pub mod api;
pub mod config;
pub mod errors;
pub mod kv;
pub mod log;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod repl;
pub mod rpc;
pub mod server;
pub mod snapshot;
pub mod stable;
pub mod state;
pub mod statemachine;
pub mod storage;
pub mod transport;

pub use config::{Config, RaftConfig};
pub use errors::RaftError;
pub use log::LogProvider;
pub use membership::{Configuration, Membership, PeerSet};
pub use message::{LogBody, LogEntry, LogKind, LogMeta, Peer};
pub use server::{Server, ServerCoreOptions, ServerInfo, ServerStates};
pub use snapshot::{SnapshotMeta, SnapshotProvider, SnapshotSink};
pub use stable::StableStore;
pub use state::Role;
pub use statemachine::{StateMachine, StateMachineSnapshot};
pub use transport::Transport;

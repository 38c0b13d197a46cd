//! Replicated log provider contract and the serialised mutation queue.
//!
//! Reads go straight to the provider from any task; every mutation travels
//! through the main loop's log-ops queue so it is ordered with role and
//! term transitions. The backend therefore never needs to be reentrant for
//! writes, but its read methods must be safe to call concurrently.

use tokio::sync::oneshot;

use crate::errors::RaftError;
use crate::message::{LogBody, LogEntry, LogMeta};

/// Index-addressed log storage contract.
///
/// Entries form a contiguous index range `[first_index, last_index]`; both
/// are 0 on an empty log. A gap inside the range is storage corruption and
/// is treated as fatal by the core.
pub trait LogProvider: Send + Sync + 'static {
    /// Index of the first retained entry, or 0 when empty.
    fn first_index(&self) -> anyhow::Result<u64>;

    /// Index of the newest entry, or 0 when empty.
    fn last_index(&self) -> anyhow::Result<u64>;

    /// The entry at `index`, or `None` if it is outside the retained range.
    fn entry(&self, index: u64) -> anyhow::Result<Option<LogEntry>>;

    /// Entries in `[from, to]` inclusive, in index order.
    fn entries(&self, from: u64, to: u64) -> anyhow::Result<Vec<LogEntry>>;

    /// The newest entry, or `None` when the log is empty.
    fn last_entry(&self) -> anyhow::Result<Option<LogEntry>>;

    /// Append entries whose indices continue the current range.
    fn append(&self, entries: Vec<LogEntry>) -> anyhow::Result<()>;

    /// Drop every entry with index <= `up_to` (snapshot compaction).
    fn trim_prefix(&self, up_to: u64) -> anyhow::Result<()>;

    /// Drop every entry with index >= `from` (conflict repair).
    fn trim_suffix(&self, from: u64) -> anyhow::Result<()>;

    /// Replace the log with an empty one positioned just past a snapshot
    /// covering `(index, term)`: the next append lands at `index + 1`, and
    /// `index`/`term` become the compaction origin.
    fn reset(&self, index: u64, term: u64) -> anyhow::Result<()>;

    /// Term of the entry at `index`, answering for the compaction origin as
    /// well. `None` for indices outside the known range.
    fn term(&self, index: u64) -> anyhow::Result<Option<u64>>;

    /// Term and index of the newest position, counting the compaction
    /// origin; both 0 on a fresh log.
    fn last_term_index(&self) -> anyhow::Result<(u64, u64)>;
}

/// A mutation submitted to the main loop's log-ops queue.
///
/// Each variant carries a oneshot that completes exactly once.
pub(crate) enum LogOp {
    /// Append client bodies; the main loop assigns indices and the current
    /// term, and replies with the assigned positions once durable. Rejected
    /// with `NotLeader` on non-leaders.
    Append {
        bodies: Vec<LogBody>,
        reply: oneshot::Sender<Result<Vec<LogMeta>, RaftError>>,
    },
    /// Drop the prefix up to and including `up_to` (after a snapshot).
    /// Suffix trims never travel through the queue: conflict repair runs
    /// inline on the main loop, which is already the serialisation point.
    TrimPrefix {
        up_to: u64,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryLogProvider;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            body: LogBody::command(format!("cmd-{index}").into_bytes()),
        }
    }

    #[test]
    fn last_term_index_defaults_to_zero() {
        let log = MemoryLogProvider::new();
        assert_eq!(log.last_term_index().unwrap(), (0, 0));
    }

    #[test]
    fn last_term_index_reads_newest_entry() {
        let log = MemoryLogProvider::new();
        log.append(vec![entry(1, 1), entry(2, 3)]).unwrap();
        assert_eq!(log.last_term_index().unwrap(), (3, 2));
    }
}

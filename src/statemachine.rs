//! Application state machine contract.
//!
//! The state machine is an opaque consumer of committed commands. The core
//! applies entries in log order from the main loop only, so implementations
//! need interior locking solely to support concurrent reads of their own
//! query surface.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::message::LogMeta;

/// A captured state-machine snapshot, ready to be serialised.
pub trait StateMachineSnapshot: Send {
    /// Write the encoded snapshot to `sink` exactly once.
    fn write(&self, sink: &mut dyn Write) -> anyhow::Result<()>;
}

/// Contract between the core and the application.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command. Called in log order; never concurrently.
    fn apply(&self, meta: LogMeta, command: &[u8]);

    /// Capture the applied state at a quiescent point.
    fn snapshot(&self) -> anyhow::Result<Box<dyn StateMachineSnapshot>>;

    /// Replace the applied state with the snapshot read from `reader`.
    /// Runs exclusively; no applies happen while a restore is in progress.
    fn restore(&self, reader: Box<dyn Read + Send>) -> anyhow::Result<()>;
}

/// Thin wrapper the core holds; adds tracing and apply metrics around the
/// application's implementation.
pub(crate) struct StateMachineProxy {
    inner: Arc<dyn StateMachine>,
}

impl StateMachineProxy {
    pub fn new(inner: Arc<dyn StateMachine>) -> Self {
        Self { inner }
    }

    pub fn apply(&self, meta: LogMeta, command: &[u8]) {
        tracing::debug!(index = meta.index, term = meta.term, "applying command");
        self.inner.apply(meta, command);
        metrics::counter!(crate::metrics::ENTRIES_APPLIED_TOTAL).increment(1);
    }

    pub fn snapshot(&self) -> anyhow::Result<Box<dyn StateMachineSnapshot>> {
        self.inner.snapshot()
    }

    pub fn restore(&self, reader: Box<dyn Read + Send>) -> anyhow::Result<()> {
        self.inner.restore(reader)
    }
}

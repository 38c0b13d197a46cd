//! Snapshot capture, install, and restore.
//!
//! The service owns the scheduled capture loop and the install path for
//! snapshots streamed in from a leader. Actual state capture and restore
//! run on the main loop (the only mutator); the service talks to it through
//! the capture and restore channels and performs the slow I/O itself.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::RaftConfig;
use crate::errors::RaftError;
use crate::log::LogOp;
use crate::membership::Configuration;
use crate::message::InstallSnapshotResponse;
use crate::rpc::{InstallSnapshotRequest, Response, RpcReply};
use crate::state::ServerState;
use crate::statemachine::StateMachineSnapshot;

/// How often the scheduler compares applied progress to the threshold.
const SCHEDULER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identity and coverage of a stored snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    /// Provider-assigned identifier.
    pub id: String,
    /// Index of the last entry the snapshot covers.
    pub index: u64,
    /// Term of the entry at `index`.
    pub term: u64,
    /// Cluster configuration as of `index`.
    pub configuration: Configuration,
    /// Payload size in bytes.
    pub size: u64,
}

/// Destination for a snapshot being written.
///
/// Data goes through `Write`; `finalize` registers the snapshot atomically.
/// A dropped, unfinalized sink leaves no registered snapshot behind.
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;

    /// Seal the payload and register the snapshot.
    fn finalize(self: Box<Self>) -> anyhow::Result<SnapshotMeta>;
}

/// Pluggable snapshot storage contract.
pub trait SnapshotProvider: Send + Sync + 'static {
    /// Open a sink for a snapshot covering `(index, term)`.
    fn create(
        &self,
        index: u64,
        term: u64,
        configuration: &Configuration,
    ) -> anyhow::Result<Box<dyn SnapshotSink>>;

    /// Metadata of the newest registered snapshot.
    fn latest(&self) -> anyhow::Result<Option<SnapshotMeta>>;

    /// Open a registered snapshot for reading.
    fn open(&self, id: &str) -> anyhow::Result<(SnapshotMeta, Box<dyn Read + Send>)>;
}

// -- Main-loop messages -------------------------------------------------------

/// Ask the main loop to capture the state machine at its applied point.
pub(crate) struct CaptureRequest {
    pub reply: oneshot::Sender<Result<CapturedSnapshot, RaftError>>,
}

/// A state-machine snapshot captured at `(index, term)`, not yet serialised.
pub(crate) struct CapturedSnapshot {
    pub index: u64,
    pub term: u64,
    pub configuration: Configuration,
    pub data: Box<dyn StateMachineSnapshot>,
}

/// Ask the main loop to adopt a fully written snapshot: restore the state
/// machine, replace the log, and move the commit state to the snapshot.
pub(crate) struct RestoreRequest {
    pub meta: SnapshotMeta,
    pub reply: oneshot::Sender<Result<(), RaftError>>,
}

// -- Service ------------------------------------------------------------------

/// Background snapshot service: threshold-driven capture plus the install
/// path for snapshots streamed from a leader.
pub(crate) struct SnapshotService {
    id: String,
    state: Arc<ServerState>,
    provider: Arc<dyn SnapshotProvider>,
    options: RaftConfig,
    capture_tx: mpsc::Sender<CaptureRequest>,
    restore_tx: mpsc::Sender<RestoreRequest>,
    log_ops_tx: mpsc::Sender<LogOp>,
    /// Index covered by the newest registered snapshot.
    snapshot_index: AtomicU64,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotService {
    pub fn new(
        id: String,
        state: Arc<ServerState>,
        provider: Arc<dyn SnapshotProvider>,
        options: RaftConfig,
        capture_tx: mpsc::Sender<CaptureRequest>,
        restore_tx: mpsc::Sender<RestoreRequest>,
        log_ops_tx: mpsc::Sender<LogOp>,
    ) -> anyhow::Result<Self> {
        let snapshot_index = provider.latest()?.map(|meta| meta.index).unwrap_or(0);
        Ok(Self {
            id,
            state,
            provider,
            options,
            capture_tx,
            restore_tx,
            log_ops_tx,
            snapshot_index: AtomicU64::new(snapshot_index),
            scheduler: Mutex::new(None),
        })
    }

    pub fn provider(&self) -> Arc<dyn SnapshotProvider> {
        Arc::clone(&self.provider)
    }

    /// Index covered by the newest snapshot, 0 when there is none.
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index.load(Ordering::Acquire)
    }

    /// Start the capture scheduler. Idempotent; the previous task keeps
    /// running if one is already active.
    pub fn start_scheduler(self: &Arc<Self>) {
        let mut guard = self.scheduler.lock().expect("scheduler lock poisoned");
        if guard.is_some() {
            return;
        }
        let service = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULER_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if service.state.is_shutdown() {
                    return;
                }
                let (applied, _) = service.state.last_applied();
                if applied.saturating_sub(service.snapshot_index()) < service.options.snapshot_threshold {
                    continue;
                }
                match service.capture_once().await {
                    Ok(Some(meta)) => {
                        tracing::info!(index = meta.index, term = meta.term, id = %meta.id, "snapshot captured");
                    }
                    Ok(None) => {}
                    Err(RaftError::Shutdown) => return,
                    Err(err) => {
                        tracing::warn!(error = %err, "snapshot capture failed");
                    }
                }
            }
        }));
    }

    /// Stop the capture scheduler and abort any in-flight tick.
    pub fn stop_scheduler(&self) {
        if let Some(task) = self.scheduler.lock().expect("scheduler lock poisoned").take() {
            task.abort();
        }
    }

    /// Capture one snapshot: ask the main loop for the applied state, write
    /// it out, register it, then trim the covered log prefix.
    ///
    /// Returns `None` when there is nothing new to cover.
    pub async fn capture_once(&self) -> Result<Option<SnapshotMeta>, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.capture_tx
            .send(CaptureRequest { reply: reply_tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        let captured = reply_rx.await.map_err(|_| RaftError::Shutdown)??;

        if captured.index == 0 || captured.index <= self.snapshot_index() {
            return Ok(None);
        }

        let mut sink =
            self.provider
                .create(captured.index, captured.term, &captured.configuration)?;
        captured.data.write(&mut sink)?;
        let meta = sink.finalize()?;
        self.snapshot_index.store(meta.index, Ordering::Release);
        metrics::counter!(crate::metrics::SNAPSHOTS_TAKEN_TOTAL).increment(1);

        let (trim_tx, trim_rx) = oneshot::channel();
        self.log_ops_tx
            .send(LogOp::TrimPrefix {
                up_to: meta.index,
                reply: trim_tx,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        trim_rx.await.map_err(|_| RaftError::Shutdown)??;

        Ok(Some(meta))
    }

    /// Install a snapshot streamed from the leader, then hand the registered
    /// snapshot to the main loop for the actual restore. Responds on the
    /// RPC's reply channel when the whole operation settles.
    pub async fn install_and_respond(self: Arc<Self>, request: InstallSnapshotRequest, reply: RpcReply) {
        self.state.set_restoring(true);
        let result = self.install(request).await;
        self.state.set_restoring(false);

        let response = match result {
            Ok(()) => Ok(Response::InstallSnapshot(InstallSnapshotResponse {
                server_id: self.id.clone(),
                term: self.state.current_term(),
                success: true,
            })),
            Err(err) => {
                tracing::warn!(error = %err, "snapshot install failed");
                Err(err)
            }
        };
        let _ = reply.send(response);
    }

    async fn install(&self, mut request: InstallSnapshotRequest) -> Result<(), RaftError> {
        let meta = &request.meta;
        let mut sink = self
            .provider
            .create(meta.index, meta.snapshot_term, &meta.configuration)?;
        while let Some(chunk) = request.data.recv().await {
            sink.write_all(&chunk).map_err(anyhow::Error::from)?;
        }
        let registered = sink.finalize()?;
        self.snapshot_index.store(registered.index, Ordering::Release);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.restore_tx
            .send(RestoreRequest {
                meta: registered,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)??;

        metrics::counter!(crate::metrics::SNAPSHOTS_INSTALLED_TOTAL).increment(1);
        Ok(())
    }
}

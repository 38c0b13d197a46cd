//! Leader-side replication: one driver per peer plus a commit watcher.
//!
//! Each driver single-threads AppendEntries traffic to its peer, so calls
//! to one peer are totally ordered; nothing is guaranteed across peers.
//! Drivers publish match indices to the watcher, which advances the commit
//! index under the same-term quorum rule (Raft §5.4.2) evaluated against
//! every active configuration set.
//!
//! Stopping the scheduler flips the stop signal, which aborts the drivers
//! and thereby cancels their in-flight transport calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::RaftConfig;
use crate::log::LogProvider;
use crate::membership::Configuration;
use crate::message::{AppendEntriesRequest, InstallSnapshotMeta, Peer};
use crate::snapshot::SnapshotService;
use crate::state::ServerState;
use crate::transport::Transport;

/// Transport errors back a driver off starting here, doubling up to the cap.
const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Everything a driver or the watcher needs from the leader.
pub(crate) struct ReplContext {
    pub id: String,
    pub options: RaftConfig,
    pub state: Arc<ServerState>,
    pub log: Arc<dyn LogProvider>,
    pub transport: Arc<dyn Transport>,
    pub snapshots: Arc<SnapshotService>,
    /// Commit advances go back to the main loop here.
    pub commit_tx: mpsc::Sender<u64>,
    /// Signalled with the newer term when a reply reveals ours is stale.
    pub stepdown_tx: mpsc::Sender<u64>,
    /// Wakes drivers and the watcher when the last log index moves.
    pub last_index_rx: watch::Receiver<u64>,
}

/// Running replication drivers for one leadership stretch under one
/// configuration. Recreated whenever either changes.
pub(crate) struct ReplScheduler {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReplScheduler {
    /// Spawn one driver per peer in the configuration's union (minus self)
    /// and the commit watcher.
    pub fn start(ctx: ReplContext, configuration: Configuration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (match_tx, match_rx) = mpsc::channel(64);
        let ctx = Arc::new(ctx);

        let mut tasks = Vec::new();
        for peer in configuration.peers() {
            if peer.id == ctx.id {
                continue;
            }
            let driver = Driver {
                peer,
                ctx: Arc::clone(&ctx),
                stop_rx: stop_rx.clone(),
                match_tx: match_tx.clone(),
                next_index: ctx.state.last_log_index() + 1,
                match_index: 0,
            };
            tasks.push(tokio::spawn(driver.run()));
        }
        drop(match_tx);

        tasks.push(tokio::spawn(run_commit_watcher(
            Arc::clone(&ctx),
            configuration,
            match_rx,
            stop_rx,
        )));

        Self { stop_tx, tasks }
    }

    /// Stop every driver and the watcher, cancelling in-flight RPCs, and
    /// join them.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Per-peer replication loop.
struct Driver {
    peer: Peer,
    ctx: Arc<ReplContext>,
    stop_rx: watch::Receiver<bool>,
    match_tx: mpsc::Sender<(String, u64)>,
    next_index: u64,
    match_index: u64,
}

impl Driver {
    async fn run(mut self) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if *self.stop_rx.borrow() {
                return;
            }
            match self.replicate_once().await {
                Ok(RoundOutcome::Stepdown) => return,
                Ok(RoundOutcome::Progress) => {
                    backoff = BACKOFF_BASE;
                    // More entries already waiting: go again immediately.
                    if self.next_index <= self.ctx.state.last_log_index() {
                        continue;
                    }
                    self.idle().await;
                }
                Ok(RoundOutcome::Rejected) => {
                    // nextIndex moved back; retry without waiting.
                    backoff = BACKOFF_BASE;
                }
                Err(err) => {
                    tracing::debug!(peer = %self.peer.id, error = %err, "replication round failed");
                    let mut stop_rx = self.stop_rx.clone();
                    tokio::select! {
                        _ = stop_rx.changed() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// Wait for new entries, the heartbeat interval, or the stop signal.
    async fn idle(&mut self) {
        let mut last_index_rx = self.ctx.last_index_rx.clone();
        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            _ = stop_rx.changed() => {}
            _ = last_index_rx.changed() => {}
            _ = tokio::time::sleep(self.ctx.options.heartbeat_interval()) => {}
        }
    }

    async fn replicate_once(&mut self) -> anyhow::Result<RoundOutcome> {
        let first_index = self.ctx.log.first_index()?;
        if first_index > 0 && self.next_index < first_index {
            // The entries this peer needs were compacted away.
            return self.install_snapshot().await;
        }

        let current_term = self.ctx.state.current_term();
        let last_index = self.ctx.state.last_log_index();
        let prev_log_index = self.next_index - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            match self.ctx.log.term(prev_log_index)? {
                Some(term) => term,
                // Compacted between the check above and here; next round
                // takes the snapshot path.
                None => return Ok(RoundOutcome::Rejected),
            }
        };

        let batch_end = last_index.min(self.next_index + self.ctx.options.max_append_batch - 1);
        let entries = if batch_end >= self.next_index {
            self.ctx.log.entries(self.next_index, batch_end)?
        } else {
            Vec::new()
        };
        // The prefix may have been compacted between the range computation
        // and the read; the next round takes the snapshot path.
        if batch_end >= self.next_index
            && entries.first().map(|e| e.index) != Some(self.next_index)
        {
            return Ok(RoundOutcome::Rejected);
        }
        let sent_last = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

        let request = AppendEntriesRequest {
            term: current_term,
            leader_id: self.ctx.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.ctx.state.commit_index(),
        };

        let response = tokio::time::timeout(
            self.ctx.options.rpc_timeout(),
            self.ctx.transport.append_entries(&self.peer, request),
        )
        .await
        .map_err(|_| anyhow::anyhow!("append entries to {} timed out", self.peer.id))??;

        if response.term > current_term {
            let _ = self.ctx.stepdown_tx.try_send(response.term);
            return Ok(RoundOutcome::Stepdown);
        }

        if response.success {
            if sent_last > self.match_index {
                self.match_index = sent_last;
                let _ = self
                    .match_tx
                    .send((self.peer.id.clone(), self.match_index))
                    .await;
            }
            self.next_index = self.match_index + 1;
            Ok(RoundOutcome::Progress)
        } else {
            self.next_index = self.next_index.saturating_sub(1).max(1);
            Ok(RoundOutcome::Rejected)
        }
    }

    /// The peer is too far behind: stream it the newest snapshot.
    async fn install_snapshot(&mut self) -> anyhow::Result<RoundOutcome> {
        let provider = self.ctx.snapshots.provider();
        let meta = provider
            .latest()?
            .ok_or_else(|| anyhow::anyhow!("peer needs a snapshot but none is registered"))?;
        let (_, reader) = provider.open(&meta.id)?;

        let wire_meta = InstallSnapshotMeta {
            leader_id: self.ctx.id.clone(),
            term: self.ctx.state.current_term(),
            index: meta.index,
            snapshot_term: meta.term,
            configuration: meta.configuration.clone(),
        };

        tracing::info!(peer = %self.peer.id, index = meta.index, "installing snapshot on lagging peer");
        let response = self
            .ctx
            .transport
            .install_snapshot(&self.peer, wire_meta, reader)
            .await?;

        if response.term > self.ctx.state.current_term() {
            let _ = self.ctx.stepdown_tx.try_send(response.term);
            return Ok(RoundOutcome::Stepdown);
        }
        if !response.success {
            anyhow::bail!("peer {} rejected the snapshot", self.peer.id);
        }

        self.match_index = meta.index;
        self.next_index = meta.index + 1;
        let _ = self
            .match_tx
            .send((self.peer.id.clone(), self.match_index))
            .await;
        Ok(RoundOutcome::Progress)
    }
}

enum RoundOutcome {
    /// The peer acknowledged; match/next moved forward.
    Progress,
    /// Log inconsistency reply; nextIndex was decremented.
    Rejected,
    /// A newer term was observed; the leader must step down.
    Stepdown,
}

/// Aggregate match indices and advance the commit index.
///
/// `commit = max k` such that `k > commitIndex`, `entry[k].term ==
/// currentTerm`, and `k` is replicated on a quorum in every active set. The
/// leader's own log counts as a match up to its last index.
async fn run_commit_watcher(
    ctx: Arc<ReplContext>,
    configuration: Configuration,
    mut match_rx: mpsc::Receiver<(String, u64)>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut matches: HashMap<String, u64> = HashMap::new();
    let mut last_index_rx = ctx.last_index_rx.clone();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            update = match_rx.recv() => {
                match update {
                    Some((peer_id, match_index)) => {
                        matches.insert(peer_id, match_index);
                    }
                    None => return,
                }
            }
            // Single-node clusters (and fresh appends) advance on the
            // leader's own log alone.
            _ = last_index_rx.changed() => {}
        }

        if let Some(commit) = advance_commit_index(&ctx, &configuration, &matches) {
            if ctx.commit_tx.send(commit).await.is_err() {
                return;
            }
        }
    }
}

fn advance_commit_index(
    ctx: &ReplContext,
    configuration: &Configuration,
    matches: &HashMap<String, u64>,
) -> Option<u64> {
    let current_term = ctx.state.current_term();
    let commit_index = ctx.state.commit_index();
    let last_index = ctx.state.last_log_index();

    let mut best = None;
    for k in (commit_index + 1)..=last_index {
        // Only entries from the current term commit by counting (§5.4.2).
        match ctx.log.term(k) {
            Ok(Some(term)) if term == current_term => {}
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "commit watcher failed to read log");
                return None;
            }
        }
        let mut acked: Vec<&str> = vec![ctx.id.as_str()];
        acked.extend(
            matches
                .iter()
                .filter(|(_, m)| **m >= k)
                .map(|(id, _)| id.as_str()),
        );
        if configuration.decided(&acked) {
            best = Some(k);
        }
    }
    best
}

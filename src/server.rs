//! The consensus server: construction, the role-specific main loops, and the
//! client-facing entrypoints.
//!
//! One privileged task runs the main loop; it is the only mutator of role,
//! term, log, configuration, and commit state. Everything else (transport,
//! replication drivers, snapshot service, admin API) communicates with it
//! through bounded channels and reads through [`ServerState`]'s atomic
//! getters. Role and configuration changes are handled by returning from the
//! current role loop to the dispatcher, which re-enters the loop for the
//! current role with fresh collaborators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::RaftConfig;
use crate::errors::RaftError;
use crate::log::{LogOp, LogProvider};
use crate::membership::{Configuration, ConfigurationStore, Membership, PeerSet};
use crate::message::{
    ApplyRequest, ApplyResponse, LogBody, LogEntry, LogKind, LogMeta, Peer, RequestVoteRequest,
};
use crate::repl::{ReplContext, ReplScheduler};
use crate::rpc::Rpc;
use crate::snapshot::{
    CaptureRequest, CapturedSnapshot, RestoreRequest, SnapshotProvider, SnapshotService,
};
use crate::stable::{StableState, StableStore};
use crate::state::{Role, ServerState, VoteSummary};
use crate::statemachine::{StateMachine, StateMachineProxy};
use crate::transport::Transport;

// Channel capacities, sized so bursts queue without stalling the producers.
const RPC_CHANNEL_CAPACITY: usize = 16;
const LOG_OPS_CHANNEL_CAPACITY: usize = 64;
const COMMIT_CHANNEL_CAPACITY: usize = 16;
const CAPTURE_CHANNEL_CAPACITY: usize = 16;
const RESTORE_CHANNEL_CAPACITY: usize = 8;
const SHUTDOWN_CHANNEL_CAPACITY: usize = 8;

/// Identity pair reported by [`Server::info`].
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub endpoint: String,
}

/// Observable state summary served by the admin `/states` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStates {
    pub id: String,
    pub endpoint: String,
    pub leader: Option<Peer>,
    pub role: String,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_vote_term: u64,
    pub last_vote_candidate: String,
    pub commit_index: u64,
}

/// Pluggable collaborators a server is built from.
pub struct ServerCoreOptions {
    pub id: String,
    pub log: Arc<dyn LogProvider>,
    pub stable: Arc<dyn StableStore>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub state_machine: Arc<dyn StateMachine>,
    pub transport: Arc<dyn Transport>,
}

/// Handle to a running (or startable) consensus server.
///
/// Cheap to share; every method is `&self`. The heavy state lives in the
/// [`ServerCore`] consumed by [`Server::serve`].
pub struct Server {
    id: String,
    options: RaftConfig,
    state: Arc<ServerState>,
    configurations: Arc<ConfigurationStore>,
    transport: Arc<dyn Transport>,
    log_ops_tx: mpsc::Sender<LogOp>,
    shutdown_tx: mpsc::Sender<Option<RaftError>>,
    rpc_tx: mpsc::Sender<Rpc>,
    serve_flag: AtomicBool,
    core: Mutex<Option<(ServerCore, CoreChannels)>>,
}

impl Server {
    /// Build a server from its collaborators, restoring persisted state.
    ///
    /// If a snapshot is registered, the state machine is restored from it
    /// before serving; the log prefix it covers was already trimmed.
    pub fn new(core_opts: ServerCoreOptions, options: RaftConfig) -> anyhow::Result<Arc<Self>> {
        let state = Arc::new(ServerState::new());
        let stable = StableState::new(Arc::clone(&core_opts.stable));

        // Restore persisted term and vote.
        state.set_current_term(stable.current_term()?);
        state.set_last_vote(stable.last_vote()?);

        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        let (log_ops_tx, log_ops_rx) = mpsc::channel(LOG_OPS_CHANNEL_CAPACITY);
        let (commit_tx, commit_rx) = mpsc::channel(COMMIT_CHANNEL_CAPACITY);
        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (restore_tx, restore_rx) = mpsc::channel(RESTORE_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(SHUTDOWN_CHANNEL_CAPACITY);

        let snapshots = Arc::new(SnapshotService::new(
            core_opts.id.clone(),
            Arc::clone(&state),
            Arc::clone(&core_opts.snapshots),
            options.clone(),
            capture_tx,
            restore_tx,
            log_ops_tx.clone(),
        )?);

        let latest_snapshot = core_opts.snapshots.latest()?;

        // Adopt the newest configuration in the log, falling back to the
        // snapshot's, then to the empty pre-bootstrap configuration.
        let recovered = recover_configuration(core_opts.log.as_ref())?
            .or_else(|| latest_snapshot.as_ref().map(|meta| meta.configuration.clone()));
        let configurations = Arc::new(ConfigurationStore::new(recovered));

        let state_machine = StateMachineProxy::new(core_opts.state_machine);

        // Rebuild the applied state from the newest snapshot; the log
        // entries it covered are gone, so this is recovery, not an
        // optimisation.
        if let Some(meta) = &latest_snapshot {
            let (_, reader) = core_opts.snapshots.open(&meta.id)?;
            state_machine.restore(reader)?;
            state.set_commit_index(meta.index);
            state.set_last_applied(meta.index, meta.term);
        }

        let first = core_opts.log.first_index()?;
        let last = core_opts.log.last_index()?;
        state.set_log_range(first, last);
        let (last_index_tx, _) = watch::channel(last);

        let core = ServerCore {
            id: core_opts.id.clone(),
            options: options.clone(),
            state: Arc::clone(&state),
            stable,
            log: Arc::clone(&core_opts.log),
            configurations: Arc::clone(&configurations),
            state_machine,
            transport: Arc::clone(&core_opts.transport),
            snapshots,
            commit_tx,
            last_index_tx,
            conf_changed: false,
            shutdown_err: None,
        };

        let channels = CoreChannels {
            rpc_rx,
            log_ops_rx,
            commit_rx,
            capture_rx,
            restore_rx,
            shutdown_rx,
        };

        Ok(Arc::new(Self {
            id: core_opts.id,
            options,
            state,
            configurations,
            transport: core_opts.transport,
            log_ops_tx,
            shutdown_tx,
            rpc_tx,
            serve_flag: AtomicBool::new(false),
            core: Mutex::new(Some((core, channels))),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id.clone(),
            endpoint: self.endpoint(),
        }
    }

    /// The peer currently believed to be leader, if any.
    pub fn leader(&self) -> Option<Peer> {
        self.state.leader()
    }

    /// The most recently committed cluster configuration.
    pub fn committed_membership(&self) -> Configuration {
        self.configurations.committed()
    }

    /// The most recently appended cluster configuration, possibly still
    /// uncommitted.
    pub fn latest_membership(&self) -> Configuration {
        self.configurations.latest()
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn states(&self) -> ServerStates {
        let last_vote = self.state.last_vote();
        ServerStates {
            id: self.id.clone(),
            endpoint: self.endpoint(),
            leader: self.state.leader(),
            role: self.state.role().as_str().to_string(),
            current_term: self.state.current_term(),
            last_log_index: self.state.last_log_index(),
            last_vote_term: last_vote.term,
            last_vote_candidate: last_vote.candidate,
            commit_index: self.state.commit_index(),
        }
    }

    /// Submit a body to the replicated log.
    ///
    /// On the leader this completes with the assigned `(index, term)` once
    /// the entry is durably appended (not yet committed). On any other
    /// server the request is proxied to the current leader; `NotLeader` is
    /// returned when no leader is known.
    pub async fn apply(&self, body: LogBody) -> Result<LogMeta, RaftError> {
        if self.state.is_shutdown() {
            return Err(RaftError::Shutdown);
        }

        if self.state.role() == Role::Leader {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.log_ops_tx
                .send(LogOp::Append {
                    bodies: vec![body],
                    reply: reply_tx,
                })
                .await
                .map_err(|_| RaftError::Shutdown)?;
            let metas = reply_rx.await.map_err(|_| RaftError::Shutdown)??;
            return Ok(metas[0]);
        }

        // Proxy path: redirect to the leader we currently believe in.
        let leader = self
            .state
            .leader()
            .ok_or(RaftError::NotLeader { leader: None })?;
        let response = tokio::time::timeout(
            self.options.rpc_timeout(),
            self.transport.apply_log(&leader, ApplyRequest { body }),
        )
        .await
        .map_err(|_| RaftError::DeadlineExceeded)?
        .map_err(RaftError::transport)?;
        match response {
            ApplyResponse::Meta(meta) => Ok(meta),
            ApplyResponse::Error(message) => Err(RaftError::Remote(message)),
        }
    }

    /// Submit an opaque application command.
    pub async fn apply_command(&self, command: impl Into<Vec<u8>>) -> Result<LogMeta, RaftError> {
        self.apply(LogBody::command(command.into())).await
    }

    /// Add `peer` to the cluster by starting a joint-consensus transition
    /// from the committed membership.
    pub async fn register(&self, peer: Peer) -> Result<LogMeta, RaftError> {
        let target = self.configurations.committed().current().with(peer);
        let body = self.configurations.initiate_transition(target)?;
        self.apply(body).await
    }

    /// Start a membership transition to an arbitrary target set.
    pub async fn change_membership(&self, target: PeerSet) -> Result<LogMeta, RaftError> {
        let body = self.configurations.initiate_transition(target)?;
        self.apply(body).await
    }

    /// Run the server until shutdown. Can only be called once.
    ///
    /// Bootstraps the initial configuration (or verifies membership on a
    /// restored cluster), starts the transport, and enters the main loop.
    /// Resolves with the first fatal error, or `Ok` on a clean shutdown.
    pub async fn serve(self: &Arc<Self>) -> Result<(), RaftError> {
        if self.serve_flag.swap(true, Ordering::AcqRel) {
            return Err(RaftError::fatal("serve() can only be called once"));
        }
        let (mut core, mut channels) = self
            .core
            .lock()
            .expect("core lock poisoned")
            .take()
            .expect("server core already consumed");

        core.bootstrap()?;

        // The transport feeds the inbound RPC queue; a serve failure takes
        // the whole server down.
        let transport = Arc::clone(&self.transport);
        let rpc_tx = self.rpc_tx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.serve(rpc_tx).await {
                let _ = shutdown_tx.send(Some(RaftError::transport(err))).await;
            }
        });

        let result = core.run(&mut channels).await;

        if let Err(err) = self.transport.close().await {
            tracing::warn!(error = %err, "error closing transport");
        }
        tracing::info!(id = %self.id, "server stopped");
        result
    }

    /// Request a graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(None).await;
    }
}

/// Receivers owned by the main loop, kept apart from the mutable core so
/// `select!` can borrow them while handlers borrow the core.
pub(crate) struct CoreChannels {
    rpc_rx: mpsc::Receiver<Rpc>,
    log_ops_rx: mpsc::Receiver<LogOp>,
    commit_rx: mpsc::Receiver<u64>,
    capture_rx: mpsc::Receiver<CaptureRequest>,
    restore_rx: mpsc::Receiver<RestoreRequest>,
    shutdown_rx: mpsc::Receiver<Option<RaftError>>,
}

/// The single-mutator half of the server, owned by the main loop.
pub(crate) struct ServerCore {
    id: String,
    options: RaftConfig,
    state: Arc<ServerState>,
    stable: StableState,
    log: Arc<dyn LogProvider>,
    configurations: Arc<ConfigurationStore>,
    state_machine: StateMachineProxy,
    transport: Arc<dyn Transport>,
    snapshots: Arc<SnapshotService>,
    commit_tx: mpsc::Sender<u64>,
    /// Publishes the last log index so replication drivers wake on appends.
    last_index_tx: watch::Sender<u64>,
    /// Set when a newly appended configuration requires the current role
    /// loop to return to the dispatcher.
    conf_changed: bool,
    shutdown_err: Option<RaftError>,
}

impl ServerCore {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> &ServerState {
        &self.state
    }

    pub(crate) fn log(&self) -> &dyn LogProvider {
        self.log.as_ref()
    }

    pub(crate) fn configurations(&self) -> Arc<ConfigurationStore> {
        Arc::clone(&self.configurations)
    }

    pub(crate) fn snapshots(&self) -> Arc<SnapshotService> {
        Arc::clone(&self.snapshots)
    }

    // -- State transitions ----------------------------------------------------

    pub(crate) fn alter_leader(&mut self, leader: Option<Peer>) {
        tracing::info!(id = %self.id, new_leader = ?leader, "alter leader");
        self.state.set_leader(leader);
    }

    fn alter_role(&mut self, role: Role) {
        tracing::info!(id = %self.id, new_role = role.as_str(), "alter role");
        self.state.set_role(role);
    }

    /// Persist and adopt a new term. Failure to persist is fatal.
    pub(crate) fn alter_term(&mut self, term: u64) {
        tracing::info!(id = %self.id, new_term = term, "alter term");
        if let Err(err) = self.stable.set_current_term(term) {
            self.fatal(format!("failed to persist current term: {err}"));
            return;
        }
        self.state.set_current_term(term);
        metrics::gauge!(crate::metrics::CURRENT_TERM).set(term as f64);
    }

    /// Convert to follower. Only legal from Candidate or Leader or Follower;
    /// there is no role below Follower to step down from.
    pub(crate) fn stepdown_follower(&mut self, leader: Option<Peer>) {
        self.state.set_leader(leader);
        self.alter_role(Role::Follower);
    }

    /// Durably record a granted vote. Failure to persist is fatal.
    pub(crate) fn record_vote(&mut self, term: u64, candidate: &str) {
        if let Err(err) = self.stable.set_last_vote(term, candidate) {
            self.fatal(format!("failed to persist vote: {err}"));
            return;
        }
        self.state.set_last_vote(VoteSummary {
            term,
            candidate: candidate.to_string(),
        });
    }

    /// Broken invariant or storage corruption: begin shutdown with an error.
    pub(crate) fn fatal(&mut self, message: String) {
        tracing::error!(id = %self.id, %message, "fatal error");
        self.internal_shutdown(Some(RaftError::Fatal(message)));
    }

    fn internal_shutdown(&mut self, err: Option<RaftError>) {
        if !self.state.begin_shutdown() {
            return;
        }
        tracing::info!(id = %self.id, error = ?err, "ready to shutdown");
        self.snapshots.stop_scheduler();
        if self.shutdown_err.is_none() {
            self.shutdown_err = err;
        }
    }

    fn take_conf_changed(&mut self) -> bool {
        std::mem::take(&mut self.conf_changed)
    }

    // -- Log mutation (main loop only) ----------------------------------------

    /// Append client bodies, assigning contiguous indices under the current
    /// term. Newly appended configurations become `latest` immediately.
    pub(crate) fn append_new(&mut self, bodies: Vec<LogBody>) -> Result<Vec<LogMeta>, RaftError> {
        // A second joint configuration must not start while one is in
        // flight; proxied membership changes are validated here, on the
        // leader, not just where they were submitted.
        for body in bodies.iter().filter(|b| b.kind == LogKind::Configuration) {
            let configuration = body
                .decode_configuration()
                .map_err(|err| RaftError::fatal(format!("undecodable configuration body: {err}")))?;
            if configuration.is_joint() && self.configurations.latest().is_joint() {
                return Err(RaftError::InTransition);
            }
        }
        let term = self.state.current_term();
        let mut index = self.state.last_log_index();
        let entries: Vec<LogEntry> = bodies
            .into_iter()
            .map(|body| {
                index += 1;
                LogEntry { index, term, body }
            })
            .collect();
        let metas = entries.iter().map(LogEntry::meta).collect();
        self.append_entries_to_log(entries)?;
        Ok(metas)
    }

    /// Store entries that already carry their position (replication path)
    /// or were just assigned one (client path), then publish the new range
    /// and adopt any configuration they carry.
    fn append_entries_to_log(&mut self, entries: Vec<LogEntry>) -> Result<(), RaftError> {
        let configuration = entries
            .iter()
            .rev()
            .find(|e| e.body.kind == LogKind::Configuration)
            .map(|e| {
                e.body.decode_configuration().map(|mut c| {
                    c.log_index = e.index;
                    c
                })
            })
            .transpose()
            .map_err(|err| RaftError::fatal(format!("undecodable configuration entry: {err}")))?;

        self.log
            .append(entries)
            .map_err(|err| RaftError::fatal(format!("log append failed: {err}")))?;
        self.refresh_log_range()?;

        if let Some(configuration) = configuration {
            tracing::info!(id = %self.id, configuration = ?configuration, "configuration has been updated");
            self.configurations.set_latest(configuration);
            self.conf_changed = true;
        }
        Ok(())
    }

    /// Follower-side reconciliation: truncate on the first conflicting
    /// entry, then append whatever is genuinely new (Raft §5.3). Applying
    /// the same batch twice is a no-op.
    pub(crate) fn reconcile_entries(&mut self, entries: Vec<LogEntry>) -> Result<(), RaftError> {
        let mut first_append = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            match self
                .log
                .term(entry.index)
                .map_err(|err| RaftError::fatal(format!("log read failed: {err}")))?
            {
                Some(term) if term == entry.term => {
                    // Already have it; skip.
                    first_append = i + 1;
                }
                Some(_) => {
                    // Conflict: drop this entry and everything after it.
                    if entry.index <= self.state.commit_index() {
                        return Err(RaftError::fatal(format!(
                            "conflicting entry at committed index {}",
                            entry.index
                        )));
                    }
                    self.log
                        .trim_suffix(entry.index)
                        .map_err(|err| RaftError::fatal(format!("log truncate failed: {err}")))?;
                    self.refresh_log_range()?;
                    break;
                }
                None if entry.index <= self.state.commit_index() => {
                    // Compacted into a snapshot; committed entries are
                    // identical everywhere, so there is nothing to store.
                    first_append = i + 1;
                }
                None => break,
            }
        }
        let remainder: Vec<LogEntry> = entries.into_iter().skip(first_append).collect();
        if remainder.is_empty() {
            return Ok(());
        }
        self.append_entries_to_log(remainder)
    }

    fn refresh_log_range(&mut self) -> Result<(), RaftError> {
        let first = self
            .log
            .first_index()
            .map_err(|err| RaftError::fatal(format!("log read failed: {err}")))?;
        let last = self
            .log
            .last_index()
            .map_err(|err| RaftError::fatal(format!("log read failed: {err}")))?;
        self.state.set_log_range(first, last);
        let _ = self.last_index_tx.send(last);
        Ok(())
    }

    // -- Commit advancement ---------------------------------------------------

    /// Advance the commit index and apply everything newly committed, in
    /// log order. Configuration entries drive joint-consensus completion.
    pub(crate) fn commit_and_apply(&mut self, commit_index: u64) {
        let mut commit_index = commit_index;
        let last_log_index = self.state.last_log_index();
        if commit_index > last_log_index {
            // The commit index never overflows the log.
            commit_index = last_log_index;
        }
        if commit_index <= self.state.commit_index() {
            return;
        }
        let (last_applied, _) = self.state.last_applied();
        if last_applied > commit_index {
            self.fatal(format!(
                "confusing condition: last applied {last_applied} > commit index {commit_index}"
            ));
            return;
        }
        self.state.set_commit_index(commit_index);
        metrics::gauge!(crate::metrics::COMMIT_INDEX).set(commit_index as f64);

        let first = last_applied + 1;
        tracing::debug!(id = %self.id, first_index = first, last_index = commit_index, "ready to apply logs");
        let mut commit_term = 0;
        let mut last_configuration: Option<LogEntry> = None;
        for i in first..=commit_index {
            let entry = match self.log.entry(i) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.fatal(format!("log gap detected at index {i}"));
                    return;
                }
                Err(err) => {
                    self.fatal(format!("log read failed at index {i}: {err}"));
                    return;
                }
            };
            if i == commit_index {
                commit_term = entry.term;
            }
            match entry.body.kind {
                LogKind::Command => self.state_machine.apply(entry.meta(), &entry.body.data),
                LogKind::Configuration => last_configuration = Some(entry),
            }
        }

        if let Some(entry) = last_configuration {
            self.commit_configuration(entry);
        }

        self.state.set_last_applied(commit_index, commit_term);
        metrics::gauge!(crate::metrics::LAST_APPLIED).set(commit_index as f64);
    }

    /// A configuration entry just committed: mark it committed, and if it is
    /// the joint configuration currently in flight, the leader appends the
    /// post-transition configuration to finish the handover.
    fn commit_configuration(&mut self, entry: LogEntry) {
        let committed = match entry.body.decode_configuration() {
            Ok(mut configuration) => {
                configuration.log_index = entry.index;
                configuration
            }
            Err(err) => {
                self.fatal(format!("undecodable committed configuration: {err}"));
                return;
            }
        };

        let latest = self.configurations.latest();
        if self.state.role() == Role::Leader
            && latest.is_joint()
            && latest.log_index == entry.index
        {
            match self.configurations.commit_transition() {
                Ok(body) => {
                    if let Err(err) = self.append_new(vec![body]) {
                        tracing::warn!(error = %err, "failed to append post-transition configuration");
                    }
                }
                Err(err) => self.fatal(err.to_string()),
            }
        }
        self.configurations.set_committed(committed);
    }

    // -- Bootstrap ------------------------------------------------------------

    /// First node in a cluster: append the initial configuration holding
    /// only ourselves. Restored node: verify we are in the peer list and
    /// that our endpoint has not silently changed.
    fn bootstrap(&mut self) -> Result<(), RaftError> {
        let latest = self.configurations.latest();
        if latest.peers().is_empty() {
            if !self.options.bootstrap {
                tracing::info!(id = %self.id, "blank node waiting to join a cluster");
                return Ok(());
            }
            let configuration = Configuration::new(
                Membership::Stable(PeerSet::new(vec![Peer::new(
                    self.id.clone(),
                    self.transport.endpoint(),
                )])),
                0,
            );
            let body = LogBody::configuration(&configuration)
                .map_err(|err| RaftError::fatal(format!("cannot encode bootstrap configuration: {err}")))?;
            self.append_new(vec![body])?;
            self.stable.set_bootstrapped().map_err(RaftError::from)?;
            self.take_conf_changed();
            tracing::info!(id = %self.id, "bootstrapped as the first node");
            return Ok(());
        }

        match latest.peer(&self.id) {
            Some(peer) if peer.endpoint == self.transport.endpoint() => Ok(()),
            Some(peer) => Err(RaftError::fatal(format!(
                "confusing condition: peer {} is registered with endpoint {} but listens on {}",
                self.id,
                peer.endpoint,
                self.transport.endpoint()
            ))),
            None => Err(RaftError::fatal(format!(
                "server {} is not in the latest configuration's peer list",
                self.id
            ))),
        }
    }

    // -- Main loop ------------------------------------------------------------

    async fn run(&mut self, channels: &mut CoreChannels) -> Result<(), RaftError> {
        while !self.state.is_shutdown() {
            match self.state.role() {
                Role::Leader => self.run_loop_leader(channels).await,
                Role::Candidate => self.run_loop_candidate(channels).await,
                Role::Follower => self.run_loop_follower(channels).await,
            }
        }
        match self.shutdown_err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_loop_follower(&mut self, channels: &mut CoreChannels) {
        tracing::info!(id = %self.id, term = self.state.current_term(), "run follower loop");
        self.snapshots.start_scheduler();

        let mut timer = Box::pin(tokio::time::sleep(random_timeout(
            self.options.follower_timeout(),
            self.options.timer_random_ratio,
        )));

        while self.state.role() == Role::Follower && !self.state.is_shutdown() {
            tokio::select! {
                () = &mut timer => {
                    // A server outside its own configuration never
                    // campaigns; it waits for a leader to contact it.
                    if !self.configurations.latest().contains(&self.id) {
                        tracing::debug!(id = %self.id, "timed out outside the configuration; staying follower");
                        timer = Box::pin(tokio::time::sleep(random_timeout(
                            self.options.follower_timeout(),
                            self.options.timer_random_ratio,
                        )));
                        continue;
                    }
                    tracing::info!(id = %self.id, "follower timed out");
                    self.alter_role(Role::Candidate);
                    break;
                }
                Some(rpc) = channels.rpc_rx.recv() => {
                    if self.dispatch_rpc(rpc) {
                        timer = Box::pin(tokio::time::sleep(random_timeout(
                            self.options.follower_timeout(),
                            self.options.timer_random_ratio,
                        )));
                    }
                }
                Some(op) = channels.log_ops_rx.recv() => self.handle_log_op(op),
                Some(commit_index) = channels.commit_rx.recv() => self.commit_and_apply(commit_index),
                Some(request) = channels.capture_rx.recv() => self.handle_capture(request),
                Some(request) = channels.restore_rx.recv() => self.handle_restore(request),
                Some(err) = channels.shutdown_rx.recv() => {
                    self.internal_shutdown(err);
                    break;
                }
            }
            if self.take_conf_changed() {
                break;
            }
        }
        self.snapshots.stop_scheduler();
    }

    async fn run_loop_candidate(&mut self, channels: &mut CoreChannels) {
        tracing::info!(id = %self.id, term = self.state.current_term(), "run candidate loop");

        // Start the election: new term, durable self-vote, fan out.
        let term = self.state.current_term() + 1;
        self.alter_term(term);
        let own_id = self.id.clone();
        self.record_vote(term, &own_id);
        if self.state.is_shutdown() {
            return;
        }
        metrics::counter!(crate::metrics::ELECTIONS_TOTAL).increment(1);

        let configuration = self.configurations.latest();
        let (last_log_term, last_log_index) = match self.log.last_term_index() {
            Ok(pair) => pair,
            Err(err) => {
                self.fatal(format!("log read failed: {err}"));
                return;
            }
        };
        let request = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };

        let peers = configuration.peers();
        let (vote_tx, mut vote_rx) = mpsc::channel(peers.len() + 1);
        let mut solicitations = Vec::new();
        for peer in peers.into_iter().filter(|p| p.id != self.id) {
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            let vote_tx = vote_tx.clone();
            let timeout = self.options.rpc_timeout();
            solicitations.push(tokio::spawn(async move {
                match tokio::time::timeout(timeout, transport.request_vote(&peer, request)).await {
                    Ok(Ok(response)) => {
                        let _ = vote_tx.send(response).await;
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(peer = %peer.id, error = %err, "error requesting vote");
                    }
                    Err(_) => {
                        tracing::debug!(peer = %peer.id, "vote request timed out");
                    }
                }
            }));
        }
        // Our own durable vote participates in the tally like any other.
        let _ = vote_tx.try_send(crate::message::RequestVoteResponse {
            server_id: self.id.clone(),
            term,
            granted: true,
        });
        drop(vote_tx);

        let mut timer = Box::pin(tokio::time::sleep(random_timeout(
            self.options.election_timeout(),
            self.options.timer_random_ratio,
        )));
        let mut granted: Vec<String> = Vec::new();

        while self.state.role() == Role::Candidate && !self.state.is_shutdown() {
            tokio::select! {
                () = &mut timer => {
                    tracing::info!(id = %self.id, "timed out in candidate loop");
                    break;
                }
                Some(response) = vote_rx.recv() => {
                    if response.term > self.state.current_term() {
                        tracing::info!(id = %self.id, "local term is stale");
                        self.stepdown_follower(None);
                        self.alter_term(response.term);
                        break;
                    }
                    if response.granted
                        && configuration.contains(&response.server_id)
                        && !granted.iter().any(|id| id == &response.server_id)
                    {
                        granted.push(response.server_id);
                        let acked: Vec<&str> = granted.iter().map(String::as_str).collect();
                        if configuration.decided(&acked) {
                            tracing::info!(id = %self.id, term, "won the election");
                            self.alter_role(Role::Leader);
                            let leader = self.configurations.latest().peer(&self.id);
                            self.alter_leader(leader);
                            break;
                        }
                    }
                }
                Some(rpc) = channels.rpc_rx.recv() => { self.dispatch_rpc(rpc); }
                Some(commit_index) = channels.commit_rx.recv() => self.commit_and_apply(commit_index),
                Some(request) = channels.restore_rx.recv() => self.handle_restore(request),
                Some(err) = channels.shutdown_rx.recv() => {
                    self.internal_shutdown(err);
                    break;
                }
            }
            if self.take_conf_changed() {
                break;
            }
        }

        // Cancel outstanding solicitations along with their in-flight calls.
        for task in solicitations {
            task.abort();
        }
    }

    async fn run_loop_leader(&mut self, channels: &mut CoreChannels) {
        tracing::info!(id = %self.id, term = self.state.current_term(), "run leader loop");

        // stepdown_rx is signalled when a reply reveals a newer term.
        let (stepdown_tx, mut stepdown_rx) = mpsc::channel(1);
        self.snapshots.start_scheduler();
        let scheduler = ReplScheduler::start(
            ReplContext {
                id: self.id.clone(),
                options: self.options.clone(),
                state: Arc::clone(&self.state),
                log: Arc::clone(&self.log),
                transport: Arc::clone(&self.transport),
                snapshots: Arc::clone(&self.snapshots),
                commit_tx: self.commit_tx.clone(),
                stepdown_tx,
                last_index_rx: self.last_index_tx.subscribe(),
            },
            self.configurations.latest(),
        );

        while self.state.role() == Role::Leader && !self.state.is_shutdown() {
            tokio::select! {
                Some(commit_index) = channels.commit_rx.recv() => self.commit_and_apply(commit_index),
                Some(op) = channels.log_ops_rx.recv() => self.handle_log_op(op),
                Some(rpc) = channels.rpc_rx.recv() => { self.dispatch_rpc(rpc); }
                Some(request) = channels.capture_rx.recv() => self.handle_capture(request),
                Some(request) = channels.restore_rx.recv() => self.handle_restore(request),
                Some(term) = stepdown_rx.recv() => {
                    // The leader in the newer term will introduce itself.
                    self.stepdown_follower(None);
                    self.alter_term(term);
                    break;
                }
                Some(err) = channels.shutdown_rx.recv() => {
                    self.internal_shutdown(err);
                    break;
                }
            }
            if self.take_conf_changed() {
                break;
            }
        }

        scheduler.stop().await;
        self.snapshots.stop_scheduler();
    }

    // -- Channel servicing ----------------------------------------------------

    fn handle_log_op(&mut self, op: LogOp) {
        match op {
            LogOp::Append { bodies, reply } => {
                if self.state.role() != Role::Leader {
                    let _ = reply.send(Err(RaftError::NotLeader {
                        leader: self.state.leader(),
                    }));
                    return;
                }
                let _ = reply.send(self.append_new(bodies));
            }
            LogOp::TrimPrefix { up_to, reply } => {
                let result = self
                    .log
                    .trim_prefix(up_to)
                    .map_err(RaftError::from)
                    .and_then(|()| self.refresh_log_range());
                let _ = reply.send(result);
            }
        }
    }

    /// Capture the state machine at the applied point for the snapshot
    /// service. Runs inline, so the captured pair is consistent.
    fn handle_capture(&mut self, request: CaptureRequest) {
        let (index, term) = self.state.last_applied();
        let result = self
            .state_machine
            .snapshot()
            .map(|data| CapturedSnapshot {
                index,
                term,
                configuration: self.configurations.committed(),
                data,
            })
            .map_err(RaftError::from);
        let _ = request.reply.send(result);
    }

    /// Adopt a fully written snapshot: restore the state machine, replace
    /// the log, and move the commit state to the snapshot's position.
    fn handle_restore(&mut self, request: RestoreRequest) {
        let meta = request.meta;
        let (last_applied, _) = self.state.last_applied();
        if meta.index <= last_applied {
            // Already at or past this point; nothing to adopt.
            let _ = request.reply.send(Ok(()));
            return;
        }

        let result = (|| -> Result<(), RaftError> {
            let (_, reader) = self.snapshots.provider().open(&meta.id)?;
            self.state_machine.restore(reader)?;
            self.log
                .reset(meta.index, meta.term)
                .map_err(|err| RaftError::fatal(format!("log reset failed: {err}")))?;
            self.refresh_log_range()?;
            self.state.set_commit_index(meta.index);
            self.state.set_last_applied(meta.index, meta.term);
            self.configurations.set_latest(meta.configuration.clone());
            self.configurations.set_committed(meta.configuration.clone());
            self.conf_changed = true;
            metrics::gauge!(crate::metrics::COMMIT_INDEX).set(meta.index as f64);
            metrics::gauge!(crate::metrics::LAST_APPLIED).set(meta.index as f64);
            tracing::info!(id = %self.id, index = meta.index, term = meta.term, "restored from snapshot");
            Ok(())
        })();
        if let Err(err) = &result {
            if err.is_fatal() {
                self.fatal(err.to_string());
            } else {
                tracing::warn!(id = %self.id, error = %err, "snapshot restore failed");
            }
        }
        let _ = request.reply.send(result);
    }
}

/// Scan the log backwards for the newest configuration entry.
fn recover_configuration(log: &dyn LogProvider) -> anyhow::Result<Option<Configuration>> {
    let first = log.first_index()?;
    let last = log.last_index()?;
    if last == 0 {
        return Ok(None);
    }
    for index in (first..=last).rev() {
        if let Some(entry) = log.entry(index)? {
            if entry.body.kind == LogKind::Configuration {
                let mut configuration = entry.body.decode_configuration()?;
                configuration.log_index = entry.index;
                return Ok(Some(configuration));
            }
        }
    }
    Ok(None)
}

/// A duration in `[base, base * (1 + ratio)]`, uniformly random.
fn random_timeout(base: Duration, ratio: f64) -> Duration {
    let offset = rand::thread_rng().gen_range(0.0..=ratio.max(0.0));
    base + base.mul_f64(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvStateMachine;
    use crate::message::{AppendEntriesRequest, RequestVoteRequest};
    use crate::rpc::{Request, Response};
    use crate::storage::memory::{MemoryLogProvider, MemorySnapshotStore, MemoryStableStore};
    use crate::transport::memory::MemoryNetwork;

    #[test]
    fn random_timeout_stays_in_range() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let t = random_timeout(base, 0.5);
            assert!(t >= base);
            assert!(t <= Duration::from_millis(150));
        }
    }

    #[test]
    fn random_timeout_with_zero_ratio_is_base() {
        let base = Duration::from_millis(100);
        assert_eq!(random_timeout(base, 0.0), base);
    }

    fn member_peers(members: &[&str]) -> Vec<Peer> {
        members
            .iter()
            .map(|m| Peer::new(*m, format!("mem://{m}")))
            .collect()
    }

    fn command_entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            body: LogBody::command(format!("k{index}=v{index}").into_bytes()),
        }
    }

    /// Build a core whose log starts with the configuration for `members`
    /// at index 1 (term 0), followed by `seed` entries.
    fn test_core(
        id: &str,
        members: &[&str],
        seed: Vec<LogEntry>,
    ) -> (ServerCore, CoreChannels, Arc<KvStateMachine>) {
        let network = MemoryNetwork::new();
        let transport = network.transport(&format!("mem://{id}"));
        let log = Arc::new(MemoryLogProvider::new());
        let configuration = Configuration::new(
            Membership::Stable(PeerSet::new(member_peers(members))),
            1,
        );
        log.append(vec![LogEntry {
            index: 1,
            term: 0,
            body: LogBody::configuration(&configuration).unwrap(),
        }])
        .unwrap();
        log.append(seed).unwrap();
        let kv = Arc::new(KvStateMachine::new());
        let server = Server::new(
            ServerCoreOptions {
                id: id.to_string(),
                log,
                stable: Arc::new(MemoryStableStore::new()),
                snapshots: Arc::new(MemorySnapshotStore::new()),
                state_machine: kv.clone(),
                transport,
            },
            RaftConfig::default(),
        )
        .unwrap();
        let (core, channels) = server.core.lock().unwrap().take().unwrap();
        (core, channels, kv)
    }

    async fn dispatch(core: &mut ServerCore, request: Request) -> Response {
        let (rpc, reply_rx) = Rpc::new(request);
        core.dispatch_rpc(rpc);
        reply_rx.await.unwrap().unwrap()
    }

    fn append_request(
        term: u64,
        leader_id: &str,
        prev: (u64, u64),
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Request {
        Request::AppendEntries(AppendEntriesRequest {
            term,
            leader_id: leader_id.to_string(),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit,
        })
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_terms() {
        let (mut core, _channels, _kv) = test_core("b", &["a", "b", "c"], vec![]);
        core.alter_term(5);

        let response = dispatch(&mut core, append_request(3, "a", (0, 0), vec![], 0)).await;
        match response {
            Response::AppendEntries(r) => {
                assert!(!r.success);
                assert_eq!(r.term, 5);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        // The stale call must not have disturbed local state.
        assert_eq!(core.state().current_term(), 5);
    }

    #[tokio::test]
    async fn append_entries_repairs_a_diverged_log() {
        // Follower b holds entries 2..=7 from term 3; the term-5 leader
        // ships 4..=10 from term 5 with a matching prefix at index 3.
        let seed: Vec<LogEntry> = (2..=7).map(|i| command_entry(i, 3)).collect();
        let (mut core, _channels, _kv) = test_core("b", &["a", "b", "c"], seed);
        core.alter_term(3);

        let entries: Vec<LogEntry> = (4..=10).map(|i| command_entry(i, 5)).collect();
        let response =
            dispatch(&mut core, append_request(5, "a", (3, 3), entries.clone(), 0)).await;
        match response {
            Response::AppendEntries(r) => {
                assert!(r.success);
                assert_eq!(r.term, 5);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(core.state().current_term(), 5);
        assert_eq!(core.state().leader().unwrap().id, "a");
        assert_eq!(core.log().last_term_index().unwrap(), (5, 10));
        // The matching prefix survived untouched.
        assert_eq!(core.log().entry(3).unwrap().unwrap().term, 3);
        assert_eq!(core.log().entry(4).unwrap().unwrap().term, 5);

        // Replaying the same batch is a no-op after the first success.
        let response = dispatch(&mut core, append_request(5, "a", (3, 3), entries, 0)).await;
        match response {
            Response::AppendEntries(r) => assert!(r.success),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(core.log().last_term_index().unwrap(), (5, 10));
    }

    #[tokio::test]
    async fn append_entries_applies_committed_commands() {
        let (mut core, _channels, kv) = test_core("b", &["a", "b"], vec![]);

        let entries = vec![LogEntry {
            index: 2,
            term: 1,
            body: LogBody::command(b"x=1".to_vec()),
        }];
        let response = dispatch(&mut core, append_request(1, "a", (1, 0), entries, 2)).await;
        match response {
            Response::AppendEntries(r) => assert!(r.success),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(core.state().commit_index(), 2);
        assert_eq!(core.state().last_applied(), (2, 1));
        assert_eq!(kv.value("x"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let (mut core, _channels, _kv) = test_core("a", &["a", "b", "c"], vec![]);

        let vote = |candidate: &str, term| {
            Request::RequestVote(RequestVoteRequest {
                term,
                candidate_id: candidate.to_string(),
                last_log_index: 1,
                last_log_term: 0,
            })
        };

        match dispatch(&mut core, vote("b", 1)).await {
            Response::RequestVote(r) => assert!(r.granted),
            other => panic!("unexpected response: {other:?}"),
        }
        // A different candidate in the same term is refused.
        match dispatch(&mut core, vote("c", 1)).await {
            Response::RequestVote(r) => assert!(!r.granted),
            other => panic!("unexpected response: {other:?}"),
        }
        // The same candidate asking again is granted again.
        match dispatch(&mut core, vote("b", 1)).await {
            Response::RequestVote(r) => assert!(r.granted),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(core.state().last_vote().candidate, "b");
    }

    #[tokio::test]
    async fn votes_refused_to_candidates_with_stale_logs() {
        let seed: Vec<LogEntry> = (2..=4).map(|i| command_entry(i, 2)).collect();
        let (mut core, _channels, _kv) = test_core("a", &["a", "b", "c"], seed);
        core.alter_term(2);

        // Candidate whose last entry is older by term.
        let response = dispatch(
            &mut core,
            Request::RequestVote(RequestVoteRequest {
                term: 3,
                candidate_id: "b".to_string(),
                last_log_index: 9,
                last_log_term: 1,
            }),
        )
        .await;
        match response {
            Response::RequestVote(r) => {
                assert!(!r.granted);
                assert_eq!(r.term, 3);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Same last term but shorter log.
        let response = dispatch(
            &mut core,
            Request::RequestVote(RequestVoteRequest {
                term: 4,
                candidate_id: "c".to_string(),
                last_log_index: 3,
                last_log_term: 2,
            }),
        )
        .await;
        match response {
            Response::RequestVote(r) => assert!(!r.granted),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn leader_steps_down_on_higher_term_append() {
        let (mut core, _channels, _kv) = test_core("a", &["a", "b", "c"], vec![]);
        core.alter_term(4);
        core.state().set_role(Role::Leader);

        let response = dispatch(&mut core, append_request(5, "b", (1, 0), vec![], 0)).await;
        match response {
            Response::AppendEntries(r) => {
                assert!(r.success);
                assert_eq!(r.term, 5);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(core.state().role(), Role::Follower);
        assert_eq!(core.state().current_term(), 5);
        assert_eq!(core.state().leader().unwrap().id, "b");
    }

    #[tokio::test]
    async fn apply_log_on_non_leader_names_the_leader() {
        let (mut core, _channels, _kv) = test_core("b", &["a", "b", "c"], vec![]);
        core.alter_leader(Some(Peer::new("a", "mem://a")));
        let response = dispatch(
            &mut core,
            Request::ApplyLog(ApplyRequest {
                body: LogBody::command(b"x=1".to_vec()),
            }),
        )
        .await;
        match response {
            Response::ApplyLog(crate::message::ApplyResponse::Error(message)) => {
                assert!(message.contains("not the cluster leader"));
                // The refusal carries the leader hint for the retry.
                assert!(message.contains("current leader is a"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn leader_append_assigns_contiguous_positions() {
        let (mut core, _channels, _kv) = test_core("a", &["a"], vec![]);
        core.alter_term(1);
        core.state().set_role(Role::Leader);

        let metas = core
            .append_new(vec![
                LogBody::command(b"x=1".to_vec()),
                LogBody::command(b"y=2".to_vec()),
            ])
            .unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0], LogMeta { index: 2, term: 1 });
        assert_eq!(metas[1], LogMeta { index: 3, term: 1 });
        assert_eq!(core.state().last_log_index(), 3);
    }
}

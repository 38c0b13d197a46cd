//! Inbound RPC envelope and the request handlers.
//!
//! The transport wraps every received request in an [`Rpc`] carrying a
//! oneshot reply channel bounded to exactly one response, and pushes it
//! onto the core's inbound queue. The main loop dispatches each RPC inline:
//! handlers never suspend, they only touch core state and enqueue work.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{generate_request_id, RaftError};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyRequest, ApplyResponse,
    InstallSnapshotMeta, InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::server::ServerCore;
use crate::state::Role;

/// A snapshot install: metadata up front, payload streaming in behind it.
pub struct InstallSnapshotRequest {
    pub meta: InstallSnapshotMeta,
    /// Payload frames, in order, closed by the sender.
    pub data: mpsc::Receiver<Bytes>,
}

/// Any request the peer transport can deliver.
pub enum Request {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
    ApplyLog(ApplyRequest),
}

impl Request {
    fn kind(&self) -> &'static str {
        match self {
            Request::AppendEntries(_) => "append_entries",
            Request::RequestVote(_) => "request_vote",
            Request::InstallSnapshot(_) => "install_snapshot",
            Request::ApplyLog(_) => "apply_log",
        }
    }
}

/// The response paired with each [`Request`] variant.
#[derive(Debug)]
pub enum Response {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    ApplyLog(ApplyResponse),
}

pub(crate) type RpcReply = oneshot::Sender<Result<Response, RaftError>>;

/// One inbound RPC: a request plus its single-use reply channel.
pub struct Rpc {
    pub request_id: String,
    pub request: Request,
    pub(crate) reply: RpcReply,
}

impl Rpc {
    /// Wrap a request; the returned receiver completes exactly once.
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Result<Response, RaftError>>) {
        let (reply, reply_rx) = oneshot::channel();
        (
            Self {
                request_id: generate_request_id(),
                request,
                reply,
            },
            reply_rx,
        )
    }
}

// -- Handlers (run inline on the main loop) -----------------------------------

impl ServerCore {
    /// Dispatch one inbound RPC. Returns true when the RPC was legitimate
    /// traffic from the current term's leader or a granted vote, which is
    /// what resets the follower timer.
    pub(crate) fn dispatch_rpc(&mut self, rpc: Rpc) -> bool {
        metrics::counter!(crate::metrics::RPCS_TOTAL, "kind" => rpc.request.kind()).increment(1);
        let request_id = rpc.request_id;
        match rpc.request {
            Request::AppendEntries(request) => {
                tracing::debug!(%request_id, leader = %request.leader_id, term = request.term,
                    entries = request.entries.len(), "incoming RPC: AppendEntries");
                let (response, legitimate) = self.handle_append_entries(request);
                let _ = rpc.reply.send(Ok(Response::AppendEntries(response)));
                legitimate
            }
            Request::RequestVote(request) => {
                tracing::info!(%request_id, candidate = %request.candidate_id, term = request.term,
                    "incoming RPC: RequestVote");
                let response = self.handle_request_vote(request);
                let granted = response.granted;
                let _ = rpc.reply.send(Ok(Response::RequestVote(response)));
                granted
            }
            Request::InstallSnapshot(request) => {
                tracing::info!(%request_id, leader = %request.meta.leader_id,
                    index = request.meta.index, "incoming RPC: InstallSnapshot");
                self.handle_install_snapshot(request, rpc.reply)
            }
            Request::ApplyLog(request) => {
                tracing::debug!(%request_id, "incoming RPC: ApplyLog");
                let response = self.handle_apply_log(request);
                let _ = rpc.reply.send(Ok(Response::ApplyLog(response)));
                false
            }
        }
    }

    /// AppendEntries consistency and append path (Raft §5.3).
    fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> (AppendEntriesResponse, bool) {
        let mut response = AppendEntriesResponse {
            server_id: self.id().to_string(),
            term: self.state().current_term(),
            success: false,
        };

        if request.term < response.term {
            tracing::debug!(term = request.term, "incoming term is stale");
            return (response, false);
        }

        // A snapshot install is replacing our state; do not let conflicting
        // entries interleave. The leader retries after the restore settles.
        if self.state().restoring() {
            return (response, true);
        }

        // Track the leader this traffic came from.
        if self.state().leader().map(|p| p.id) != Some(request.leader_id.clone()) {
            let leader = self.configurations().latest().peer(&request.leader_id);
            self.alter_leader(leader);
        }

        if request.term > self.state().current_term() {
            tracing::debug!(term = request.term, "local term is stale");
            if self.state().role() != Role::Follower {
                self.stepdown_follower(self.configurations().latest().peer(&request.leader_id));
            }
            self.alter_term(request.term);
            response.term = request.term;
        } else if self.state().role() == Role::Candidate {
            // A leader already exists for the term we are campaigning in.
            self.stepdown_follower(self.configurations().latest().peer(&request.leader_id));
        }

        if request.prev_log_index > 0 {
            match self.log().term(request.prev_log_index) {
                Ok(Some(term)) if term == request.prev_log_term => {}
                Ok(_) => {
                    tracing::info!(
                        prev_log_index = request.prev_log_index,
                        prev_log_term = request.prev_log_term,
                        "previous log entry is missing or from a different term"
                    );
                    return (response, true);
                }
                Err(err) => {
                    self.fatal(format!("log read failed at {}: {err}", request.prev_log_index));
                    return (response, true);
                }
            }
        }

        if !request.entries.is_empty() {
            if let Err(err) = self.reconcile_entries(request.entries) {
                if err.is_fatal() {
                    self.fatal(err.to_string());
                }
                return (response, true);
            }
        }

        if request.leader_commit > self.state().commit_index() {
            tracing::debug!(new_commit_index = request.leader_commit, "local commit index is stale");
            self.commit_and_apply(request.leader_commit);
        }

        response.success = true;
        (response, true)
    }

    /// RequestVote: one durable vote per term, and only for candidates whose
    /// log is at least as up-to-date as ours (Raft §5.4.1).
    fn handle_request_vote(&mut self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut response = RequestVoteResponse {
            server_id: self.id().to_string(),
            term: self.state().current_term(),
            granted: false,
        };

        if request.term < response.term {
            tracing::debug!(term = request.term, "incoming term is stale");
            return response;
        }

        // Already voted in the current term: grant only a repeat of the same
        // candidate's request. An empty candidate means no vote was ever
        // cast, so a fresh server does not count term 0 as spent.
        let last_vote = self.state().last_vote();
        if self.state().current_term() <= last_vote.term && !last_vote.candidate.is_empty() {
            tracing::debug!(candidate = %last_vote.candidate, "already voted in this term");
            response.granted = last_vote.candidate == request.candidate_id;
            return response;
        }

        if request.term > self.state().current_term() {
            if self.state().role() != Role::Follower {
                self.stepdown_follower(None);
            }
            self.alter_term(request.term);
            response.term = request.term;
        }

        let (last_term, last_index) = match self.log().last_term_index() {
            Ok(pair) => pair,
            Err(err) => {
                self.fatal(format!("log read failed: {err}"));
                return response;
            }
        };

        // The candidate's log must be at least as up-to-date as ours.
        if request.last_log_term < last_term {
            return response;
        }
        if request.last_log_term == last_term && request.last_log_index < last_index {
            return response;
        }

        self.record_vote(self.state().current_term(), &request.candidate_id);
        response.granted = true;
        response
    }

    /// Validate terms inline, then hand the stream to the snapshot service;
    /// the reply is sent once the restore settles.
    fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
        reply: RpcReply,
    ) -> bool {
        let current_term = self.state().current_term();
        if request.meta.term < current_term {
            let _ = reply.send(Ok(Response::InstallSnapshot(InstallSnapshotResponse {
                server_id: self.id().to_string(),
                term: current_term,
                success: false,
            })));
            return false;
        }

        if self.state().leader().map(|p| p.id) != Some(request.meta.leader_id.clone()) {
            let leader = self.configurations().latest().peer(&request.meta.leader_id);
            self.alter_leader(leader);
        }
        if request.meta.term > current_term {
            if self.state().role() != Role::Follower {
                self.stepdown_follower(self.configurations().latest().peer(&request.meta.leader_id));
            }
            self.alter_term(request.meta.term);
        }

        let service = self.snapshots();
        tokio::spawn(service.install_and_respond(request, reply));
        true
    }

    /// ApplyLog: leaders append and reply with the assigned position; every
    /// other role replies `NotLeader`.
    fn handle_apply_log(&mut self, request: ApplyRequest) -> ApplyResponse {
        if self.state().role() != Role::Leader {
            return ApplyResponse::Error(
                RaftError::NotLeader {
                    leader: self.state().leader(),
                }
                .to_string(),
            );
        }
        match self.append_new(vec![request.body]) {
            Ok(metas) => ApplyResponse::Meta(metas[0]),
            Err(err) => ApplyResponse::Error(err.to_string()),
        }
    }
}

//! Pluggable peer transport.
//!
//! A transport carries four request/response operations plus the streaming
//! snapshot install from caller to callee. Inbound traffic is delivered by
//! wrapping each request in an [`Rpc`](crate::rpc::Rpc) and pushing it onto
//! the sender handed to [`Transport::serve`]; each RPC's reply channel is
//! bounded to exactly one response.
//!
//! Cancellation follows the usual future contract: dropping an in-flight
//! call future cancels the call, so callers cancel by selecting against a
//! stop signal. Snapshot streams deliver their metadata before any payload
//! byte and preserve payload order.

use std::future::Future;
use std::io::Read;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyRequest, ApplyResponse,
    InstallSnapshotMeta, InstallSnapshotResponse, Peer, RequestVoteRequest, RequestVoteResponse,
};
use crate::rpc::Rpc;

pub mod http;
pub mod memory;

/// Peer-to-peer transport contract.
pub trait Transport: Send + Sync + 'static {
    /// The address peers reach this transport at.
    fn endpoint(&self) -> String;

    /// Ship a replication batch to `peer`.
    fn append_entries(
        &self,
        peer: &Peer,
        request: AppendEntriesRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<AppendEntriesResponse>> + Send + '_>>;

    /// Solicit a vote from `peer`.
    fn request_vote(
        &self,
        peer: &Peer,
        request: RequestVoteRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<RequestVoteResponse>> + Send + '_>>;

    /// Stream a snapshot to `peer`: metadata first, then the payload read
    /// from `data` until EOF.
    fn install_snapshot(
        &self,
        peer: &Peer,
        meta: InstallSnapshotMeta,
        data: Box<dyn Read + Send>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<InstallSnapshotResponse>> + Send + '_>>;

    /// Forward a client apply to `peer` (used to proxy to the leader).
    fn apply_log(
        &self,
        peer: &Peer,
        request: ApplyRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ApplyResponse>> + Send + '_>>;

    /// Accept inbound traffic, enqueueing each request onto `rpc_tx`, until
    /// the transport is closed. Resolves with an error if serving fails.
    fn serve(
        &self,
        rpc_tx: mpsc::Sender<Rpc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Stop serving and drop peer connections. Idempotent.
    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Chunk size for streaming snapshot payloads.
pub(crate) const SNAPSHOT_CHUNK_SIZE: usize = 4096;

/// Depth of the per-install payload frame queue.
pub(crate) const SNAPSHOT_FRAME_QUEUE: usize = 8;

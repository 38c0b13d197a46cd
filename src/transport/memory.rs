//! In-process transport for tests and single-binary clusters.
//!
//! A [`MemoryNetwork`] routes RPCs between the transports created from it
//! by endpoint, entirely through channels. Links can be severed and healed
//! to simulate partitions, which is what the cluster tests lean on.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::{Transport, SNAPSHOT_CHUNK_SIZE, SNAPSHOT_FRAME_QUEUE};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyRequest, ApplyResponse,
    InstallSnapshotMeta, InstallSnapshotResponse, Peer, RequestVoteRequest, RequestVoteResponse,
};
use crate::rpc::{InstallSnapshotRequest, Request, Response, Rpc};

/// Routing fabric shared by a set of [`MemoryTransport`]s.
pub struct MemoryNetwork {
    inboxes: Mutex<HashMap<String, mpsc::Sender<Rpc>>>,
    /// Severed directed links, as (from, to) endpoint pairs.
    severed: Mutex<HashSet<(String, String)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
            severed: Mutex::new(HashSet::new()),
        })
    }

    /// Create a transport reachable at `endpoint` on this network.
    pub fn transport(self: &Arc<Self>, endpoint: &str) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            endpoint: endpoint.to_string(),
            network: Arc::clone(self),
            closed: watch::channel(false).0,
        })
    }

    /// Sever both directions between `a` and `b`.
    pub fn partition(&self, a: &str, b: &str) {
        let mut severed = self.severed.lock().expect("network lock poisoned");
        severed.insert((a.to_string(), b.to_string()));
        severed.insert((b.to_string(), a.to_string()));
    }

    /// Restore both directions between `a` and `b`.
    pub fn heal(&self, a: &str, b: &str) {
        let mut severed = self.severed.lock().expect("network lock poisoned");
        severed.remove(&(a.to_string(), b.to_string()));
        severed.remove(&(b.to_string(), a.to_string()));
    }

    /// Detach `endpoint` from everything (a fully isolated node).
    pub fn isolate(&self, endpoint: &str) {
        let peers: Vec<String> = {
            let inboxes = self.inboxes.lock().expect("network lock poisoned");
            inboxes.keys().cloned().collect()
        };
        for peer in peers {
            if peer != endpoint {
                self.partition(endpoint, &peer);
            }
        }
    }

    /// Reconnect `endpoint` to everything.
    pub fn rejoin(&self, endpoint: &str) {
        let mut severed = self.severed.lock().expect("network lock poisoned");
        severed.retain(|(from, to)| from != endpoint && to != endpoint);
    }

    fn route(&self, from: &str, to: &str) -> anyhow::Result<mpsc::Sender<Rpc>> {
        if self
            .severed
            .lock()
            .expect("network lock poisoned")
            .contains(&(from.to_string(), to.to_string()))
        {
            anyhow::bail!("link {from} -> {to} is severed");
        }
        self.inboxes
            .lock()
            .expect("network lock poisoned")
            .get(to)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no transport is serving at {to}"))
    }
}

/// One node's transport on a [`MemoryNetwork`].
pub struct MemoryTransport {
    endpoint: String,
    network: Arc<MemoryNetwork>,
    closed: watch::Sender<bool>,
}

impl MemoryTransport {
    async fn call(&self, peer: &Peer, request: Request) -> anyhow::Result<Response> {
        let inbox = self.network.route(&self.endpoint, &peer.endpoint)?;
        let (rpc, reply_rx) = Rpc::new(request);
        inbox
            .send(rpc)
            .await
            .map_err(|_| anyhow::anyhow!("peer {} stopped serving", peer.id))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("peer {} dropped the request", peer.id))?
            .map_err(anyhow::Error::from)
    }
}

impl Transport for MemoryTransport {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn append_entries(
        &self,
        peer: &Peer,
        request: AppendEntriesRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<AppendEntriesResponse>> + Send + '_>> {
        let peer = peer.clone();
        Box::pin(async move {
            match self.call(&peer, Request::AppendEntries(request)).await? {
                Response::AppendEntries(response) => Ok(response),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        })
    }

    fn request_vote(
        &self,
        peer: &Peer,
        request: RequestVoteRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<RequestVoteResponse>> + Send + '_>> {
        let peer = peer.clone();
        Box::pin(async move {
            match self.call(&peer, Request::RequestVote(request)).await? {
                Response::RequestVote(response) => Ok(response),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        })
    }

    fn install_snapshot(
        &self,
        peer: &Peer,
        meta: InstallSnapshotMeta,
        mut data: Box<dyn Read + Send>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<InstallSnapshotResponse>> + Send + '_>> {
        let peer = peer.clone();
        Box::pin(async move {
            let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(SNAPSHOT_FRAME_QUEUE);
            let pump = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let mut chunk = vec![0u8; SNAPSHOT_CHUNK_SIZE];
                loop {
                    let n = data.read(&mut chunk)?;
                    if n == 0 {
                        return Ok(());
                    }
                    if frame_tx
                        .blocking_send(Bytes::copy_from_slice(&chunk[..n]))
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            });

            let request = Request::InstallSnapshot(InstallSnapshotRequest {
                meta,
                data: frame_rx,
            });
            let response = self.call(&peer, request).await;
            pump.await
                .map_err(|err| anyhow::anyhow!("snapshot pump panicked: {err}"))??;
            match response? {
                Response::InstallSnapshot(response) => Ok(response),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        })
    }

    fn apply_log(
        &self,
        peer: &Peer,
        request: ApplyRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ApplyResponse>> + Send + '_>> {
        let peer = peer.clone();
        Box::pin(async move {
            match self.call(&peer, Request::ApplyLog(request)).await? {
                Response::ApplyLog(response) => Ok(response),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        })
    }

    fn serve(
        &self,
        rpc_tx: mpsc::Sender<Rpc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.network
                .inboxes
                .lock()
                .expect("network lock poisoned")
                .insert(self.endpoint.clone(), rpc_tx);
            let mut closed = self.closed.subscribe();
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.network
                .inboxes
                .lock()
                .expect("network lock poisoned")
                .remove(&self.endpoint);
            let _ = self.closed.send(true);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::LogBody;

    fn peer(endpoint: &str) -> Peer {
        Peer::new(endpoint, endpoint)
    }

    #[tokio::test]
    async fn routes_requests_to_the_serving_peer() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");

        let (rpc_tx, mut rpc_rx) = mpsc::channel(4);
        tokio::spawn({
            let b = Arc::clone(&b);
            async move { b.serve(rpc_tx).await }
        });
        tokio::spawn(async move {
            while let Some(rpc) = rpc_rx.recv().await {
                if let Request::ApplyLog(_) = rpc.request {
                    let _ = rpc
                        .reply
                        .send(Ok(Response::ApplyLog(ApplyResponse::Error("nope".into()))));
                }
            }
        });

        // Give the serve task a moment to register the inbox.
        tokio::task::yield_now().await;
        let response = a
            .apply_log(
                &peer("b"),
                ApplyRequest {
                    body: LogBody::command(b"x".to_vec()),
                },
            )
            .await
            .unwrap();
        assert!(matches!(response, ApplyResponse::Error(message) if message == "nope"));
    }

    #[tokio::test]
    async fn severed_links_refuse_calls() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let (rpc_tx, _rpc_rx) = mpsc::channel(4);
        tokio::spawn({
            let b = Arc::clone(&b);
            async move { b.serve(rpc_tx).await }
        });
        tokio::task::yield_now().await;

        network.partition("a", "b");
        let err = a
            .request_vote(
                &peer("b"),
                RequestVoteRequest {
                    term: 1,
                    candidate_id: "a".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("severed"));

        network.heal("a", "b");
        assert!(network.route("a", "b").is_ok());
    }

    #[tokio::test]
    async fn calls_to_unserved_endpoints_fail() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let err = a
            .apply_log(
                &peer("ghost"),
                ApplyRequest {
                    body: LogBody::command(b"x".to_vec()),
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no transport"));
    }
}

//! HTTP peer transport: axum server, reqwest client.
//!
//! Unary operations are JSON POSTs under `/raft/v1/`. The snapshot install
//! streams the payload as the request body, with the metadata carried in
//! the `x-bleepraft-snapshot-meta` header (base64-encoded JSON) so it
//! arrives before the first payload byte.

use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use std::sync::Mutex;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::{Transport, SNAPSHOT_CHUNK_SIZE, SNAPSHOT_FRAME_QUEUE};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyRequest, ApplyResponse,
    InstallSnapshotMeta, InstallSnapshotResponse, Peer, RequestVoteRequest, RequestVoteResponse,
};
use crate::rpc::{InstallSnapshotRequest, Request, Response, Rpc};

/// Header carrying the snapshot metadata ahead of the streamed payload.
pub const SNAPSHOT_META_HEADER: &str = "x-bleepraft-snapshot-meta";

/// Peer transport over plain HTTP.
pub struct HttpTransport {
    endpoint: String,
    listener: Mutex<Option<tokio::net::TcpListener>>,
    client: reqwest::Client,
    closed: watch::Sender<bool>,
}

impl HttpTransport {
    /// Bind `listen_addr` and return the transport. The advertised endpoint
    /// is the bound address, so `:0` listeners advertise their real port.
    pub async fn new(listen_addr: &str) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(listen_addr).await?;
        let endpoint = listener.local_addr()?.to_string();
        Ok(Self {
            endpoint,
            listener: Mutex::new(Some(listener)),
            client: reqwest::Client::new(),
            closed: watch::channel(false).0,
        })
    }

    fn url(&self, peer: &Peer, operation: &str) -> String {
        format!("http://{}/raft/v1/{operation}", peer.endpoint)
    }

    async fn post_json<Req, Resp>(
        &self,
        peer: &Peer,
        operation: &str,
        request: &Req,
    ) -> anyhow::Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.url(peer, operation))
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("peer {} returned {status}: {detail}", peer.id);
        }
        Ok(response.json().await?)
    }
}

impl Transport for HttpTransport {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn append_entries(
        &self,
        peer: &Peer,
        request: AppendEntriesRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<AppendEntriesResponse>> + Send + '_>> {
        let peer = peer.clone();
        Box::pin(async move { self.post_json(&peer, "append-entries", &request).await })
    }

    fn request_vote(
        &self,
        peer: &Peer,
        request: RequestVoteRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<RequestVoteResponse>> + Send + '_>> {
        let peer = peer.clone();
        Box::pin(async move { self.post_json(&peer, "request-vote", &request).await })
    }

    fn install_snapshot(
        &self,
        peer: &Peer,
        meta: InstallSnapshotMeta,
        mut data: Box<dyn Read + Send>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<InstallSnapshotResponse>> + Send + '_>> {
        let peer = peer.clone();
        Box::pin(async move {
            let meta_header = BASE64_STANDARD.encode(serde_json::to_vec(&meta)?);

            let (mut frame_tx, frame_rx) =
                futures::channel::mpsc::channel::<Result<Bytes, std::io::Error>>(
                    SNAPSHOT_FRAME_QUEUE,
                );
            let pump = tokio::task::spawn_blocking(move || {
                let mut chunk = vec![0u8; SNAPSHOT_CHUNK_SIZE];
                loop {
                    match data.read(&mut chunk) {
                        Ok(0) => return,
                        Ok(n) => {
                            let frame = Bytes::copy_from_slice(&chunk[..n]);
                            if futures::executor::block_on(frame_tx.send(Ok(frame))).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = futures::executor::block_on(frame_tx.send(Err(err)));
                            return;
                        }
                    }
                }
            });

            let response = self
                .client
                .post(self.url(&peer, "install-snapshot"))
                .header(SNAPSHOT_META_HEADER, meta_header)
                .body(reqwest::Body::wrap_stream(frame_rx))
                .send()
                .await?;
            let _ = pump.await;

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                anyhow::bail!("peer {} returned {status}: {detail}", peer.id);
            }
            Ok(response.json().await?)
        })
    }

    fn apply_log(
        &self,
        peer: &Peer,
        request: ApplyRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ApplyResponse>> + Send + '_>> {
        let peer = peer.clone();
        Box::pin(async move { self.post_json(&peer, "apply-log", &request).await })
    }

    fn serve(
        &self,
        rpc_tx: mpsc::Sender<Rpc>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let listener = self
                .listener
                .lock()
                .expect("listener lock poisoned")
                .take()
                .ok_or_else(|| anyhow::anyhow!("serve() can only be called once"))?;
            tracing::info!(endpoint = %self.endpoint, "peer transport started");

            let router = router(rpc_tx);
            let mut closed = self.closed.subscribe();
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    while !*closed.borrow() {
                        if closed.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await?;
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _ = self.closed.send(true);
            Ok(())
        })
    }
}

// -- Server side --------------------------------------------------------------

fn router(rpc_tx: mpsc::Sender<Rpc>) -> Router {
    Router::new()
        .route("/raft/v1/append-entries", post(handle_append_entries))
        .route("/raft/v1/request-vote", post(handle_request_vote))
        .route("/raft/v1/install-snapshot", post(handle_install_snapshot))
        .route("/raft/v1/apply-log", post(handle_apply_log))
        .with_state(rpc_tx)
}

/// Enqueue a request onto the core's inbound queue and await its reply.
async fn relay(rpc_tx: &mpsc::Sender<Rpc>, request: Request) -> Result<Response, ErrorReply> {
    let (rpc, reply_rx) = Rpc::new(request);
    rpc_tx
        .send(rpc)
        .await
        .map_err(|_| ErrorReply::gone("server stopped accepting RPCs"))?;
    reply_rx
        .await
        .map_err(|_| ErrorReply::gone("request dropped during shutdown"))?
        .map_err(|err| ErrorReply {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        })
}

struct ErrorReply {
    status: StatusCode,
    message: String,
}

impl ErrorReply {
    fn gone(message: &str) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.to_string(),
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl IntoResponse for ErrorReply {
    fn into_response(self) -> AxumResponse {
        (self.status, self.message).into_response()
    }
}

async fn handle_append_entries(
    State(rpc_tx): State<mpsc::Sender<Rpc>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Result<Json<AppendEntriesResponse>, ErrorReply> {
    match relay(&rpc_tx, Request::AppendEntries(request)).await? {
        Response::AppendEntries(response) => Ok(Json(response)),
        _ => Err(ErrorReply::gone("mismatched response")),
    }
}

async fn handle_request_vote(
    State(rpc_tx): State<mpsc::Sender<Rpc>>,
    Json(request): Json<RequestVoteRequest>,
) -> Result<Json<RequestVoteResponse>, ErrorReply> {
    match relay(&rpc_tx, Request::RequestVote(request)).await? {
        Response::RequestVote(response) => Ok(Json(response)),
        _ => Err(ErrorReply::gone("mismatched response")),
    }
}

async fn handle_apply_log(
    State(rpc_tx): State<mpsc::Sender<Rpc>>,
    Json(request): Json<ApplyRequest>,
) -> Result<Json<ApplyResponse>, ErrorReply> {
    match relay(&rpc_tx, Request::ApplyLog(request)).await? {
        Response::ApplyLog(response) => Ok(Json(response)),
        _ => Err(ErrorReply::gone("mismatched response")),
    }
}

/// Metadata from the header, payload frames from the body, in order.
async fn handle_install_snapshot(
    State(rpc_tx): State<mpsc::Sender<Rpc>>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<Json<InstallSnapshotResponse>, ErrorReply> {
    let meta_header = headers
        .get(SNAPSHOT_META_HEADER)
        .ok_or_else(|| ErrorReply::bad_request(format!("missing {SNAPSHOT_META_HEADER} header")))?;
    let meta_bytes = BASE64_STANDARD
        .decode(meta_header.as_bytes())
        .map_err(|err| ErrorReply::bad_request(format!("undecodable snapshot metadata: {err}")))?;
    let meta: InstallSnapshotMeta = serde_json::from_slice(&meta_bytes)
        .map_err(|err| ErrorReply::bad_request(format!("malformed snapshot metadata: {err}")))?;

    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(SNAPSHOT_FRAME_QUEUE);
    let (rpc, reply_rx) = Rpc::new(Request::InstallSnapshot(InstallSnapshotRequest {
        meta,
        data: frame_rx,
    }));
    rpc_tx
        .send(rpc)
        .await
        .map_err(|_| ErrorReply::gone("server stopped accepting RPCs"))?;

    let mut stream = body.into_data_stream();
    while let Some(frame) = stream.next().await {
        let frame =
            frame.map_err(|err| ErrorReply::bad_request(format!("broken payload stream: {err}")))?;
        if frame_tx.send(frame).await.is_err() {
            break;
        }
    }
    drop(frame_tx);

    match reply_rx
        .await
        .map_err(|_| ErrorReply::gone("request dropped during shutdown"))?
        .map_err(|err| ErrorReply {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        })? {
        Response::InstallSnapshot(response) => Ok(Json(response)),
        _ => Err(ErrorReply::gone("mismatched response")),
    }
}

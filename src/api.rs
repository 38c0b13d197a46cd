//! Admin HTTP surface.
//!
//! The external front door: read-only state inspection plus the client
//! command entrypoints, which forward to the core through
//! [`Server::apply`]. Runs only when an admin listen address is configured.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;

use crate::errors::RaftError;
use crate::message::{LogBody, Peer};
use crate::metrics::metrics_handler;
use crate::server::Server;

/// Build the admin [`Router`].
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/states", get(states))
        .route("/apply", post(apply))
        .route("/command", post(command))
        .route("/register", post(register))
        .with_state(server)
}

/// Serve the admin surface on `listen_addr` until the server shuts down.
pub async fn serve(listen_addr: &str, server: Arc<Server>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "admin API started");
    axum::serve(listener, router(server)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn states(State(server): State<Arc<Server>>) -> Response {
    Json(server.states()).into_response()
}

/// `POST /apply` -- submit a full log body.
async fn apply(State(server): State<Arc<Server>>, Json(body): Json<LogBody>) -> Response {
    reply(server.apply(body).await)
}

/// `POST /command` -- submit raw command bytes.
async fn command(State(server): State<Arc<Server>>, body: Bytes) -> Response {
    reply(server.apply_command(body.to_vec()).await)
}

/// `POST /register` -- add a peer via joint consensus.
async fn register(State(server): State<Arc<Server>>, Json(peer): Json<Peer>) -> Response {
    reply(server.register(peer).await)
}

fn reply<T: serde::Serialize>(result: Result<T, RaftError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => {
            let status = match &err {
                RaftError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
                RaftError::InTransition => StatusCode::CONFLICT,
                RaftError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, err.to_string()).into_response()
        }
    }
}

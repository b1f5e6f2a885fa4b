//! HTTP surface (spec §6.1): translates requests into calls against the
//! core's registry/engine/daemon, or into `ConnectionCtx`/`NodeCtx`
//! messages for the single-consumer channels.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use cxynet::config::BridgeConf;
use cxynet::connection::{Connection, ConnectionAction, ConnectionCtx};
use cxynet::daemon::{Daemon, NodeAction, NodeCtx};
use cxynet::error::CoreError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/configuration", get(get_configuration).post(set_configuration))
        .route("/networks", get(list_networks))
        .route("/network/{name}", get(get_network).delete(delete_network))
        .route("/network", post(create_network))
        .route("/cluster/join", post(cluster_join))
        .route("/cluster/leave", post(cluster_leave))
        .route("/connections", get(list_connections))
        .route("/connection/{id}", get(get_connection).delete(delete_connection))
        .route("/connection", post(create_connection))
        .route("/qos/{id}", post(add_qos).put(change_qos))
        .with_state(daemon)
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotFound => StatusCode::NOT_FOUND,
        CoreError::AlreadyExists => StatusCode::OK,
        CoreError::OsError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::Exhausted => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::NotConnected => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::Outdated => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: CoreError) -> axum::response::Response {
    let status = status_for(&err);
    (status, err.to_string()).into_response()
}

async fn version() -> impl IntoResponse {
    VERSION.to_string()
}

async fn get_configuration(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(daemon.bridge_conf.read().await.clone())
}

async fn set_configuration(
    State(daemon): State<Arc<Daemon>>,
    body: String,
) -> axum::response::Response {
    if body.trim().is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match serde_json::from_str::<BridgeConf>(&body) {
        Ok(conf) => {
            *daemon.bridge_conf.write().await = conf;
            StatusCode::OK.into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn list_networks(State(daemon): State<Arc<Daemon>>) -> axum::response::Response {
    match daemon.registry.get_networks().await {
        Ok(networks) => Json(networks).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_network(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match daemon.registry.get_network(&name).await {
        Ok(network) => Json(network).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateNetworkRequest {
    name: String,
    subnet: Ipv4Net,
}

async fn create_network(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<CreateNetworkRequest>,
) -> axum::response::Response {
    match daemon.registry.create_network(&req.name, req.subnet).await {
        Ok(outcome) => Json(outcome.into_network()).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_network(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match daemon.registry.delete_network(&name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ClusterJoinQuery {
    address: Option<String>,
}

async fn cluster_join(
    State(daemon): State<Arc<Daemon>>,
    Query(q): Query<ClusterJoinQuery>,
) -> axum::response::Response {
    let Some(address) = q.address.filter(|a| !a.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    let ctx = NodeCtx {
        action: NodeAction::Join(address),
        reply: reply_tx,
    };
    if daemon.cluster_tx.send(ctx).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match reply_rx.await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(err)) => error_response(err),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn cluster_leave(State(daemon): State<Arc<Daemon>>) -> axum::response::Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    let ctx = NodeCtx {
        action: NodeAction::Leave,
        reply: reply_tx,
    };
    if daemon.cluster_tx.send(ctx).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match reply_rx.await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(err)) => error_response(err),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn list_connections(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let table = daemon.connection_table();
    let snapshot: HashMap<String, Connection> = table.read().await.clone();
    Json(snapshot)
}

async fn get_connection(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let table = daemon.connection_table();
    match table.read().await.get(&id) {
        Some(conn) => Json(conn.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_connection(
    State(daemon): State<Arc<Daemon>>,
    Json(conn): Json<Connection>,
) -> axum::response::Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    let ctx = ConnectionCtx {
        action: ConnectionAction::Add(conn),
        reply: reply_tx,
    };
    if daemon.connection_tx.send(ctx).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match reply_rx.await {
        Ok(Ok(conn)) => Json(conn).into_response(),
        Ok(Err(CoreError::NotFound)) => StatusCode::BAD_REQUEST.into_response(),
        Ok(Err(err)) => error_response(err),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn delete_connection(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    let ctx = ConnectionCtx {
        action: ConnectionAction::Delete(id),
        reply: reply_tx,
    };
    if daemon.connection_tx.send(ctx).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match reply_rx.await {
        Ok(Ok(_)) => StatusCode::OK.into_response(),
        Ok(Err(err)) => error_response(err),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct QosQuery {
    bw: Option<String>,
    delay: Option<String>,
}

async fn add_qos(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Query(q): Query<QosQuery>,
) -> axum::response::Response {
    match daemon
        .connection_engine
        .add_qos(&id, q.bw.as_deref(), q.delay.as_deref())
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

async fn change_qos(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Query(q): Query<QosQuery>,
) -> axum::response::Response {
    match daemon
        .connection_engine
        .change_qos(&id, q.bw.as_deref(), q.delay.as_deref())
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

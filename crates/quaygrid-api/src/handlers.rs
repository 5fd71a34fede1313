//! Admin endpoint handlers.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::error;

use quay_core::{net, ProgressWriter};
use quaygrid_state::{Machine, Pool};

use crate::AdminState;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Stream `{"message": ...}` lines produced by `task` as an ndjson body.
fn progress_stream<F, Fut>(task: F) -> Response
where
    F: FnOnce(ProgressWriter) -> Fut,
    Fut: std::future::Future<Output = Result<(), quaygrid_provision::ProvisionError>>
        + Send
        + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let writer = ProgressWriter::channel(tx);
    let fut = task(writer.clone());
    tokio::spawn(async move {
        if let Err(err) = fut.await {
            error!(error = %err, "streamed admin operation failed");
            writer.message(format!("Error: {err}"));
        }
    });
    let body = Body::from_stream(
        UnboundedReceiverStream::new(rx).map(|line| Ok::<Bytes, Infallible>(Bytes::from(line))),
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-json-stream")],
        body,
    )
        .into_response()
}

// ── Nodes ──────────────────────────────────────────────────────────

/// Validate a node address: it must be a URL with a host and an http or
/// https scheme.
pub fn validate_node_address(address: &str) -> Result<(), String> {
    if address.is_empty() {
        return Err("address=url parameter is required".to_string());
    }
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("", address),
    };
    let authority = rest.split('/').next().unwrap_or("");
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    if host.is_empty() {
        return Err("Invalid address url: host cannot be empty".to_string());
    }
    if scheme != "http" && scheme != "https" {
        return Err("Invalid address url: scheme must be http[s]".to_string());
    }
    Ok(())
}

#[derive(Deserialize)]
pub struct AddNodeQuery {
    #[serde(default)]
    pub register: bool,
}

/// POST /docker/node
///
/// With `register=true`, validates and registers the given address. With
/// `register=false`, asks the machine provider for a fresh machine first
/// and registers the node built from it.
pub async fn add_node(
    State(state): State<AdminState>,
    Query(query): Query<AddNodeQuery>,
    Json(mut params): Json<HashMap<String, String>>,
) -> Response {
    if query.register {
        let address = params.remove("address").unwrap_or_default();
        if let Err(message) = validate_node_address(&address) {
            return error_response(StatusCode::BAD_REQUEST, message);
        }
        match state.provisioner.cluster().register(&address, params).await {
            Ok(()) => StatusCode::OK.into_response(),
            Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    } else {
        let config = state.provisioner.config();
        let iaas_name = match params
            .get("iaas")
            .cloned()
            .or_else(|| config.iaas.default.clone())
        {
            Some(name) => name,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "no default machine provider configured",
                )
            }
        };
        let provider = match state.machines.get(&iaas_name) {
            Ok(provider) => provider,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
        };
        let machine = match provider.create_machine(&params).await {
            Ok(machine) => machine,
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        let row = Machine {
            id: machine.id.clone(),
            iaas: iaas_name.clone(),
            status: machine.status.clone(),
            address: machine.address.clone(),
        };
        if let Err(err) = state.provisioner.store().add_machine(&row) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }

        let node_address = format!(
            "{}://{}:{}",
            config.iaas.node_protocol, machine.address, config.iaas.node_port
        );
        params.insert("iaas".to_string(), iaas_name);
        params.insert("id".to_string(), machine.id);
        match state
            .provisioner
            .cluster()
            .register(&node_address, params)
            .await
        {
            Ok(()) => Json(serde_json::json!({ "description": provider.describe() }))
                .into_response(),
            Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

/// POST /docker/node/remove
pub async fn remove_node(
    State(state): State<AdminState>,
    Json(params): Json<HashMap<String, String>>,
) -> Response {
    let address = params.get("address").cloned().unwrap_or_default();
    if address.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "address is required");
    }
    if let Err(err) = state.provisioner.cluster().unregister(&address).await {
        return error_response(StatusCode::NOT_FOUND, err.to_string());
    }

    if params.get("remove_iaas").map(String::as_str) == Some("true") {
        let host = net::url_to_host(&address);
        let machine = match state.provisioner.store().machine_by_address(&host) {
            Ok(machine) => machine,
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        if let Some(machine) = machine {
            match state.machines.get(&machine.iaas) {
                Ok(provider) => {
                    let target = quaygrid_cluster::ProvisionedMachine {
                        id: machine.id.clone(),
                        status: machine.status.clone(),
                        address: machine.address.clone(),
                    };
                    if let Err(err) = provider.delete_machine(&target).await {
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            err.to_string(),
                        );
                    }
                    if let Err(err) = state.provisioner.store().remove_machine(&machine.id) {
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            err.to_string(),
                        );
                    }
                }
                Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
            }
        }
    }
    StatusCode::OK.into_response()
}

/// GET /docker/node
pub async fn list_nodes(State(state): State<AdminState>) -> Response {
    let nodes = match state.provisioner.cluster().nodes().await {
        Ok(nodes) => nodes,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let machines = match state.provisioner.store().list_machines() {
        Ok(machines) => machines,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    Json(serde_json::json!({ "nodes": nodes, "machines": machines })).into_response()
}

/// GET /docker/node/{address}/containers
pub async fn list_containers_by_host(
    State(state): State<AdminState>,
    Path(address): Path<String>,
) -> Response {
    let host = net::url_to_host(&address);
    match state.provisioner.store().list_by_host(&host) {
        Ok(records) => Json(records).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

// ── Container moves and repair ─────────────────────────────────────

/// POST /docker/containers/move
pub async fn move_containers(
    State(state): State<AdminState>,
    Json(params): Json<HashMap<String, String>>,
) -> Response {
    let from = params.get("from").cloned().unwrap_or_default();
    let to = params.get("to").cloned().unwrap_or_default();
    if from.is_empty() || to.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid params: from: {from} - to: {to}"),
        );
    }
    let provisioner = state.provisioner.clone();
    progress_stream(move |writer| async move {
        provisioner.move_containers(&from, &to, &writer).await
    })
}

/// POST /docker/container/{id}/move
pub async fn move_container(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(params): Json<HashMap<String, String>>,
) -> Response {
    let to = params.get("to").cloned().unwrap_or_default();
    if to.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "to host is required");
    }
    let provisioner = state.provisioner.clone();
    progress_stream(move |writer| async move {
        if let Err(err) = provisioner.move_container(&id, &to, &writer).await {
            writer.message(format!("Error trying to move container: {err}"));
        }
        Ok(())
    })
}

/// POST /docker/containers/rebalance
pub async fn rebalance_containers(
    State(state): State<AdminState>,
    params: Option<Json<HashMap<String, String>>>,
) -> Response {
    let dry = params
        .as_ref()
        .and_then(|Json(p)| p.get("dry"))
        .map(|v| v == "true")
        .unwrap_or(false);
    let provisioner = state.provisioner.clone();
    progress_stream(move |writer| async move {
        provisioner
            .rebalance(dry, &writer, &CancellationToken::new())
            .await
    })
}

/// POST /docker/fix-containers
pub async fn fix_containers(State(state): State<AdminState>) -> Response {
    match state.provisioner.fix_containers().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

// ── Pools ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PoolRequest {
    pub pool: String,
    #[serde(default)]
    pub teams: Vec<String>,
}

/// POST /docker/pool
pub async fn add_pool(
    State(state): State<AdminState>,
    Json(request): Json<PoolRequest>,
) -> Response {
    if request.pool.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "pool name is required");
    }
    let pool = Pool {
        name: request.pool,
        teams: request.teams,
    };
    match state.provisioner.store().add_pool(&pool) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// DELETE /docker/pool
pub async fn remove_pool(
    State(state): State<AdminState>,
    Json(request): Json<PoolRequest>,
) -> Response {
    match state.provisioner.store().remove_pool(&request.pool) {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "pool not found"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// GET /docker/pool
pub async fn list_pools(State(state): State<AdminState>) -> Response {
    match state.provisioner.store().list_pools() {
        Ok(pools) => Json(pools).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// POST /docker/pool/team
pub async fn add_teams(
    State(state): State<AdminState>,
    Json(request): Json<PoolRequest>,
) -> Response {
    match state
        .provisioner
        .store()
        .add_teams_to_pool(&request.pool, &request.teams)
    {
        Ok(pool) => Json(pool).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string()),
    }
}

/// DELETE /docker/pool/team
pub async fn remove_teams(
    State(state): State<AdminState>,
    Json(request): Json<PoolRequest>,
) -> Response {
    match state
        .provisioner
        .store()
        .remove_teams_from_pool(&request.pool, &request.teams)
    {
        Ok(pool) => Json(pool).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_address_validation_messages() {
        assert_eq!(
            validate_node_address("").unwrap_err(),
            "address=url parameter is required"
        );
        assert_eq!(
            validate_node_address("/invalid").unwrap_err(),
            "Invalid address url: host cannot be empty"
        );
        assert_eq!(
            validate_node_address("xxx://abc/invalid").unwrap_err(),
            "Invalid address url: scheme must be http[s]"
        );
        assert!(validate_node_address("http://10.0.0.1:4243").is_ok());
        assert!(validate_node_address("https://node.example.com:2376").is_ok());
    }
}

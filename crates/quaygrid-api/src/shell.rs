//! Interactive shell endpoint.
//!
//! `GET /docker/ssh/{container_id}` hijacks the client connection via an
//! HTTP upgrade and bridges it to an SSH session inside the container.
//! The upgrade futures are prepared before the 101 response is returned;
//! the byte bridging runs in a background task.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hyper_util::rt::TokioIo;
use tracing::{debug, error};

use quaygrid_shell::SshTarget;

use crate::AdminState;

fn shell_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// GET /docker/ssh/{container_id}
pub async fn ssh_to_container(
    State(state): State<AdminState>,
    Path(container_id): Path<String>,
    mut request: Request<Body>,
) -> Response {
    let record = match state.provisioner.store().container_by_id(&container_id) {
        Ok(record) => record,
        Err(_) => return shell_error(StatusCode::NOT_FOUND, "not found"),
    };
    if record.private_key.is_empty() || record.ssh_host_port.is_empty() {
        return shell_error(
            StatusCode::BAD_REQUEST,
            "container has no shell transport configured",
        );
    }
    let port = match record.ssh_host_port.parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            return shell_error(StatusCode::INTERNAL_SERVER_ERROR, "invalid shell port")
        }
    };

    let on_upgrade = match request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() {
        Some(on_upgrade) => on_upgrade,
        None => {
            return shell_error(StatusCode::INTERNAL_SERVER_ERROR, "cannot hijack connection")
        }
    };

    let target = SshTarget {
        host: record.host_addr.clone(),
        port,
        user: record.user.clone(),
        private_key: record.private_key.clone(),
    };

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                error!(error = %err, "shell upgrade failed");
                return;
            }
        };
        debug!(container = %container_id, "bridging shell session");
        if let Err(err) = quaygrid_shell::shell(target, TokioIo::new(upgraded)).await {
            error!(container = %container_id, error = %err, "shell session ended with error");
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "tcp")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

//! quaygrid-api — the admin HTTP surface of the provisioner.
//!
//! Thin axum adapters over the provisioner and cluster: node registry
//! management (including machine-provider provisioning), container
//! listing and moves, fleet rebalancing, fix-containers, pool/team CRUD,
//! and the hijacked interactive shell endpoint.
//!
//! Long-running endpoints stream newline-delimited JSON records of the
//! form `{"message": "..."}`; a terminal `... successfully!` message
//! signals completion. Authentication happens upstream.

pub mod handlers;
pub mod shell;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use quaygrid_cluster::MachineProviders;
use quaygrid_provision::Provisioner;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub provisioner: Arc<Provisioner>,
    pub machines: Arc<MachineProviders>,
}

/// Build the admin router.
pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/docker/node",
            get(handlers::list_nodes).post(handlers::add_node),
        )
        .route("/docker/node/remove", post(handlers::remove_node))
        .route(
            "/docker/node/{address}/containers",
            get(handlers::list_containers_by_host),
        )
        .route("/docker/containers/move", post(handlers::move_containers))
        .route("/docker/container/{id}/move", post(handlers::move_container))
        .route(
            "/docker/containers/rebalance",
            post(handlers::rebalance_containers),
        )
        .route("/docker/fix-containers", post(handlers::fix_containers))
        .route("/docker/ssh/{container_id}", get(shell::ssh_to_container))
        .route(
            "/docker/pool",
            get(handlers::list_pools)
                .post(handlers::add_pool)
                .delete(handlers::remove_pool),
        )
        .route(
            "/docker/pool/team",
            post(handlers::add_teams).delete(handlers::remove_teams),
        )
        .with_state(state)
}

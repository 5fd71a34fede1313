//! quaygrid-router — edge-router coordination.
//!
//! The edge router is the externally visible HTTP router mapping app names
//! to upstream container addresses. This crate defines the interface the
//! provisioner drives and ships an in-memory implementation used for
//! single-node deployments and tests.
//!
//! The router is eventually consistent with the container record set;
//! drifts are repaired by the fix-containers flow.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryRouter;

#[derive(Debug, Error)]
pub enum RouterError {
    /// Sentinel for removing a route that is not present. Callers treat
    /// this as non-fatal.
    #[error("route not found")]
    RouteNotFound,

    #[error("backend not found: {0}")]
    BackendNotFound(String),

    #[error("router backend error: {0}")]
    Backend(String),
}

pub type RouterResult<T> = Result<T, RouterError>;

/// The edge-router operations the provisioner relies on.
#[async_trait]
pub trait Router: Send + Sync {
    async fn add_backend(&self, app: &str) -> RouterResult<()>;
    async fn remove_backend(&self, app: &str) -> RouterResult<()>;

    /// Register a route for an app. Adding an existing route is idempotent.
    async fn add_route(&self, app: &str, address: &str) -> RouterResult<()>;

    /// Remove a route. Returns [`RouterError::RouteNotFound`] when the
    /// route is not present.
    async fn remove_route(&self, app: &str, address: &str) -> RouterResult<()>;

    async fn routes(&self, app: &str) -> RouterResult<Vec<String>>;

    async fn has_route(&self, app: &str, address: &str) -> RouterResult<bool> {
        Ok(self.routes(app).await?.iter().any(|r| r == address))
    }

    async fn set_cname(&self, cname: &str, app: &str) -> RouterResult<()>;
    async fn unset_cname(&self, cname: &str, app: &str) -> RouterResult<()>;

    /// Exchange the routes of two apps.
    async fn swap(&self, app1: &str, app2: &str) -> RouterResult<()>;

    /// Externally visible address for an app.
    async fn addr(&self, app: &str) -> RouterResult<String>;
}

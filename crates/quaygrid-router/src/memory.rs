//! In-memory edge router.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::{Router, RouterError, RouterResult};

#[derive(Default)]
struct Backends {
    /// app → ordered route list.
    routes: HashMap<String, Vec<String>>,
    /// cname → app.
    cnames: HashMap<String, String>,
}

/// Process-local router used for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryRouter {
    state: Mutex<Backends>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered backends (diagnostics and tests).
    pub fn backend_count(&self) -> usize {
        self.state.lock().expect("router state poisoned").routes.len()
    }
}

#[async_trait]
impl Router for MemoryRouter {
    async fn add_backend(&self, app: &str) -> RouterResult<()> {
        let mut state = self.state.lock().expect("router state poisoned");
        state.routes.entry(app.to_string()).or_default();
        debug!(%app, "backend added");
        Ok(())
    }

    async fn remove_backend(&self, app: &str) -> RouterResult<()> {
        let mut state = self.state.lock().expect("router state poisoned");
        if state.routes.remove(app).is_none() {
            return Err(RouterError::BackendNotFound(app.to_string()));
        }
        state.cnames.retain(|_, target| target != app);
        Ok(())
    }

    async fn add_route(&self, app: &str, address: &str) -> RouterResult<()> {
        let mut state = self.state.lock().expect("router state poisoned");
        let routes = state.routes.entry(app.to_string()).or_default();
        if !routes.iter().any(|r| r == address) {
            routes.push(address.to_string());
        }
        Ok(())
    }

    async fn remove_route(&self, app: &str, address: &str) -> RouterResult<()> {
        let mut state = self.state.lock().expect("router state poisoned");
        let routes = state
            .routes
            .get_mut(app)
            .ok_or(RouterError::RouteNotFound)?;
        let before = routes.len();
        routes.retain(|r| r != address);
        if routes.len() == before {
            return Err(RouterError::RouteNotFound);
        }
        Ok(())
    }

    async fn routes(&self, app: &str) -> RouterResult<Vec<String>> {
        let state = self.state.lock().expect("router state poisoned");
        Ok(state.routes.get(app).cloned().unwrap_or_default())
    }

    async fn set_cname(&self, cname: &str, app: &str) -> RouterResult<()> {
        let mut state = self.state.lock().expect("router state poisoned");
        if !state.routes.contains_key(app) {
            return Err(RouterError::BackendNotFound(app.to_string()));
        }
        state.cnames.insert(cname.to_string(), app.to_string());
        Ok(())
    }

    async fn unset_cname(&self, cname: &str, _app: &str) -> RouterResult<()> {
        let mut state = self.state.lock().expect("router state poisoned");
        state.cnames.remove(cname);
        Ok(())
    }

    async fn swap(&self, app1: &str, app2: &str) -> RouterResult<()> {
        let mut state = self.state.lock().expect("router state poisoned");
        if !state.routes.contains_key(app1) {
            return Err(RouterError::BackendNotFound(app1.to_string()));
        }
        if !state.routes.contains_key(app2) {
            return Err(RouterError::BackendNotFound(app2.to_string()));
        }
        let first = state.routes.remove(app1).unwrap_or_default();
        let second = state.routes.remove(app2).unwrap_or_default();
        state.routes.insert(app1.to_string(), second);
        state.routes.insert(app2.to_string(), first);
        Ok(())
    }

    async fn addr(&self, app: &str) -> RouterResult<String> {
        let state = self.state.lock().expect("router state poisoned");
        if !state.routes.contains_key(app) {
            return Err(RouterError::BackendNotFound(app.to_string()));
        }
        Ok(format!("{app}.quaygrid.local"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_remove_route_restores_initial_state() {
        let router = MemoryRouter::new();
        router.add_backend("myapp").await.unwrap();

        router
            .add_route("myapp", "http://10.0.0.1:49153")
            .await
            .unwrap();
        assert!(router
            .has_route("myapp", "http://10.0.0.1:49153")
            .await
            .unwrap());

        router
            .remove_route("myapp", "http://10.0.0.1:49153")
            .await
            .unwrap();
        assert!(router.routes("myapp").await.unwrap().is_empty());

        // Second removal yields the sentinel.
        let err = router.remove_route("myapp", "http://10.0.0.1:49153").await;
        assert!(matches!(err, Err(RouterError::RouteNotFound)));
    }

    #[tokio::test]
    async fn add_route_is_idempotent() {
        let router = MemoryRouter::new();
        router.add_route("myapp", "http://a:1").await.unwrap();
        router.add_route("myapp", "http://a:1").await.unwrap();
        assert_eq!(router.routes("myapp").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_backend_drops_routes_and_cnames() {
        let router = MemoryRouter::new();
        router.add_backend("myapp").await.unwrap();
        router.add_route("myapp", "http://a:1").await.unwrap();
        router.set_cname("www.example.com", "myapp").await.unwrap();

        router.remove_backend("myapp").await.unwrap();
        assert!(router.routes("myapp").await.unwrap().is_empty());
        let err = router.remove_backend("myapp").await;
        assert!(matches!(err, Err(RouterError::BackendNotFound(_))));
    }

    #[tokio::test]
    async fn swap_exchanges_routes() {
        let router = MemoryRouter::new();
        router.add_backend("app1").await.unwrap();
        router.add_backend("app2").await.unwrap();
        router.add_route("app1", "http://a:1").await.unwrap();
        router.add_route("app2", "http://b:2").await.unwrap();

        router.swap("app1", "app2").await.unwrap();

        assert_eq!(router.routes("app1").await.unwrap(), vec!["http://b:2"]);
        assert_eq!(router.routes("app2").await.unwrap(), vec!["http://a:1"]);
    }

    #[tokio::test]
    async fn cname_requires_backend() {
        let router = MemoryRouter::new();
        let err = router.set_cname("www", "ghost").await;
        assert!(matches!(err, Err(RouterError::BackendNotFound(_))));
    }

    #[tokio::test]
    async fn addr_for_known_backend() {
        let router = MemoryRouter::new();
        router.add_backend("myapp").await.unwrap();
        assert_eq!(router.addr("myapp").await.unwrap(), "myapp.quaygrid.local");
        assert!(router.addr("ghost").await.is_err());
    }
}

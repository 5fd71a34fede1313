//! The multi-node cluster facade.
//!
//! Routes host-engine calls to the node that owns the target container or
//! image, and drives the scheduler for new containers. An optional healer
//! observes node failures; optional active monitoring pings nodes on an
//! interval.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, ContainerInspectResponse};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use quay_core::{AppSpec, ProgressWriter};

use crate::engine::{EngineFactory, HostEngine};
use crate::error::{ClusterError, ClusterResult, EngineError, ScheduleError};
use crate::storage::{ClusterStorage, Node};

/// Picks the node that runs a new container.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule(&self, nodes: &[Node], app: &AppSpec) -> Result<Node, ScheduleError>;
}

/// Reacts to node failures observed by the cluster, e.g. by recycling the
/// node. Invoked asynchronously; must tolerate duplicate notifications.
#[async_trait]
pub trait Healer: Send + Sync {
    async fn handle_failure(&self, node: Node);
}

pub struct Cluster {
    storage: Arc<dyn ClusterStorage>,
    scheduler: Arc<dyn Scheduler>,
    engines: Arc<dyn EngineFactory>,
    healer: Mutex<Option<Arc<dyn Healer>>>,
}

impl Cluster {
    pub fn new(
        storage: Arc<dyn ClusterStorage>,
        scheduler: Arc<dyn Scheduler>,
        engines: Arc<dyn EngineFactory>,
    ) -> Self {
        Cluster {
            storage,
            scheduler,
            engines,
            healer: Mutex::new(None),
        }
    }

    pub fn set_healer(&self, healer: Arc<dyn Healer>) {
        *self.healer.lock().expect("healer slot poisoned") = Some(healer);
    }

    // ── Node registry ──────────────────────────────────────────────

    pub async fn register(
        &self,
        address: &str,
        metadata: std::collections::HashMap<String, String>,
    ) -> ClusterResult<()> {
        let node = Node {
            address: address.to_string(),
            metadata,
        };
        info!(address, "node registered");
        self.storage.register_node(node).await
    }

    pub async fn unregister(&self, address: &str) -> ClusterResult<()> {
        info!(address, "node unregistered");
        self.storage.unregister_node(address).await
    }

    pub async fn nodes(&self) -> ClusterResult<Vec<Node>> {
        self.storage.nodes().await
    }

    /// Resolve a bare host to the full address of a registered node.
    pub async fn host_to_node_address(&self, host: &str) -> ClusterResult<String> {
        for node in self.storage.nodes().await? {
            if node.host() == host {
                return Ok(node.address);
            }
        }
        Err(ScheduleError::NoSuchHost(host.to_string()).into())
    }

    // ── Container lifecycle ────────────────────────────────────────

    /// Create a container on a scheduler-chosen node.
    ///
    /// When `destination_hosts` is non-empty, scheduling is restricted to
    /// those hosts; an unknown host fails with `NoSuchHost`. On success the
    /// container-to-node mapping is recorded and `(node_address,
    /// container_id)` returned.
    pub async fn create_container(
        &self,
        app: &AppSpec,
        name: &str,
        body: ContainerCreateBody,
        destination_hosts: &[String],
    ) -> ClusterResult<(String, String)> {
        let mut candidates = Vec::new();
        if destination_hosts.is_empty() {
            candidates = self.storage.nodes().await?;
        } else {
            let nodes = self.storage.nodes().await?;
            for host in destination_hosts {
                match nodes.iter().find(|n| &n.host() == host) {
                    Some(node) => candidates.push(node.clone()),
                    None => return Err(ScheduleError::NoSuchHost(host.clone()).into()),
                }
            }
        }

        let node = self.scheduler.schedule(&candidates, app).await?;
        debug!(app = %app.name, node = %node.address, "container scheduled");

        let engine = self.engines.engine(&node.address)?;
        let id = match engine.create_container(name, body).await {
            Ok(id) => id,
            Err(err) => {
                self.observe_failure(&node.address, &err);
                return Err(err.into());
            }
        };
        self.storage.store_container(&id, &node.address).await?;
        Ok((node.address, id))
    }

    async fn engine_for_container(&self, id: &str) -> ClusterResult<(String, Arc<dyn HostEngine>)> {
        let address = self
            .storage
            .container_node(id)
            .await?
            .ok_or_else(|| ClusterError::ContainerNotMapped(id.to_string()))?;
        let engine = self.engines.engine(&address)?;
        Ok((address, engine))
    }

    pub async fn start_container(&self, id: &str) -> ClusterResult<()> {
        let (address, engine) = self.engine_for_container(id).await?;
        engine.start_container(id).await.map_err(|err| {
            self.observe_failure(&address, &err);
            ClusterError::Engine(err)
        })
    }

    pub async fn stop_container(&self, id: &str, grace_secs: i32) -> ClusterResult<()> {
        let (address, engine) = self.engine_for_container(id).await?;
        engine.stop_container(id, grace_secs).await.map_err(|err| {
            self.observe_failure(&address, &err);
            ClusterError::Engine(err)
        })
    }

    /// Remove a container and forget its node mapping. A container the
    /// engine no longer knows counts as removed.
    pub async fn remove_container(&self, id: &str) -> ClusterResult<()> {
        let (address, engine) = self.engine_for_container(id).await?;
        match engine.remove_container(id).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {
                self.storage.remove_container(id).await?;
                Ok(())
            }
            Err(err) => {
                self.observe_failure(&address, &err);
                Err(err.into())
            }
        }
    }

    pub async fn inspect_container(&self, id: &str) -> ClusterResult<ContainerInspectResponse> {
        let (_, engine) = self.engine_for_container(id).await?;
        Ok(engine.inspect_container(id).await?)
    }

    pub async fn wait_container(&self, id: &str) -> ClusterResult<i64> {
        let (_, engine) = self.engine_for_container(id).await?;
        Ok(engine.wait_container(id).await?)
    }

    pub async fn follow_logs(&self, id: &str, sink: &ProgressWriter) -> ClusterResult<()> {
        let (_, engine) = self.engine_for_container(id).await?;
        Ok(engine.follow_logs(id, sink).await?)
    }

    // ── Images ─────────────────────────────────────────────────────

    /// Commit a container to `repository` and record which node now holds
    /// the image. Returns the image ID.
    pub async fn commit_container(&self, id: &str, repository: &str) -> ClusterResult<String> {
        let (address, engine) = self.engine_for_container(id).await?;
        let image_id = engine.commit_container(id, repository).await?;
        self.storage.store_image(repository, &address).await?;
        Ok(image_id)
    }

    pub async fn pull_image(
        &self,
        image: &str,
        node_addr: &str,
        sink: &ProgressWriter,
    ) -> ClusterResult<()> {
        let engine = self.engines.engine(node_addr)?;
        engine.pull_image(image, sink).await?;
        self.storage.store_image(image, node_addr).await?;
        Ok(())
    }

    /// Push an image from a node that holds it, falling back to the first
    /// registered node.
    pub async fn push_image(&self, image: &str) -> ClusterResult<()> {
        let mut holders = self.storage.image_nodes(image).await?;
        if holders.is_empty() {
            holders = self
                .storage
                .nodes()
                .await?
                .into_iter()
                .map(|n| n.address)
                .collect();
        }
        let address = holders
            .first()
            .ok_or_else(|| ClusterError::ImageNotMapped(image.to_string()))?;
        let engine = self.engines.engine(address)?;
        Ok(engine.push_image(image).await?)
    }

    /// Remove an image from every node that holds it. Per-node failures are
    /// collected; the first is returned after all nodes were tried.
    pub async fn remove_image(&self, image: &str) -> ClusterResult<()> {
        let holders = self.storage.image_nodes(image).await?;
        if holders.is_empty() {
            return Err(ClusterError::ImageNotMapped(image.to_string()));
        }
        let mut first_error = None;
        for address in &holders {
            let engine = self.engines.engine(address)?;
            match engine.remove_image(image).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(err) => {
                    warn!(image, node = %address, error = %err, "image removal failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        self.storage.remove_image(image).await?;
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Build an image on the first registered node.
    pub async fn build_image(
        &self,
        name: &str,
        remote: &str,
        sink: &ProgressWriter,
    ) -> ClusterResult<()> {
        let nodes = self.storage.nodes().await?;
        let node = nodes.first().ok_or(ScheduleError::NoNodesAvailable)?;
        let engine = self.engines.engine(&node.address)?;
        engine.build_image(name, remote, sink).await?;
        self.storage.store_image(name, &node.address).await?;
        Ok(())
    }

    // ── Healing ────────────────────────────────────────────────────

    fn observe_failure(&self, address: &str, err: &EngineError) {
        if !err.is_transient() {
            return;
        }
        let healer = self.healer.lock().expect("healer slot poisoned").clone();
        let Some(healer) = healer else { return };
        let storage = self.storage.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let node = match storage.nodes().await {
                Ok(nodes) => nodes.into_iter().find(|n| n.address == address),
                Err(err) => {
                    error!(error = %err, "healer could not list nodes");
                    None
                }
            };
            if let Some(node) = node {
                warn!(node = %node.address, "invoking healer");
                healer.handle_failure(node).await;
            }
        });
    }

    /// Ping every node on `interval`, reporting failures to the healer.
    pub fn start_active_monitoring(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = self.ping_nodes().await {
                            warn!(error = %err, "active monitoring pass failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn ping_nodes(&self) -> ClusterResult<()> {
        for node in self.storage.nodes().await? {
            let engine = match self.engines.engine(&node.address) {
                Ok(engine) => engine,
                Err(err) => {
                    self.observe_failure(&node.address, &err);
                    continue;
                }
            };
            if let Err(err) = engine.ping().await {
                warn!(node = %node.address, error = %err, "node ping failed");
                self.observe_failure(&node.address, &err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::{FakeEngine, FakeEngineFactory};
    use std::collections::HashMap;

    /// Always picks the first candidate node.
    struct FirstNode;

    #[async_trait]
    impl Scheduler for FirstNode {
        async fn schedule(&self, nodes: &[Node], _app: &AppSpec) -> Result<Node, ScheduleError> {
            nodes.first().cloned().ok_or(ScheduleError::NoNodesAvailable)
        }
    }

    fn test_cluster() -> (Cluster, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::new("8888"));
        let cluster = Cluster::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(FirstNode),
            Arc::new(FakeEngineFactory::shared(engine.clone())),
        );
        (cluster, engine)
    }

    fn app() -> AppSpec {
        AppSpec::new("myapp", "python", 1)
    }

    #[tokio::test]
    async fn create_records_node_mapping() {
        let (cluster, _engine) = test_cluster();
        cluster
            .register("http://10.0.0.1:4243", HashMap::new())
            .await
            .unwrap();

        let (addr, id) = cluster
            .create_container(&app(), "cafebabe", ContainerCreateBody::default(), &[])
            .await
            .unwrap();

        assert_eq!(addr, "http://10.0.0.1:4243");
        assert!(!id.is_empty());
        // Per-container calls resolve through the stored mapping.
        cluster.start_container(&id).await.unwrap();
        cluster.inspect_container(&id).await.unwrap();
    }

    #[tokio::test]
    async fn create_with_unknown_destination_host_fails() {
        let (cluster, _engine) = test_cluster();
        cluster
            .register("http://10.0.0.1:4243", HashMap::new())
            .await
            .unwrap();

        let err = cluster
            .create_container(
                &app(),
                "cafebabe",
                ContainerCreateBody::default(),
                &["10.9.9.9".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Schedule(ScheduleError::NoSuchHost(_))
        ));
    }

    #[tokio::test]
    async fn create_with_destination_host_pins_node() {
        let (cluster, _engine) = test_cluster();
        cluster
            .register("http://10.0.0.1:4243", HashMap::new())
            .await
            .unwrap();
        cluster
            .register("http://10.0.0.2:4243", HashMap::new())
            .await
            .unwrap();

        let (addr, _) = cluster
            .create_container(
                &app(),
                "cafebabe",
                ContainerCreateBody::default(),
                &["10.0.0.2".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(addr, "http://10.0.0.2:4243");
    }

    #[tokio::test]
    async fn create_without_nodes_fails() {
        let (cluster, _engine) = test_cluster();
        let err = cluster
            .create_container(&app(), "cafebabe", ContainerCreateBody::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Schedule(ScheduleError::NoNodesAvailable)
        ));
    }

    #[tokio::test]
    async fn remove_clears_mapping_even_when_engine_forgot() {
        let (cluster, engine) = test_cluster();
        cluster
            .register("http://10.0.0.1:4243", HashMap::new())
            .await
            .unwrap();
        let (_, id) = cluster
            .create_container(&app(), "cafebabe", ContainerCreateBody::default(), &[])
            .await
            .unwrap();

        // Engine-side removal happened behind our back.
        engine.forget_container(&id);

        cluster.remove_container(&id).await.unwrap();
        let err = cluster.start_container(&id).await.unwrap_err();
        assert!(matches!(err, ClusterError::ContainerNotMapped(_)));
    }

    #[tokio::test]
    async fn commit_records_image_location() {
        let (cluster, _engine) = test_cluster();
        cluster
            .register("http://10.0.0.1:4243", HashMap::new())
            .await
            .unwrap();
        let (_, id) = cluster
            .create_container(&app(), "cafebabe", ContainerCreateBody::default(), &[])
            .await
            .unwrap();

        cluster.commit_container(&id, "quay/myapp").await.unwrap();
        cluster.push_image("quay/myapp").await.unwrap();
        cluster.remove_image("quay/myapp").await.unwrap();

        let err = cluster.remove_image("quay/myapp").await.unwrap_err();
        assert!(matches!(err, ClusterError::ImageNotMapped(_)));
    }

    #[tokio::test]
    async fn host_to_node_address_resolves() {
        let (cluster, _engine) = test_cluster();
        cluster
            .register("http://10.0.0.1:4243", HashMap::new())
            .await
            .unwrap();

        assert_eq!(
            cluster.host_to_node_address("10.0.0.1").await.unwrap(),
            "http://10.0.0.1:4243"
        );
        assert!(cluster.host_to_node_address("10.0.0.9").await.is_err());
    }
}

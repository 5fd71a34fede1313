//! Cluster storage — node membership and container/image locality.
//!
//! Backends are pluggable behind [`ClusterStorage`]: an in-memory map for
//! tests and single-process runs, and an embedded redb database for
//! persistent deployments.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ClusterError, ClusterResult};

/// A registered container-host node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// `scheme://host:port` of the node's engine endpoint.
    pub address: String,
    /// Free-form metadata; the scheduler reads `pool`, node-add records
    /// `iaas` and `id`.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(address: &str) -> Self {
        Node {
            address: address.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// Host portion of the node address.
    pub fn host(&self) -> String {
        quay_core::net::url_to_host(&self.address)
    }
}

#[async_trait]
pub trait ClusterStorage: Send + Sync {
    /// Insert or update a node, keyed by address.
    async fn register_node(&self, node: Node) -> ClusterResult<()>;

    /// Remove a node. Fails with `NodeNotFound` when absent.
    async fn unregister_node(&self, address: &str) -> ClusterResult<()>;

    async fn nodes(&self) -> ClusterResult<Vec<Node>>;

    /// Record which node runs a container.
    async fn store_container(&self, container_id: &str, node_addr: &str) -> ClusterResult<()>;

    async fn container_node(&self, container_id: &str) -> ClusterResult<Option<String>>;

    async fn remove_container(&self, container_id: &str) -> ClusterResult<()>;

    /// Record that a node holds an image.
    async fn store_image(&self, image: &str, node_addr: &str) -> ClusterResult<()>;

    async fn image_nodes(&self, image: &str) -> ClusterResult<Vec<String>>;

    async fn remove_image(&self, image: &str) -> ClusterResult<()>;
}

// ── In-memory backend ──────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    nodes: HashMap<String, Node>,
    containers: HashMap<String, String>,
    images: HashMap<String, Vec<String>>,
}

/// Map-backed storage for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStorage for MemoryStorage {
    async fn register_node(&self, node: Node) -> ClusterResult<()> {
        let mut state = self.state.write().await;
        state.nodes.insert(node.address.clone(), node);
        Ok(())
    }

    async fn unregister_node(&self, address: &str) -> ClusterResult<()> {
        let mut state = self.state.write().await;
        state
            .nodes
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NodeNotFound(address.to_string()))
    }

    async fn nodes(&self) -> ClusterResult<Vec<Node>> {
        let state = self.state.read().await;
        let mut nodes: Vec<Node> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(nodes)
    }

    async fn store_container(&self, container_id: &str, node_addr: &str) -> ClusterResult<()> {
        let mut state = self.state.write().await;
        state
            .containers
            .insert(container_id.to_string(), node_addr.to_string());
        Ok(())
    }

    async fn container_node(&self, container_id: &str) -> ClusterResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state.containers.get(container_id).cloned())
    }

    async fn remove_container(&self, container_id: &str) -> ClusterResult<()> {
        let mut state = self.state.write().await;
        state.containers.remove(container_id);
        Ok(())
    }

    async fn store_image(&self, image: &str, node_addr: &str) -> ClusterResult<()> {
        let mut state = self.state.write().await;
        let nodes = state.images.entry(image.to_string()).or_default();
        if !nodes.iter().any(|n| n == node_addr) {
            nodes.push(node_addr.to_string());
        }
        Ok(())
    }

    async fn image_nodes(&self, image: &str) -> ClusterResult<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.images.get(image).cloned().unwrap_or_default())
    }

    async fn remove_image(&self, image: &str) -> ClusterResult<()> {
        let mut state = self.state.write().await;
        state.images.remove(image);
        Ok(())
    }
}

// ── redb backend ───────────────────────────────────────────────────

const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_nodes");
const CONTAINERS: TableDefinition<&str, &str> = TableDefinition::new("cluster_containers");
const IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_images");

macro_rules! map_err {
    () => {
        |e| ClusterError::Storage(e.to_string())
    };
}

/// Embedded persistent backend; one writer at a time, so node writes are
/// serialized by construction.
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    pub fn open(path: &Path) -> ClusterResult<Self> {
        let db = Database::create(path).map_err(map_err!())?;
        let storage = RedbStorage { db: Arc::new(db) };
        storage.ensure_tables()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> ClusterResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!())?;
        let storage = RedbStorage { db: Arc::new(db) };
        storage.ensure_tables()?;
        Ok(storage)
    }

    fn ensure_tables(&self) -> ClusterResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        txn.open_table(NODES).map_err(map_err!())?;
        txn.open_table(CONTAINERS).map_err(map_err!())?;
        txn.open_table(IMAGES).map_err(map_err!())?;
        txn.commit().map_err(map_err!())?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStorage for RedbStorage {
    async fn register_node(&self, node: Node) -> ClusterResult<()> {
        let value = serde_json::to_vec(&node).map_err(map_err!())?;
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!())?;
            table
                .insert(node.address.as_str(), value.as_slice())
                .map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    async fn unregister_node(&self, address: &str) -> ClusterResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!())?;
            existed = table.remove(address).map_err(map_err!())?.is_some();
        }
        txn.commit().map_err(map_err!())?;
        if existed {
            Ok(())
        } else {
            Err(ClusterError::NodeNotFound(address.to_string()))
        }
    }

    async fn nodes(&self) -> ClusterResult<Vec<Node>> {
        let txn = self.db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(NODES).map_err(map_err!())?;
        let mut nodes = Vec::new();
        for entry in table.iter().map_err(map_err!())? {
            let (_, value) = entry.map_err(map_err!())?;
            nodes.push(serde_json::from_slice(value.value()).map_err(map_err!())?);
        }
        Ok(nodes)
    }

    async fn store_container(&self, container_id: &str, node_addr: &str) -> ClusterResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!())?;
            table.insert(container_id, node_addr).map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    async fn container_node(&self, container_id: &str) -> ClusterResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(CONTAINERS).map_err(map_err!())?;
        Ok(table
            .get(container_id)
            .map_err(map_err!())?
            .map(|g| g.value().to_string()))
    }

    async fn remove_container(&self, container_id: &str) -> ClusterResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(CONTAINERS).map_err(map_err!())?;
            table.remove(container_id).map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    async fn store_image(&self, image: &str, node_addr: &str) -> ClusterResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(IMAGES).map_err(map_err!())?;
            let mut nodes: Vec<String> = match table.get(image).map_err(map_err!())? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!())?,
                None => Vec::new(),
            };
            if !nodes.iter().any(|n| n == node_addr) {
                nodes.push(node_addr.to_string());
            }
            let value = serde_json::to_vec(&nodes).map_err(map_err!())?;
            table.insert(image, value.as_slice()).map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    async fn image_nodes(&self, image: &str) -> ClusterResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(IMAGES).map_err(map_err!())?;
        match table.get(image).map_err(map_err!())? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!()),
            None => Ok(Vec::new()),
        }
    }

    async fn remove_image(&self, image: &str) -> ClusterResult<()> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(IMAGES).map_err(map_err!())?;
            table.remove(image).map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }
}

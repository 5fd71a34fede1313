//! Node recycling on repeated failure.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use quaygrid_cluster::{Cluster, DockerEngine, Healer, HostEngine, Node};

/// Re-checks a failing node after a short pause and unregisters it when it
/// stays unreachable, so the scheduler stops placing units there. The node
/// can be re-added through the admin API once it recovers.
pub struct RecycleHealer {
    cluster: Weak<Cluster>,
}

impl RecycleHealer {
    pub fn new(cluster: Weak<Cluster>) -> Self {
        RecycleHealer { cluster }
    }
}

#[async_trait]
impl Healer for RecycleHealer {
    async fn handle_failure(&self, node: Node) {
        let Some(cluster) = self.cluster.upgrade() else {
            return;
        };
        tokio::time::sleep(Duration::from_secs(5)).await;

        let reachable = match DockerEngine::connect(&node.address) {
            Ok(engine) => engine.ping().await.is_ok(),
            Err(_) => false,
        };
        if reachable {
            info!(node = %node.address, "node recovered, leaving it registered");
            return;
        }

        warn!(node = %node.address, "node still unreachable, unregistering");
        if let Err(err) = cluster.unregister(&node.address).await {
            warn!(node = %node.address, error = %err, "failed to unregister node");
        }
    }
}

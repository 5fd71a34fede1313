//! Stateless round-robin placement.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use quay_core::AppSpec;
use quaygrid_cluster::{Node, ScheduleError, Scheduler};

/// Rotates over the node list with an atomic counter. Lock-free and safe
/// for concurrent use; the counter wraps over whatever list it is handed.
#[derive(Default)]
pub struct RoundRobinScheduler {
    counter: AtomicUsize,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Scheduler for RoundRobinScheduler {
    async fn schedule(&self, nodes: &[Node], _app: &AppSpec) -> Result<Node, ScheduleError> {
        if nodes.is_empty() {
            return Err(ScheduleError::NoNodesAvailable);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Ok(nodes[index].clone())
    }
}

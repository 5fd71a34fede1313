//! Pool/team segregated placement.

use async_trait::async_trait;
use tracing::debug;

use quay_core::AppSpec;
use quaygrid_cluster::{Node, ScheduleError, Scheduler};
use quaygrid_state::MetaStore;

/// Schedules within the pools the app's teams are entitled to, minimizing
/// per-app co-location: the candidate hosting the fewest containers of the
/// requesting app wins, ties broken by total container count, then by
/// address ordering.
pub struct SegregatedScheduler {
    store: MetaStore,
}

impl SegregatedScheduler {
    pub fn new(store: MetaStore) -> Self {
        SegregatedScheduler { store }
    }
}

#[async_trait]
impl Scheduler for SegregatedScheduler {
    async fn schedule(&self, nodes: &[Node], app: &AppSpec) -> Result<Node, ScheduleError> {
        let pools = self
            .store
            .pools_for_teams(&app.teams)
            .map_err(|e| ScheduleError::Storage(e.to_string()))?;
        let pool_names: Vec<&str> = pools.iter().map(|p| p.name.as_str()).collect();

        let candidates: Vec<&Node> = nodes
            .iter()
            .filter(|node| {
                node.metadata
                    .get("pool")
                    .map(|pool| pool_names.contains(&pool.as_str()))
                    .unwrap_or(false)
            })
            .collect();
        if candidates.is_empty() {
            return Err(ScheduleError::NoNodesAvailable);
        }

        let mut ranked = Vec::with_capacity(candidates.len());
        for node in candidates {
            let host = node.host();
            let app_count = self
                .store
                .count_app_on_host(&app.name, &host)
                .map_err(|e| ScheduleError::Storage(e.to_string()))?;
            let total_count = self
                .store
                .count_by_host(&host)
                .map_err(|e| ScheduleError::Storage(e.to_string()))?;
            ranked.push((app_count, total_count, node.address.clone(), node));
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let (app_count, total_count, _, node) = &ranked[0];
        debug!(
            app = %app.name,
            node = %node.address,
            app_count,
            total_count,
            "segregated placement"
        );
        Ok((*node).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quaygrid_state::{ContainerRecord, Pool, Status};

    fn node_in_pool(address: &str, pool: &str) -> Node {
        let mut node = Node::new(address);
        node.metadata.insert("pool".to_string(), pool.to_string());
        node
    }

    fn team_app(name: &str, teams: &[&str]) -> AppSpec {
        AppSpec {
            teams: teams.iter().map(|t| t.to_string()).collect(),
            ..AppSpec::new(name, "python", 1)
        }
    }

    fn store_with_pool(pool: &str, teams: &[&str]) -> MetaStore {
        let store = MetaStore::open_in_memory().unwrap();
        store
            .add_pool(&Pool {
                name: pool.to_string(),
                teams: teams.iter().map(|t| t.to_string()).collect(),
            })
            .unwrap();
        store
    }

    fn record_on_host(store: &MetaStore, app: &str, id: &str, host: &str) {
        let mut record = ContainerRecord::building(app, "python");
        record.id = id.to_string();
        record.host_addr = host.to_string();
        record.status = Status::Started;
        store.add_container(&record).unwrap();
    }

    #[tokio::test]
    async fn only_entitled_pools_are_candidates() {
        let store = store_with_pool("pool1", &["ateam"]);
        let scheduler = SegregatedScheduler::new(store);
        let nodes = vec![
            node_in_pool("http://10.0.0.1:4243", "pool1"),
            node_in_pool("http://10.0.0.2:4243", "pool2"),
        ];

        let picked = scheduler
            .schedule(&nodes, &team_app("myapp", &["ateam"]))
            .await
            .unwrap();
        assert_eq!(picked.address, "http://10.0.0.1:4243");
    }

    #[tokio::test]
    async fn no_entitled_pool_means_no_nodes() {
        let store = store_with_pool("pool1", &["ateam"]);
        let scheduler = SegregatedScheduler::new(store);
        let nodes = vec![node_in_pool("http://10.0.0.1:4243", "pool1")];

        let err = scheduler
            .schedule(&nodes, &team_app("myapp", &["otherteam"]))
            .await;
        assert!(matches!(err, Err(ScheduleError::NoNodesAvailable)));
    }

    #[tokio::test]
    async fn fewest_app_containers_wins() {
        let store = store_with_pool("pool1", &["ateam"]);
        record_on_host(&store, "myapp", "c-1", "10.0.0.1");
        record_on_host(&store, "myapp", "c-2", "10.0.0.1");
        record_on_host(&store, "myapp", "c-3", "10.0.0.2");
        let scheduler = SegregatedScheduler::new(store);
        let nodes = vec![
            node_in_pool("http://10.0.0.1:4243", "pool1"),
            node_in_pool("http://10.0.0.2:4243", "pool1"),
        ];

        let picked = scheduler
            .schedule(&nodes, &team_app("myapp", &["ateam"]))
            .await
            .unwrap();
        assert_eq!(picked.address, "http://10.0.0.2:4243");
    }

    #[tokio::test]
    async fn tie_broken_by_total_count_then_address() {
        let store = store_with_pool("pool1", &["ateam"]);
        // Same per-app count (zero), host .1 busier with another app.
        record_on_host(&store, "noisy", "c-9", "10.0.0.1");
        let scheduler = SegregatedScheduler::new(store);
        let nodes = vec![
            node_in_pool("http://10.0.0.1:4243", "pool1"),
            node_in_pool("http://10.0.0.2:4243", "pool1"),
        ];

        let picked = scheduler
            .schedule(&nodes, &team_app("myapp", &["ateam"]))
            .await
            .unwrap();
        assert_eq!(picked.address, "http://10.0.0.2:4243");

        // Full tie: lexicographically smallest address.
        let store = store_with_pool("pool1", &["ateam"]);
        let scheduler = SegregatedScheduler::new(store);
        let picked = scheduler
            .schedule(&nodes, &team_app("myapp", &["ateam"]))
            .await
            .unwrap();
        assert_eq!(picked.address, "http://10.0.0.1:4243");
    }

    #[tokio::test]
    async fn empty_node_list_fails() {
        let store = store_with_pool("pool1", &["ateam"]);
        let scheduler = SegregatedScheduler::new(store);
        let err = scheduler.schedule(&[], &team_app("myapp", &["ateam"])).await;
        assert!(matches!(err, Err(ScheduleError::NoNodesAvailable)));
    }
}

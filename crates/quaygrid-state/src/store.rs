//! MetaStore — redb-backed persistence for container records, pools, and
//! machines.
//!
//! Records are keyed by their client-chosen name; a secondary table maps the
//! engine-assigned container ID back to the name once it is known. Both the
//! ID and the name are unique while the record exists.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe metadata store backed by redb.
#[derive(Clone)]
pub struct MetaStore {
    db: Arc<Database>,
}

impl MetaStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "metadata store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        txn.open_table(CONTAINER_IDS).map_err(map_err!(Table))?;
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Container records ──────────────────────────────────────────

    /// Insert a new record. Fails with `DuplicateRecord` when the name, or a
    /// non-empty ID, already exists.
    pub fn add_container(&self, record: &ContainerRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let mut ids = txn.open_table(CONTAINER_IDS).map_err(map_err!(Table))?;
            if containers
                .get(record.name.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::DuplicateRecord(record.name.clone()));
            }
            if !record.id.is_empty()
                && ids.get(record.id.as_str()).map_err(map_err!(Read))?.is_some()
            {
                return Err(StateError::DuplicateRecord(record.id.clone()));
            }
            containers
                .insert(record.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            if !record.id.is_empty() {
                ids.insert(record.id.as_str(), record.name.as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %record.name, app = %record.app_name, "container record stored");
        Ok(())
    }

    /// Update an existing record in place, keyed by name.
    pub fn update_container(&self, record: &ContainerRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let mut ids = txn.open_table(CONTAINER_IDS).map_err(map_err!(Table))?;
            let previous = match containers
                .get(record.name.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => serde_json::from_slice::<ContainerRecord>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => return Err(StateError::ContainerNotFound(record.name.clone())),
            };
            if !previous.id.is_empty() && previous.id != record.id {
                ids.remove(previous.id.as_str()).map_err(map_err!(Write))?;
            }
            containers
                .insert(record.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            if !record.id.is_empty() {
                ids.insert(record.id.as_str(), record.name.as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Update `status` and touch `last_status_update`. The timestamp changes
    /// exactly when the status changes; setting the same status is a no-op.
    /// Returns the record as stored.
    pub fn set_status(&self, id: &str, status: Status) -> StateResult<ContainerRecord> {
        let mut record = self.container_by_id(id)?;
        if record.status != status {
            record.status = status;
            record.last_status_update = Utc::now();
            self.update_container(&record)?;
        }
        Ok(record)
    }

    /// Update the committed image reference for a record.
    pub fn set_image(&self, id: &str, image: &str) -> StateResult<ContainerRecord> {
        let mut record = self.container_by_id(id)?;
        record.image = image.to_string();
        self.update_container(&record)?;
        Ok(record)
    }

    pub fn container_by_id(&self, id: &str) -> StateResult<ContainerRecord> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let ids = txn.open_table(CONTAINER_IDS).map_err(map_err!(Table))?;
        let name = match ids.get(id).map_err(map_err!(Read))? {
            Some(guard) => guard.value().to_string(),
            None => return Err(StateError::ContainerNotFound(id.to_string())),
        };
        let containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        match containers.get(name.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Err(StateError::ContainerNotFound(id.to_string())),
        }
    }

    pub fn container_by_name(&self, name: &str) -> StateResult<Option<ContainerRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        match containers.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    fn scan_containers<F>(&self, mut keep: F) -> StateResult<Vec<ContainerRecord>>
    where
        F: FnMut(&ContainerRecord) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in containers.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ContainerRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    pub fn list_all(&self) -> StateResult<Vec<ContainerRecord>> {
        self.scan_containers(|_| true)
    }

    pub fn list_by_app(&self, app_name: &str) -> StateResult<Vec<ContainerRecord>> {
        self.scan_containers(|r| r.app_name == app_name)
    }

    /// Records for an app ordered for scale-down victim selection: removable
    /// states (`building`, `down`, `error`) first, then `unreachable`,
    /// `stopped`, `created`, `started`; ties broken oldest status change
    /// first.
    pub fn list_by_app_ordered_by_status(
        &self,
        app_name: &str,
    ) -> StateResult<Vec<ContainerRecord>> {
        let mut records = self.list_by_app(app_name)?;
        records.sort_by(|a, b| {
            a.status
                .removal_rank()
                .cmp(&b.status.removal_rank())
                .then(a.last_status_update.cmp(&b.last_status_update))
        });
        Ok(records)
    }

    pub fn list_by_host(&self, host_addr: &str) -> StateResult<Vec<ContainerRecord>> {
        self.scan_containers(|r| r.host_addr == host_addr)
    }

    pub fn count_by_app(&self, app_name: &str) -> StateResult<usize> {
        Ok(self.list_by_app(app_name)?.len())
    }

    pub fn count_by_host(&self, host_addr: &str) -> StateResult<usize> {
        Ok(self.list_by_host(host_addr)?.len())
    }

    pub fn count_app_on_host(&self, app_name: &str, host_addr: &str) -> StateResult<usize> {
        Ok(self
            .scan_containers(|r| r.app_name == app_name && r.host_addr == host_addr)?
            .len())
    }

    /// Remove a record by name. Returns true if it existed.
    pub fn remove_container(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut containers = txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
            let mut ids = txn.open_table(CONTAINER_IDS).map_err(map_err!(Table))?;
            let removed = containers.remove(name).map_err(map_err!(Write))?;
            existed = match removed {
                Some(guard) => {
                    let record: ContainerRecord = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    if !record.id.is_empty() {
                        ids.remove(record.id.as_str()).map_err(map_err!(Write))?;
                    }
                    true
                }
                None => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Pools ──────────────────────────────────────────────────────

    pub fn add_pool(&self, pool: &Pool) -> StateResult<()> {
        let value = serde_json::to_vec(pool).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            pools
                .insert(pool.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn remove_pool(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            existed = pools.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    pub fn get_pool(&self, name: &str) -> StateResult<Option<Pool>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
        match pools.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    pub fn list_pools(&self) -> StateResult<Vec<Pool>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in pools.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    pub fn add_teams_to_pool(&self, name: &str, teams: &[String]) -> StateResult<Pool> {
        let mut pool = self
            .get_pool(name)?
            .ok_or_else(|| StateError::PoolNotFound(name.to_string()))?;
        for team in teams {
            if !pool.teams.contains(team) {
                pool.teams.push(team.clone());
            }
        }
        self.add_pool(&pool)?;
        Ok(pool)
    }

    pub fn remove_teams_from_pool(&self, name: &str, teams: &[String]) -> StateResult<Pool> {
        let mut pool = self
            .get_pool(name)?
            .ok_or_else(|| StateError::PoolNotFound(name.to_string()))?;
        pool.teams.retain(|t| !teams.contains(t));
        self.add_pool(&pool)?;
        Ok(pool)
    }

    /// All pools any of the given teams is entitled to.
    pub fn pools_for_teams(&self, teams: &[String]) -> StateResult<Vec<Pool>> {
        Ok(self
            .list_pools()?
            .into_iter()
            .filter(|p| p.teams.iter().any(|t| teams.contains(t)))
            .collect())
    }

    // ── Machines ───────────────────────────────────────────────────

    pub fn add_machine(&self, machine: &Machine) -> StateResult<()> {
        let value = serde_json::to_vec(machine).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut machines = txn.open_table(MACHINES).map_err(map_err!(Table))?;
            machines
                .insert(machine.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn remove_machine(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut machines = txn.open_table(MACHINES).map_err(map_err!(Table))?;
            existed = machines.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    pub fn list_machines(&self) -> StateResult<Vec<Machine>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let machines = txn.open_table(MACHINES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in machines.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    pub fn machine_by_address(&self, address: &str) -> StateResult<Option<Machine>> {
        Ok(self
            .list_machines()?
            .into_iter()
            .find(|m| m.address == address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn test_record(app: &str, id: &str, status: Status) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            status,
            ..ContainerRecord::building(app, "python")
        }
    }

    // ── Record CRUD ────────────────────────────────────────────────

    #[test]
    fn add_and_get_by_name() {
        let store = MetaStore::open_in_memory().unwrap();
        let record = test_record("myapp", "", Status::Building);

        store.add_container(&record).unwrap();
        let loaded = store.container_by_name(&record.name).unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[test]
    fn add_duplicate_name_rejected() {
        let store = MetaStore::open_in_memory().unwrap();
        let record = test_record("myapp", "", Status::Building);
        store.add_container(&record).unwrap();

        let err = store.add_container(&record);
        assert!(matches!(err, Err(StateError::DuplicateRecord(_))));
    }

    #[test]
    fn add_duplicate_id_rejected() {
        let store = MetaStore::open_in_memory().unwrap();
        store
            .add_container(&test_record("myapp", "abc123", Status::Created))
            .unwrap();

        let other = test_record("myapp", "abc123", Status::Created);
        let err = store.add_container(&other);
        assert!(matches!(err, Err(StateError::DuplicateRecord(_))));
    }

    #[test]
    fn id_index_follows_update() {
        let store = MetaStore::open_in_memory().unwrap();
        let mut record = test_record("myapp", "", Status::Building);
        store.add_container(&record).unwrap();

        record.id = "engine-id-1".to_string();
        record.host_addr = "10.0.0.1".to_string();
        store.update_container(&record).unwrap();

        let loaded = store.container_by_id("engine-id-1").unwrap();
        assert_eq!(loaded.name, record.name);
        assert_eq!(loaded.host_addr, "10.0.0.1");
    }

    #[test]
    fn update_missing_record_fails() {
        let store = MetaStore::open_in_memory().unwrap();
        let record = test_record("myapp", "", Status::Building);
        let err = store.update_container(&record);
        assert!(matches!(err, Err(StateError::ContainerNotFound(_))));
    }

    #[test]
    fn set_status_touches_timestamp_only_on_change() {
        let store = MetaStore::open_in_memory().unwrap();
        let mut record = test_record("myapp", "c-300", Status::Created);
        record.last_status_update = Utc::now() - Duration::hours(1);
        store.add_container(&record).unwrap();

        let updated = store.set_status("c-300", Status::Started).unwrap();
        assert_eq!(updated.status, Status::Started);
        assert!(updated.last_status_update > record.last_status_update);

        // Same status again: timestamp untouched.
        let again = store.set_status("c-300", Status::Started).unwrap();
        assert_eq!(again.last_status_update, updated.last_status_update);
    }

    #[test]
    fn set_image_persists() {
        let store = MetaStore::open_in_memory().unwrap();
        store
            .add_container(&test_record("myapp", "c-300", Status::Created))
            .unwrap();

        store.set_image("c-300", "quay/myapp").unwrap();
        let loaded = store.container_by_id("c-300").unwrap();
        assert_eq!(loaded.image, "quay/myapp");
    }

    #[test]
    fn get_by_unknown_id_fails() {
        let store = MetaStore::open_in_memory().unwrap();
        let err = store.container_by_id("wut");
        assert!(matches!(err, Err(StateError::ContainerNotFound(_))));
    }

    #[test]
    fn list_by_app() {
        let store = MetaStore::open_in_memory().unwrap();
        store
            .add_container(&test_record("something", "abcdef", Status::Started))
            .unwrap();
        store
            .add_container(&test_record("something", "fedajs", Status::Started))
            .unwrap();
        store
            .add_container(&test_record("otherthing", "wat", Status::Started))
            .unwrap();

        assert_eq!(store.list_by_app("something").unwrap().len(), 2);
        assert_eq!(store.list_by_app("otherthing").unwrap().len(), 1);
        assert!(store.list_by_app("unknown").unwrap().is_empty());
    }

    #[test]
    fn list_by_host() {
        let store = MetaStore::open_in_memory().unwrap();
        let mut a = test_record("app1", "blabla", Status::Started);
        a.host_addr = "10.0.0.1".to_string();
        let mut b = test_record("app2", "bleble", Status::Started);
        b.host_addr = "10.0.0.1".to_string();
        let mut c = test_record("app1", "blublu", Status::Started);
        c.host_addr = "10.0.0.2".to_string();
        for record in [&a, &b, &c] {
            store.add_container(record).unwrap();
        }

        assert_eq!(store.list_by_host("10.0.0.1").unwrap().len(), 2);
        assert_eq!(store.count_by_host("10.0.0.2").unwrap(), 1);
        assert_eq!(store.count_app_on_host("app1", "10.0.0.1").unwrap(), 1);
    }

    #[test]
    fn ordered_by_status_puts_removable_first() {
        let store = MetaStore::open_in_memory().unwrap();
        let now = Utc::now();
        let entries = [
            ("started-old", Status::Started, now - Duration::hours(3)),
            ("building", Status::Building, now),
            ("stopped", Status::Stopped, now - Duration::hours(1)),
            ("error", Status::Error, now - Duration::minutes(5)),
            ("unreachable", Status::Unreachable, now),
            ("started-new", Status::Started, now),
        ];
        for (id, status, at) in entries {
            let mut record = test_record("myapp", id, status);
            record.last_status_update = at;
            store.add_container(&record).unwrap();
        }

        let ordered = store.list_by_app_ordered_by_status("myapp").unwrap();
        let ids: Vec<&str> = ordered.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "error",
                "building",
                "unreachable",
                "stopped",
                "started-old",
                "started-new"
            ]
        );
    }

    #[test]
    fn remove_clears_both_tables() {
        let store = MetaStore::open_in_memory().unwrap();
        let record = test_record("myapp", "c-1", Status::Started);
        store.add_container(&record).unwrap();

        assert!(store.remove_container(&record.name).unwrap());
        assert!(!store.remove_container(&record.name).unwrap());
        assert!(store.container_by_name(&record.name).unwrap().is_none());
        assert!(matches!(
            store.container_by_id("c-1"),
            Err(StateError::ContainerNotFound(_))
        ));
    }

    // ── Pools ──────────────────────────────────────────────────────

    #[test]
    fn pool_crud() {
        let store = MetaStore::open_in_memory().unwrap();
        store
            .add_pool(&Pool {
                name: "pool1".to_string(),
                teams: vec![],
            })
            .unwrap();

        assert_eq!(store.list_pools().unwrap().len(), 1);
        assert!(store.remove_pool("pool1").unwrap());
        assert!(!store.remove_pool("pool1").unwrap());
    }

    #[test]
    fn pool_team_membership() {
        let store = MetaStore::open_in_memory().unwrap();
        store
            .add_pool(&Pool {
                name: "pool1".to_string(),
                teams: vec![],
            })
            .unwrap();

        let pool = store
            .add_teams_to_pool("pool1", &["test".to_string()])
            .unwrap();
        assert_eq!(pool.teams, vec!["test"]);

        // Adding the same team twice is a no-op.
        let pool = store
            .add_teams_to_pool("pool1", &["test".to_string()])
            .unwrap();
        assert_eq!(pool.teams, vec!["test"]);

        let pool = store
            .remove_teams_from_pool("pool1", &["test".to_string()])
            .unwrap();
        assert!(pool.teams.is_empty());
    }

    #[test]
    fn pools_for_teams_filters() {
        let store = MetaStore::open_in_memory().unwrap();
        store
            .add_pool(&Pool {
                name: "pool1".to_string(),
                teams: vec!["ateam".to_string(), "bteam".to_string()],
            })
            .unwrap();
        store
            .add_pool(&Pool {
                name: "pool2".to_string(),
                teams: vec!["cteam".to_string()],
            })
            .unwrap();

        let pools = store.pools_for_teams(&["ateam".to_string()]).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].name, "pool1");

        assert!(store
            .pools_for_teams(&["nobody".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn team_ops_on_missing_pool_fail() {
        let store = MetaStore::open_in_memory().unwrap();
        let err = store.add_teams_to_pool("nope", &["t".to_string()]);
        assert!(matches!(err, Err(StateError::PoolNotFound(_))));
    }

    // ── Machines ───────────────────────────────────────────────────

    #[test]
    fn machine_crud() {
        let store = MetaStore::open_in_memory().unwrap();
        let machine = Machine {
            id: "m-1".to_string(),
            iaas: "test-iaas".to_string(),
            status: "running".to_string(),
            address: "m-1.fake.host".to_string(),
        };
        store.add_machine(&machine).unwrap();

        assert_eq!(store.list_machines().unwrap(), vec![machine.clone()]);
        assert_eq!(
            store.machine_by_address("m-1.fake.host").unwrap(),
            Some(machine)
        );
        assert!(store.remove_machine("m-1").unwrap());
        assert!(store.machine_by_address("m-1.fake.host").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        let name;
        {
            let store = MetaStore::open(&db_path).unwrap();
            let record = test_record("prod", "c-9", Status::Started);
            name = record.name.clone();
            store.add_container(&record).unwrap();
        }

        let store = MetaStore::open(&db_path).unwrap();
        let loaded = store.container_by_name(&name).unwrap().unwrap();
        assert_eq!(loaded.id, "c-9");
        assert_eq!(loaded.app_name, "prod");
    }

    #[test]
    fn empty_store_operations() {
        let store = MetaStore::open_in_memory().unwrap();
        assert!(store.list_all().unwrap().is_empty());
        assert!(store.list_pools().unwrap().is_empty());
        assert!(store.list_machines().unwrap().is_empty());
        assert!(!store.remove_container("nope").unwrap());
    }
}

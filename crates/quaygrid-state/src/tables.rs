//! redb table definitions.

use redb::TableDefinition;

/// Container records, keyed by the client-chosen record name.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Engine-assigned container ID → record name.
pub const CONTAINER_IDS: TableDefinition<&str, &str> = TableDefinition::new("container_ids");

/// Scheduling pools, keyed by pool name.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Machines created through the machine provider, keyed by machine ID.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");

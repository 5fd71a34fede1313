//! quaygrid-state — metadata store for container records, pools, and
//! provisioned machines.
//!
//! One persisted row per running unit, plus the scheduling pools and the
//! machines created through the machine provider. All values are
//! JSON-serialized into redb tables; the store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! The store is the single source of truth for container records: every
//! mutation made by the provisioning pipelines goes through it.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::MetaStore;
pub use types::{ContainerRecord, Machine, Pool, Status, record_name};

//! quaygrid-cluster — one API over a pool of container-host nodes.
//!
//! The [`Cluster`] keeps the node registry in a pluggable
//! [`ClusterStorage`] backend, resolves which node holds a given container
//! or image, and routes host-engine calls there. Container creation
//! consults the configured [`Scheduler`] to pick a node.
//!
//! Cluster storage is the single source of truth for node membership and
//! image/container locality; all mutations go through this crate.

pub mod cluster;
pub mod engine;
pub mod error;
pub mod iaas;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::{Cluster, Healer, Scheduler};
pub use engine::{DockerEngine, DockerEngineFactory, EngineFactory, HostEngine};
pub use error::{ClusterError, ClusterResult, EngineError, EngineResult, ScheduleError};
pub use iaas::{IaasError, MachineProvider, MachineProviders, ProvisionedMachine};
pub use storage::{ClusterStorage, MemoryStorage, Node, RedbStorage};

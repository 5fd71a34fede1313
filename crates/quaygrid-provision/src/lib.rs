//! quaygrid-provision — the deploy and lifecycle flows of the provisioner.
//!
//! Composes reversible pipelines over the cluster (host engines), the
//! metadata store (container records), and the edge router:
//!
//! - deploy (git or archive): build container → commit → replace units
//! - add / remove units, with routes added before old ones are removed
//! - start / stop / restart / destroy with concurrent per-container fan-out
//! - container moves and fleet rebalancing with streamed progress
//! - fix-containers, repairing records that drifted from host state
//!
//! Fan-outs join every task before returning; the first error wins and the
//! rest are drained to the log. Rollback is strictly local to one pipeline.

pub mod actions;
pub mod cmds;
pub mod deploy;
pub mod error;
pub mod fix;
pub mod lifecycle;
pub mod netinfo;
pub mod provisioner;
pub mod rebalance;

pub use error::{ProvisionError, ProvisionResult};
pub use provisioner::{Deps, Provisioner};

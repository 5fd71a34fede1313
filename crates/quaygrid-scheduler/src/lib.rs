//! quaygrid-scheduler — node selection for new containers.
//!
//! Two modes, selected by configuration:
//!
//! - [`RoundRobinScheduler`] (default) — stateless rotation over the node
//!   list.
//! - [`SegregatedScheduler`] — honors the pool/team segregation model:
//!   only nodes whose pool the app's teams are entitled to are candidates,
//!   and among those the one hosting the fewest of the app's containers
//!   wins, minimizing per-app co-location.
//!
//! An explicit destination host is resolved upstream by the cluster, which
//! narrows the candidate list before calling the scheduler.

pub mod round_robin;
pub mod segregated;

pub use round_robin::RoundRobinScheduler;
pub use segregated::SegregatedScheduler;

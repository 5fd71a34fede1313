//! quaygrid-shell — interactive shell and one-shot command transport into
//! containers.
//!
//! Two modes, chosen per container record:
//!
//! - **Direct** — when a record carries a private key and a published shell
//!   port, dial `host:ssh_host_port` over SSH using the stored key as the
//!   sole auth method.
//! - **Legacy agent** — for older records without key material, POST the
//!   command to the per-host agent
//!   (`http://host:agent_port/container/<ip>/cmd`) and stream the response.
//!
//! The ssh2 session is blocking; all of it runs on the blocking thread
//! pool, bridged to async callers over channels.

pub mod agent;
pub mod error;
pub mod keys;
pub mod ssh;

pub use agent::AgentClient;
pub use error::{ShellError, ShellResult};
pub use keys::{generate_keypair, KeyPair};
pub use ssh::{exec, shell, ExecOutput, SshTarget};

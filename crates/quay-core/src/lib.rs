//! quay-core — shared foundation for the QuayGrid provisioner.
//!
//! Holds the pieces every other crate needs:
//!
//! - [`config::QuayConfig`] — typed quay.toml configuration
//! - [`app::AppSpec`] — the read-only application capability set
//! - [`image`] — image reference assembly (`registry/namespace/name`)
//! - [`net`] — address and port helpers
//! - [`progress`] — newline-delimited JSON progress streams

pub mod app;
pub mod config;
pub mod image;
pub mod net;
pub mod progress;

pub use app::AppSpec;
pub use config::QuayConfig;
pub use progress::{ProgressLog, ProgressWriter};

//! Read-only application capability set.
//!
//! The application model is owned elsewhere; the provisioner only sees the
//! handful of fields that influence placement, resource limits, and image
//! selection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    /// Platform family (python, ruby, ...). Containers record it as `kind`.
    pub platform: String,
    /// Memory limit per unit, in megabytes.
    pub memory_mb: u64,
    /// Swap limit per unit, in megabytes.
    pub swap_mb: u64,
    /// Number of deploys performed so far.
    pub deploys: u32,
    /// Force the next deploy to start from the platform image.
    pub update_platform: bool,
    /// Teams entitled to this app, used by the segregated scheduler.
    pub teams: Vec<String>,
}

impl AppSpec {
    /// Convenience constructor for tests and simple callers.
    pub fn new(name: &str, platform: &str, deploys: u32) -> Self {
        AppSpec {
            name: name.to_string(),
            platform: platform.to_string(),
            memory_mb: 0,
            swap_mb: 0,
            deploys,
            update_platform: false,
            teams: Vec::new(),
        }
    }

    /// Whether the next deploy should start from the platform image rather
    /// than the app's last committed image. True for the first deploy, every
    /// tenth deploy, and whenever a platform update is pending.
    pub fn use_platform_image(&self) -> bool {
        self.deploys == 0 || self.deploys % 10 == 0 || self.update_platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_platform_image_rules() {
        assert!(AppSpec::new("a", "python", 0).use_platform_image());
        assert!(AppSpec::new("a", "python", 10).use_platform_image());
        assert!(AppSpec::new("a", "python", 20).use_platform_image());
        assert!(AppSpec::new("a", "python", 40).use_platform_image());
        assert!(!AppSpec::new("a", "python", 1).use_platform_image());
        assert!(!AppSpec::new("a", "python", 19).use_platform_image());

        let mut app = AppSpec::new("a", "python", 19);
        app.update_platform = true;
        assert!(app.use_platform_image());
    }
}

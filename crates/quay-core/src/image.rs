//! Image reference assembly.
//!
//! Image names have the shape `[registry/]namespace/name`; the registry
//! segment is present only when one is configured.

use crate::config::QuayConfig;

/// Assemble the image reference for an app or platform name.
pub fn assemble_image_name(config: &QuayConfig, name: &str) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(3);
    if let Some(registry) = config.registry.as_deref() {
        if !registry.is_empty() {
            parts.push(registry);
        }
    }
    parts.push(&config.repository_namespace);
    parts.push(name);
    parts.join("/")
}

/// Image committed from an app's build container.
pub fn app_image(config: &QuayConfig, app_name: &str) -> String {
    assemble_image_name(config, app_name)
}

/// Base image for an app's platform.
pub fn platform_image(config: &QuayConfig, platform: &str) -> String {
    assemble_image_name(config, platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_namespace(namespace: &str) -> QuayConfig {
        QuayConfig {
            repository_namespace: namespace.to_string(),
            ..QuayConfig::default()
        }
    }

    #[test]
    fn image_name_without_registry() {
        let config = config_with_namespace("acme");
        assert_eq!(assemble_image_name(&config, "raising"), "acme/raising");
    }

    #[test]
    fn image_name_with_registry() {
        let mut config = config_with_namespace("acme");
        config.registry = Some("localhost:3030".to_string());
        assert_eq!(
            assemble_image_name(&config, "raising"),
            "localhost:3030/acme/raising"
        );
    }

    #[test]
    fn app_and_platform_images() {
        let config = config_with_namespace("quay");
        assert_eq!(app_image(&config, "myapp"), "quay/myapp");
        assert_eq!(platform_image(&config, "python"), "quay/python");
    }
}

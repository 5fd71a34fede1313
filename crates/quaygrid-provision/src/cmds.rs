//! In-container command lines for builds and runtime units.

use quay_core::QuayConfig;

use crate::error::{ProvisionError, ProvisionResult};

/// Commands that install the generated public key and start the shell
/// daemon inside a unit.
pub fn ssh_cmds(config: &QuayConfig, public_key: &str) -> ProvisionResult<Vec<String>> {
    if config.ssh.add_key_cmd.is_empty() {
        return Err(ProvisionError::Validation(
            "ssh add-key command is not configured".to_string(),
        ));
    }
    Ok(vec![
        format!("{} {}", config.ssh.add_key_cmd, public_key),
        format!("sudo {} -D", config.ssh.sshd_path),
    ])
}

/// Full command line for a runtime unit: install the key, background the
/// shell daemon, exec the app launcher.
pub fn run_with_agent_cmds(config: &QuayConfig, public_key: &str) -> ProvisionResult<Vec<String>> {
    let ssh = ssh_cmds(config, public_key)?;
    Ok(vec![
        "/bin/bash".to_string(),
        "-lc".to_string(),
        format!("{} && {} & {}", ssh[0], ssh[1], config.run_cmd.bin),
    ])
}

/// Command line for a git-based build container.
pub fn git_deploy_cmds(
    config: &QuayConfig,
    app_name: &str,
    version: &str,
) -> ProvisionResult<Vec<String>> {
    let host = config.git_ro_host.as_deref().ok_or_else(|| {
        ProvisionError::Validation("git read-only host is not configured".to_string())
    })?;
    Ok(vec![
        config.run_cmd.deploy.clone(),
        "git".to_string(),
        format!("git://{host}/{app_name}.git"),
        version.to_string(),
    ])
}

/// Command line for an archive-based build container.
pub fn archive_deploy_cmds(config: &QuayConfig, archive_url: &str) -> Vec<String> {
    vec![
        config.run_cmd.deploy.clone(),
        "archive".to_string(),
        archive_url.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_cmds_shape() {
        let config = QuayConfig::default();
        let cmds = ssh_cmds(&config, "ssh-rsa ohwait! me@machine").unwrap();
        assert_eq!(
            cmds[0],
            "/var/lib/quay/add-key ssh-rsa ohwait! me@machine"
        );
        assert_eq!(cmds[1], "sudo /usr/sbin/sshd -D");
    }

    #[test]
    fn ssh_cmds_requires_add_key_cmd() {
        let mut config = QuayConfig::default();
        config.ssh.add_key_cmd = String::new();
        assert!(ssh_cmds(&config, "my-key").is_err());
    }

    #[test]
    fn run_with_agent_wraps_in_shell() {
        let config = QuayConfig::default();
        let cmds = run_with_agent_cmds(&config, "ssh-rsa key").unwrap();
        assert_eq!(cmds[0], "/bin/bash");
        assert_eq!(cmds[1], "-lc");
        assert!(cmds[2].contains("/var/lib/quay/add-key ssh-rsa key"));
        assert!(cmds[2].ends_with("/var/lib/quay/start"));
    }

    #[test]
    fn git_deploy_cmds_build_clone_url() {
        let mut config = QuayConfig::default();
        config.git_ro_host = Some("git.example.com".to_string());
        let cmds = git_deploy_cmds(&config, "myapp", "ff13e").unwrap();
        assert_eq!(
            cmds,
            vec![
                "/var/lib/quay/deploy",
                "git",
                "git://git.example.com/myapp.git",
                "ff13e"
            ]
        );
    }

    #[test]
    fn git_deploy_requires_host() {
        let config = QuayConfig::default();
        assert!(git_deploy_cmds(&config, "myapp", "v1").is_err());
    }

    #[test]
    fn archive_deploy_cmds_shape() {
        let config = QuayConfig::default();
        let cmds =
            archive_deploy_cmds(&config, "https://s3.amazonaws.com/wat/archive.tar.gz");
        assert_eq!(cmds[1], "archive");
        assert_eq!(cmds[2], "https://s3.amazonaws.com/wat/archive.tar.gz");
    }
}

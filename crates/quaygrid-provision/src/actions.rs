//! Pipeline actions shared by the deploy and scale flows.
//!
//! Two pipelines run over these actions:
//!
//! - the run-container pipeline (deploy builds and single units):
//!   insert record → create container → start → update record → then either
//!   follow-logs-and-commit (builds) or set-network-info (units);
//! - the change-units pipeline (scale and replace): provision new units →
//!   add new routes → remove old routes → remove old units.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use quay_core::{image, net, AppSpec, ProgressWriter, QuayConfig};
use quaygrid_pipeline::Action;
use quaygrid_router::RouterError;
use quaygrid_state::{ContainerRecord, Status};

use crate::error::{ProvisionError, ProvisionResult};
use crate::lifecycle;
use crate::netinfo;
use crate::provisioner::{log_failure, Deps};

// ── Contexts ───────────────────────────────────────────────────────

/// Context of the run-container pipeline.
pub struct RunContainerCtx {
    pub app: AppSpec,
    pub image: String,
    pub commands: Vec<String>,
    /// Restrict scheduling to these hosts; empty means the whole registry.
    pub destination_hosts: Vec<String>,
    /// Private key stored on the record; empty for build containers.
    pub private_key: String,
    pub writer: ProgressWriter,
    /// The record being built up, set by the first action.
    pub container: Option<ContainerRecord>,
    /// Image reference produced by follow-logs-and-commit.
    pub built_image: Option<String>,
}

impl RunContainerCtx {
    fn container_mut(&mut self) -> ProvisionResult<&mut ContainerRecord> {
        self.container
            .as_mut()
            .ok_or_else(|| ProvisionError::Internal("no container in pipeline context".into()))
    }
}

/// Context of the change-units pipeline.
pub struct ChangeUnitsCtx {
    pub app: AppSpec,
    pub units_to_add: usize,
    pub to_remove: Vec<ContainerRecord>,
    /// Restrict new units to these hosts; empty means the whole registry.
    pub destination_hosts: Vec<String>,
    pub writer: ProgressWriter,
    /// Units created by `ProvisionAddUnits`.
    pub added: Vec<ContainerRecord>,
}

// ── Run-container actions ──────────────────────────────────────────

/// Persist a fresh record in `building` state under a generated name.
pub struct InsertEmptyRecord {
    pub deps: Deps,
}

#[async_trait]
impl Action<RunContainerCtx, ProvisionError> for InsertEmptyRecord {
    fn name(&self) -> &'static str {
        "insert-empty-record"
    }

    async fn forward(&self, ctx: &mut RunContainerCtx) -> ProvisionResult<()> {
        let mut record = ContainerRecord::building(&ctx.app.name, &ctx.app.platform);
        record.image = ctx.image.clone();
        record.private_key = ctx.private_key.clone();
        self.deps.store.add_container(&record)?;
        ctx.container = Some(record);
        Ok(())
    }

    async fn backward(&self, ctx: &mut RunContainerCtx) {
        if let Some(record) = &ctx.container {
            log_failure(
                "removing record during rollback",
                self.deps.store.remove_container(&record.name),
            );
        }
    }
}

/// Create the container on a scheduler-chosen node.
pub struct CreateContainer {
    pub deps: Deps,
}

#[async_trait]
impl Action<RunContainerCtx, ProvisionError> for CreateContainer {
    fn name(&self) -> &'static str {
        "create-container"
    }

    async fn forward(&self, ctx: &mut RunContainerCtx) -> ProvisionResult<()> {
        let body = container_body(&self.deps.config, &ctx.app, &ctx.image, &ctx.commands);
        let app = ctx.app.clone();
        let hosts = ctx.destination_hosts.clone();
        let record = ctx.container_mut()?;
        debug!(
            app = %app.name,
            image = %record.image,
            "creating container"
        );
        let (node_addr, id) = self
            .deps
            .cluster
            .create_container(&app, &record.name, body, &hosts)
            .await?;
        record.id = id;
        record.host_addr = net::url_to_host(&node_addr);
        record.user = self.deps.config.ssh.user.clone();
        record.status = Status::Created;
        Ok(())
    }

    async fn backward(&self, ctx: &mut RunContainerCtx) {
        if let Some(record) = &ctx.container {
            if !record.id.is_empty() {
                log_failure(
                    "removing container during rollback",
                    self.deps.cluster.remove_container(&record.id).await,
                );
            }
        }
    }
}

pub struct StartContainer {
    pub deps: Deps,
}

#[async_trait]
impl Action<RunContainerCtx, ProvisionError> for StartContainer {
    fn name(&self) -> &'static str {
        "start-container"
    }

    async fn forward(&self, ctx: &mut RunContainerCtx) -> ProvisionResult<()> {
        let record = ctx.container_mut()?;
        debug!(container = %record.id, "starting container");
        self.deps.cluster.start_container(&record.id).await?;
        Ok(())
    }

    async fn backward(&self, ctx: &mut RunContainerCtx) {
        if let Some(record) = &ctx.container {
            log_failure(
                "stopping container during rollback",
                self.deps
                    .cluster
                    .stop_container(&record.id, lifecycle::STOP_GRACE_SECS)
                    .await,
            );
        }
    }
}

/// Persist the engine-assigned ID, host address, and user.
pub struct UpdateRecord {
    pub deps: Deps,
}

#[async_trait]
impl Action<RunContainerCtx, ProvisionError> for UpdateRecord {
    fn name(&self) -> &'static str {
        "update-record"
    }

    async fn forward(&self, ctx: &mut RunContainerCtx) -> ProvisionResult<()> {
        let record = ctx.container_mut()?;
        self.deps.store.update_container(record)?;
        Ok(())
    }
}

/// Record the container's IP and published ports.
pub struct SetNetworkInfo {
    pub deps: Deps,
}

#[async_trait]
impl Action<RunContainerCtx, ProvisionError> for SetNetworkInfo {
    fn name(&self) -> &'static str {
        "set-network-info"
    }

    async fn forward(&self, ctx: &mut RunContainerCtx) -> ProvisionResult<()> {
        let id = ctx.container_mut()?.id.clone();
        let info = netinfo::network_info(&self.deps, &id).await?;
        let record = ctx.container_mut()?;
        record.ip = info.ip;
        record.host_port = info.http_host_port;
        record.ssh_host_port = info.ssh_host_port;
        self.deps.store.update_container(record)?;
        Ok(())
    }
}

/// Stream the build container's output, wait for it to exit, and commit
/// the result. A non-zero exit fails the deploy. On success the build
/// container and its record are discarded.
pub struct FollowLogsAndCommit {
    pub deps: Deps,
}

#[async_trait]
impl Action<RunContainerCtx, ProvisionError> for FollowLogsAndCommit {
    fn name(&self) -> &'static str {
        "follow-logs-and-commit"
    }

    async fn forward(&self, ctx: &mut RunContainerCtx) -> ProvisionResult<()> {
        let record = ctx
            .container
            .clone()
            .ok_or_else(|| ProvisionError::Internal("no container in pipeline context".into()))?;

        self.deps.cluster.follow_logs(&record.id, &ctx.writer).await?;
        let exit_code = self.deps.cluster.wait_container(&record.id).await?;
        if exit_code != 0 {
            return Err(ProvisionError::ExitStatus(exit_code));
        }

        let repository = image::app_image(&self.deps.config, &ctx.app.name);
        self.deps
            .cluster
            .commit_container(&record.id, &repository)
            .await?;
        if self.deps.config.registry.is_some() {
            self.deps.cluster.push_image(&repository).await?;
        }

        // The build container served its purpose.
        lifecycle::remove_container(&self.deps, &record).await;
        ctx.container = None;
        ctx.built_image = Some(repository);
        Ok(())
    }
}

// ── Change-units actions ───────────────────────────────────────────

/// Launch the requested number of units concurrently.
pub struct ProvisionAddUnits {
    pub deps: Deps,
}

#[async_trait]
impl Action<ChangeUnitsCtx, ProvisionError> for ProvisionAddUnits {
    fn name(&self) -> &'static str {
        "provision-add-units"
    }

    fn check(&self, ctx: &ChangeUnitsCtx) -> ProvisionResult<()> {
        if ctx.units_to_add == 0 {
            return Err(ProvisionError::Validation("Cannot add 0 units".to_string()));
        }
        Ok(())
    }

    async fn forward(&self, ctx: &mut ChangeUnitsCtx) -> ProvisionResult<()> {
        ctx.added = lifecycle::add_containers_with_host(
            &self.deps,
            &ctx.app,
            ctx.units_to_add,
            ctx.destination_hosts.clone(),
            &ctx.writer,
        )
        .await?;
        Ok(())
    }

    async fn backward(&self, ctx: &mut ChangeUnitsCtx) {
        for record in &ctx.added {
            error!(container = %record.id, "removing unit added by failed pipeline");
            lifecycle::remove_container(&self.deps, record).await;
        }
    }
}

/// Route every new unit. Routes already added are withdrawn if a later one
/// fails, so the step is all-or-nothing.
pub struct AddNewRoutes {
    pub deps: Deps,
}

#[async_trait]
impl Action<ChangeUnitsCtx, ProvisionError> for AddNewRoutes {
    fn name(&self) -> &'static str {
        "add-new-routes"
    }

    async fn forward(&self, ctx: &mut ChangeUnitsCtx) -> ProvisionResult<()> {
        let mut routed: Vec<&ContainerRecord> = Vec::with_capacity(ctx.added.len());
        for record in &ctx.added {
            if let Err(err) = self
                .deps
                .router
                .add_route(&record.app_name, &record.address())
                .await
            {
                for done in routed {
                    log_failure(
                        "withdrawing route after partial add",
                        self.deps
                            .router
                            .remove_route(&done.app_name, &done.address())
                            .await,
                    );
                }
                return Err(err.into());
            }
            routed.push(record);
        }
        Ok(())
    }

    async fn backward(&self, ctx: &mut ChangeUnitsCtx) {
        for record in &ctx.added {
            log_failure(
                "removing route during rollback",
                self.deps
                    .router
                    .remove_route(&record.app_name, &record.address())
                    .await,
            );
        }
    }
}

/// Withdraw the routes of the outgoing units. A route that is already gone
/// is fine; any other failure restores what was withdrawn and fails the
/// step.
pub struct RemoveOldRoutes {
    pub deps: Deps,
}

#[async_trait]
impl Action<ChangeUnitsCtx, ProvisionError> for RemoveOldRoutes {
    fn name(&self) -> &'static str {
        "remove-old-routes"
    }

    async fn forward(&self, ctx: &mut ChangeUnitsCtx) -> ProvisionResult<()> {
        let mut removed: Vec<&ContainerRecord> = Vec::with_capacity(ctx.to_remove.len());
        for record in &ctx.to_remove {
            match self
                .deps
                .router
                .remove_route(&record.app_name, &record.address())
                .await
            {
                Ok(()) | Err(RouterError::RouteNotFound) => removed.push(record),
                Err(err) => {
                    for done in removed {
                        log_failure(
                            "restoring route after partial removal",
                            self.deps
                                .router
                                .add_route(&done.app_name, &done.address())
                                .await,
                        );
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    async fn backward(&self, ctx: &mut ChangeUnitsCtx) {
        for record in &ctx.to_remove {
            log_failure(
                "restoring route during rollback",
                self.deps
                    .router
                    .add_route(&record.app_name, &record.address())
                    .await,
            );
        }
    }
}

/// Stop and remove the outgoing units concurrently. Failures are logged
/// only; the pipeline keeps its result.
pub struct RemoveOldUnits {
    pub deps: Deps,
}

#[async_trait]
impl Action<ChangeUnitsCtx, ProvisionError> for RemoveOldUnits {
    fn name(&self) -> &'static str {
        "remove-old-units"
    }

    async fn forward(&self, ctx: &mut ChangeUnitsCtx) -> ProvisionResult<()> {
        let total = ctx.to_remove.len();
        let plural = if total == 1 { "" } else { "s" };
        ctx.writer
            .raw(format!("\n---- Removing {total} old unit{plural} ----"));

        let mut tasks = tokio::task::JoinSet::new();
        for record in ctx.to_remove.clone() {
            let deps = self.deps.clone();
            tasks.spawn(async move {
                lifecycle::remove_container(&deps, &record).await;
            });
        }
        let mut counter = 0;
        while let Some(joined) = tasks.join_next().await {
            log_failure("old-unit removal task", joined);
            counter += 1;
            ctx.writer
                .raw(format!(" ---> Removed old unit {counter}/{total}"));
        }
        Ok(())
    }
}

// ── Container configuration ────────────────────────────────────────

/// Assemble the engine-side container configuration: command, exposed
/// application and shell ports, memory limits, environment, and the
/// optional shared filesystem bind.
pub(crate) fn container_body(
    config: &QuayConfig,
    app: &AppSpec,
    image: &str,
    commands: &[String],
) -> ContainerCreateBody {
    let app_port = format!("{}/tcp", config.run_cmd.port);
    let empty = HashMap::new();
    let exposed_ports = HashMap::from([
        (app_port.clone(), empty.clone()),
        ("22/tcp".to_string(), empty.clone()),
    ]);

    let unbound = Some(vec![PortBinding {
        host_ip: Some(String::new()),
        host_port: Some(String::new()),
    }]);
    let port_bindings = HashMap::from([
        (app_port, unbound.clone()),
        ("22/tcp".to_string(), unbound),
    ]);

    let mut env = vec![format!("QUAY_APP_DIR={}", config.run_cmd.app_dir)];
    let mut volumes = None;
    let mut binds = None;
    if let Some(shared) = &config.sharedfs {
        env.push(format!("QUAY_SHAREDFS_MOUNTPOINT={}", shared.mountpoint));
        volumes = Some(HashMap::from([(shared.mountpoint.clone(), empty)]));
        let host_dir = if shared.app_isolation {
            let subdir = match &shared.salt {
                Some(salt) => {
                    let digest = Sha256::digest(format!("{salt}{}", app.name).as_bytes());
                    digest.iter().map(|b| format!("{b:02x}")).collect()
                }
                None => app.name.clone(),
            };
            format!("{}/{}", shared.hostdir, subdir)
        } else {
            shared.hostdir.clone()
        };
        binds = Some(vec![format!("{host_dir}:{}:rw", shared.mountpoint)]);
    }

    ContainerCreateBody {
        image: Some(image.to_string()),
        cmd: Some(commands.to_vec()),
        user: Some(config.ssh.user.clone()),
        exposed_ports: Some(exposed_ports),
        env: Some(env),
        volumes,
        attach_stdin: Some(false),
        attach_stdout: Some(false),
        attach_stderr: Some(false),
        host_config: Some(HostConfig {
            memory: Some((app.memory_mb * 1024 * 1024) as i64),
            memory_swap: Some((app.swap_mb * 1024 * 1024) as i64),
            port_bindings: Some(port_bindings),
            binds,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_with_memory(memory_mb: u64) -> AppSpec {
        AppSpec {
            memory_mb,
            ..AppSpec::new("app-name", "brainfuck", 1)
        }
    }

    #[test]
    fn body_exposes_app_and_shell_ports() {
        let config = QuayConfig::default();
        let body = container_body(
            &config,
            &app_with_memory(15),
            "quay/brainfuck",
            &["docker".to_string(), "run".to_string()],
        );

        let exposed = body.exposed_ports.unwrap();
        assert!(exposed.contains_key("8888/tcp"));
        assert!(exposed.contains_key("22/tcp"));
        assert_eq!(
            body.cmd.as_deref(),
            Some(&["docker".to_string(), "run".to_string()][..])
        );
        assert_eq!(body.user.as_deref(), Some("ubuntu"));

        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(15 * 1024 * 1024));
        let bindings = host.port_bindings.unwrap();
        assert!(bindings.contains_key("8888/tcp"));
        assert!(bindings.contains_key("22/tcp"));
    }

    #[test]
    fn body_env_includes_app_dir() {
        let config = QuayConfig::default();
        let body = container_body(&config, &app_with_memory(0), "img", &[]);
        let env = body.env.unwrap();
        assert!(env.contains(&"QUAY_APP_DIR=/home/application/current".to_string()));
        assert!(body.volumes.is_none());
    }

    #[test]
    fn sharedfs_adds_mount_and_env() {
        let mut config = QuayConfig::default();
        config.sharedfs = Some(quay_core::config::SharedFsConfig {
            hostdir: "/srv/shared".to_string(),
            mountpoint: "/mnt/shared".to_string(),
            app_isolation: false,
            salt: None,
        });
        let body = container_body(&config, &app_with_memory(0), "img", &[]);

        let env = body.env.unwrap();
        assert!(env.contains(&"QUAY_SHAREDFS_MOUNTPOINT=/mnt/shared".to_string()));
        let binds = body.host_config.unwrap().binds.unwrap();
        assert_eq!(binds, vec!["/srv/shared:/mnt/shared:rw"]);
    }

    #[test]
    fn sharedfs_isolation_hashes_with_salt() {
        let mut config = QuayConfig::default();
        config.sharedfs = Some(quay_core::config::SharedFsConfig {
            hostdir: "/srv/shared".to_string(),
            mountpoint: "/mnt/shared".to_string(),
            app_isolation: true,
            salt: Some("pepper".to_string()),
        });
        let body = container_body(&config, &app_with_memory(0), "img", &[]);

        let binds = body.host_config.unwrap().binds.unwrap();
        let bind = &binds[0];
        assert!(bind.starts_with("/srv/shared/"));
        assert!(bind.ends_with(":/mnt/shared:rw"));
        // Salted: the app name itself must not appear.
        assert!(!bind.contains("app-name"));
    }

    #[test]
    fn sharedfs_isolation_without_salt_uses_app_name() {
        let mut config = QuayConfig::default();
        config.sharedfs = Some(quay_core::config::SharedFsConfig {
            hostdir: "/srv/shared".to_string(),
            mountpoint: "/mnt/shared".to_string(),
            app_isolation: true,
            salt: None,
        });
        let body = container_body(&config, &app_with_memory(0), "img", &[]);

        let binds = body.host_config.unwrap().binds.unwrap();
        assert_eq!(binds, vec!["/srv/shared/app-name:/mnt/shared:rw"]);
    }
}

//! The provisioner facade.
//!
//! [`Provisioner`] owns the shared dependencies (config, cluster, metadata
//! store, edge router, legacy shell agent) and exposes every operation the
//! admin surface and the application layer call. The flows themselves live
//! in the sibling modules; this type wires them together.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use quay_core::{image, AppSpec, ProgressWriter, QuayConfig};
use quaygrid_cluster::Cluster;
use quaygrid_router::Router;
use quaygrid_shell::AgentClient;
use quaygrid_state::{ContainerRecord, MetaStore, Status};

use crate::error::{ProvisionError, ProvisionResult};
use crate::{cmds, deploy, fix, lifecycle, rebalance};

/// Shared dependencies threaded through pipelines and fan-out tasks.
#[derive(Clone)]
pub struct Deps {
    pub config: QuayConfig,
    pub cluster: Arc<Cluster>,
    pub store: MetaStore,
    pub router: Arc<dyn Router>,
    pub agent: Arc<AgentClient>,
}

pub struct Provisioner {
    deps: Deps,
}

impl Provisioner {
    pub fn new(
        config: QuayConfig,
        cluster: Arc<Cluster>,
        store: MetaStore,
        router: Arc<dyn Router>,
    ) -> Self {
        let agent = Arc::new(AgentClient::new(config.ssh.agent_port));
        Provisioner {
            deps: Deps {
                config,
                cluster,
                store,
                router,
                agent,
            },
        }
    }

    pub fn config(&self) -> &QuayConfig {
        &self.deps.config
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.deps.cluster
    }

    pub fn store(&self) -> &MetaStore {
        &self.deps.store
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.deps.router
    }

    // ── App lifecycle ──────────────────────────────────────────────

    /// Prepare routing for a new app.
    pub async fn provision_app(&self, app: &AppSpec) -> ProvisionResult<()> {
        Ok(self.deps.router.add_backend(&app.name).await?)
    }

    pub async fn destroy_app(&self, app: &AppSpec) -> ProvisionResult<()> {
        lifecycle::destroy_app(&self.deps, app).await
    }

    pub async fn start_app(&self, app: &AppSpec) -> ProvisionResult<()> {
        lifecycle::start_app(&self.deps, app).await
    }

    pub async fn stop_app(&self, app: &AppSpec) -> ProvisionResult<()> {
        lifecycle::stop_app(&self.deps, app).await
    }

    pub async fn restart_app(&self, app: &AppSpec) -> ProvisionResult<()> {
        self.stop_app(app).await?;
        self.start_app(app).await
    }

    // ── Deploys ────────────────────────────────────────────────────

    /// Deploy from a git ref. Returns the committed image reference.
    pub async fn git_deploy(
        &self,
        app: &AppSpec,
        version: &str,
        writer: &ProgressWriter,
    ) -> ProvisionResult<String> {
        let commands = cmds::git_deploy_cmds(&self.deps.config, &app.name, version)?;
        deploy::deploy(&self.deps, app, commands, writer).await
    }

    /// Deploy from an archive URL. Returns the committed image reference.
    pub async fn archive_deploy(
        &self,
        app: &AppSpec,
        archive_url: &str,
        writer: &ProgressWriter,
    ) -> ProvisionResult<String> {
        let commands = cmds::archive_deploy_cmds(&self.deps.config, archive_url);
        deploy::deploy(&self.deps, app, commands, writer).await
    }

    // ── Units ──────────────────────────────────────────────────────

    pub async fn add_units(
        &self,
        app: &AppSpec,
        count: usize,
        writer: &ProgressWriter,
    ) -> ProvisionResult<Vec<ContainerRecord>> {
        lifecycle::add_units(&self.deps, app, count, writer).await
    }

    pub async fn remove_units(&self, app: &AppSpec, count: usize) -> ProvisionResult<()> {
        lifecycle::remove_units(&self.deps, app, count).await
    }

    pub fn units(&self, app: &AppSpec) -> ProvisionResult<Vec<ContainerRecord>> {
        Ok(self.deps.store.list_by_app(&app.name)?)
    }

    pub fn set_unit_status(
        &self,
        unit_id: &str,
        app_name: &str,
        status: Status,
    ) -> ProvisionResult<ContainerRecord> {
        let record = self.deps.store.container_by_id(unit_id)?;
        if record.app_name != app_name {
            return Err(ProvisionError::Validation("wrong app name".to_string()));
        }
        Ok(self.deps.store.set_status(unit_id, status)?)
    }

    // ── Commands in containers ─────────────────────────────────────

    /// Run a command in every container of the app.
    pub async fn execute_command(
        &self,
        app: &AppSpec,
        cmd: &str,
        args: &[String],
        sink: &ProgressWriter,
    ) -> ProvisionResult<()> {
        let containers = self.deps.store.list_by_app(&app.name)?;
        if containers.is_empty() {
            return Err(ProvisionError::EmptyApp(app.name.clone()));
        }
        for record in &containers {
            lifecycle::run_in_container(&self.deps, record, cmd, args, sink).await?;
        }
        Ok(())
    }

    /// Run a command in one container of the app.
    pub async fn execute_command_once(
        &self,
        app: &AppSpec,
        cmd: &str,
        args: &[String],
        sink: &ProgressWriter,
    ) -> ProvisionResult<()> {
        let containers = self.deps.store.list_by_app(&app.name)?;
        let record = containers
            .first()
            .ok_or_else(|| ProvisionError::EmptyApp(app.name.clone()))?;
        lifecycle::run_in_container(&self.deps, record, cmd, args, sink).await
    }

    // ── Routing ────────────────────────────────────────────────────

    pub async fn app_addr(&self, app: &AppSpec) -> ProvisionResult<String> {
        Ok(self.deps.router.addr(&app.name).await?)
    }

    pub async fn swap_apps(&self, app1: &AppSpec, app2: &AppSpec) -> ProvisionResult<()> {
        Ok(self.deps.router.swap(&app1.name, &app2.name).await?)
    }

    pub async fn set_cname(&self, app: &AppSpec, cname: &str) -> ProvisionResult<()> {
        Ok(self.deps.router.set_cname(cname, &app.name).await?)
    }

    pub async fn unset_cname(&self, app: &AppSpec, cname: &str) -> ProvisionResult<()> {
        Ok(self.deps.router.unset_cname(cname, &app.name).await?)
    }

    // ── Platforms ──────────────────────────────────────────────────

    /// Build and push a platform image from a remote Dockerfile.
    pub async fn platform_add(
        &self,
        name: &str,
        dockerfile_url: &str,
        writer: &ProgressWriter,
    ) -> ProvisionResult<()> {
        if dockerfile_url.is_empty() {
            return Err(ProvisionError::Validation(
                "Dockerfile is required.".to_string(),
            ));
        }
        if !dockerfile_url.starts_with("http://") && !dockerfile_url.starts_with("https://") {
            return Err(ProvisionError::Validation(
                "dockerfile parameter should be an url.".to_string(),
            ));
        }
        let image_name = image::platform_image(&self.deps.config, name);
        self.deps
            .cluster
            .build_image(&image_name, dockerfile_url, writer)
            .await?;
        if self.deps.config.registry.is_some() {
            self.deps.cluster.push_image(&image_name).await?;
        }
        Ok(())
    }

    pub async fn platform_update(
        &self,
        name: &str,
        dockerfile_url: &str,
        writer: &ProgressWriter,
    ) -> ProvisionResult<()> {
        self.platform_add(name, dockerfile_url, writer).await
    }

    // ── Admin flows ────────────────────────────────────────────────

    pub async fn move_container(
        &self,
        container_id: &str,
        to_host: &str,
        writer: &ProgressWriter,
    ) -> ProvisionResult<()> {
        rebalance::move_container(&self.deps, container_id, to_host, writer).await
    }

    pub async fn move_containers(
        &self,
        from_host: &str,
        to_host: &str,
        writer: &ProgressWriter,
    ) -> ProvisionResult<()> {
        rebalance::move_containers(&self.deps, from_host, to_host, writer).await
    }

    pub async fn rebalance(
        &self,
        dry: bool,
        writer: &ProgressWriter,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        rebalance::rebalance(&self.deps, dry, writer, cancel).await
    }

    pub async fn fix_containers(&self) -> ProvisionResult<()> {
        fix::fix_containers(&self.deps).await
    }

    /// Stop and remove one container, its record, and its route. Used by
    /// unit removal APIs; failures are logged, removal proceeds.
    pub async fn remove_container_unit(&self, record: &ContainerRecord) -> ProvisionResult<()> {
        lifecycle::remove_container(&self.deps, record).await;
        Ok(())
    }
}

/// Log-and-continue helper for best-effort steps.
pub(crate) fn log_failure<T, E: std::fmt::Display>(context: &str, result: Result<T, E>) {
    if let Err(err) = result {
        error!(error = %err, "{context}");
    }
}

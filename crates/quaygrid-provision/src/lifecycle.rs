//! Per-container and per-app lifecycle operations.
//!
//! Every per-container step fans out one task per container; the fan-out
//! joins all tasks before returning, the first error wins, and the rest
//! are drained to the log.

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use quay_core::{image, AppSpec, ProgressWriter};
use quaygrid_pipeline::Pipeline;
use quaygrid_router::RouterError;
use quaygrid_state::{ContainerRecord, Status};

use crate::actions::{
    AddNewRoutes, ChangeUnitsCtx, CreateContainer, InsertEmptyRecord, ProvisionAddUnits,
    RemoveOldRoutes, RemoveOldUnits, RunContainerCtx, SetNetworkInfo, StartContainer,
    UpdateRecord,
};
use crate::cmds;
use crate::error::{ProvisionError, ProvisionResult};
use crate::netinfo;
use crate::provisioner::{log_failure, Deps};

/// Grace window handed to the engine when stopping a container.
pub const STOP_GRACE_SECS: i32 = 10;

// ── Single containers ──────────────────────────────────────────────

/// Stop one container. Stopping an already-stopped container succeeds
/// without touching the record.
pub async fn stop_container(deps: &Deps, record: &ContainerRecord) -> ProvisionResult<()> {
    if record.status == Status::Stopped {
        return Ok(());
    }
    log_failure(
        "stopping container",
        deps.cluster.stop_container(&record.id, STOP_GRACE_SECS).await,
    );
    deps.store.set_status(&record.id, Status::Stopped)?;
    Ok(())
}

/// Stop and remove one container, its record, its route, and its legacy
/// agent entry. Every step is best-effort; failures are logged and removal
/// proceeds.
pub async fn remove_container(deps: &Deps, record: &ContainerRecord) {
    let address = record.address();
    log_failure("stopping unit for removal", stop_container(deps, record).await);

    debug!(container = %record.id, "removing container from host");
    if !record.id.is_empty() {
        log_failure(
            "removing container from host",
            deps.cluster.remove_container(&record.id).await,
        );
    }
    if !record.ip.is_empty() && !record.host_addr.is_empty() {
        log_failure(
            "notifying shell agent of removal",
            deps.agent
                .remove_container(&record.host_addr, &record.ip)
                .await,
        );
    }
    log_failure(
        "removing container record",
        deps.store.remove_container(&record.name),
    );
    match deps.router.remove_route(&record.app_name, &address).await {
        Ok(()) | Err(RouterError::RouteNotFound) => {}
        Err(err) => error!(error = %err, "removing route for deleted container"),
    }
}

/// Run one command in a container, preferring the direct shell transport
/// and falling back to the legacy host agent for old records.
pub async fn run_in_container(
    deps: &Deps,
    record: &ContainerRecord,
    cmd: &str,
    args: &[String],
    sink: &ProgressWriter,
) -> ProvisionResult<()> {
    if !record.private_key.is_empty() && !record.ssh_host_port.is_empty() {
        let port = record.ssh_host_port.parse::<u16>().map_err(|_| {
            ProvisionError::Internal(format!(
                "record {} has invalid shell port {}",
                record.id, record.ssh_host_port
            ))
        })?;
        let target = quaygrid_shell::SshTarget {
            host: record.host_addr.clone(),
            port,
            user: record.user.clone(),
            private_key: record.private_key.clone(),
        };
        let output = quaygrid_shell::exec(target, cmd.to_string(), args.to_vec()).await?;
        sink.raw(String::from_utf8_lossy(&output.stdout).to_string());
        if !output.stderr.is_empty() {
            sink.raw(String::from_utf8_lossy(&output.stderr).to_string());
        }
        if output.exit_code != 0 {
            return Err(ProvisionError::ExitStatus(output.exit_code as i64));
        }
        Ok(())
    } else {
        Ok(deps
            .agent
            .run_command(&record.host_addr, &record.ip, cmd, args, sink)
            .await?)
    }
}

// ── Single units ───────────────────────────────────────────────────

/// Launch one unit: generate its keypair, run the run-container pipeline,
/// record the image, and mark it started.
pub async fn start_unit(
    deps: Deps,
    app: AppSpec,
    image: String,
    destination_hosts: Vec<String>,
    writer: ProgressWriter,
) -> ProvisionResult<ContainerRecord> {
    let keypair = quaygrid_shell::generate_keypair().await?;
    let commands = cmds::run_with_agent_cmds(&deps.config, &keypair.public_key)?;

    let mut ctx = RunContainerCtx {
        app,
        image: image.clone(),
        commands,
        destination_hosts,
        private_key: keypair.private_key,
        writer,
        container: None,
        built_image: None,
    };
    let actions: Vec<Box<dyn quaygrid_pipeline::Action<RunContainerCtx, ProvisionError>>> = vec![
        Box::new(InsertEmptyRecord { deps: deps.clone() }),
        Box::new(CreateContainer { deps: deps.clone() }),
        Box::new(StartContainer { deps: deps.clone() }),
        Box::new(UpdateRecord { deps: deps.clone() }),
        Box::new(SetNetworkInfo { deps: deps.clone() }),
    ];
    Pipeline::new(actions).execute(&mut ctx).await?;

    let record = ctx
        .container
        .ok_or_else(|| ProvisionError::Internal("unit pipeline produced no container".into()))?;
    deps.store.set_image(&record.id, &image)?;
    let record = deps.store.set_status(&record.id, Status::Started)?;
    Ok(record)
}

/// Launch `count` units concurrently. On any failure, the units that did
/// come up are removed and the first error is returned.
pub async fn add_containers_with_host(
    deps: &Deps,
    app: &AppSpec,
    count: usize,
    destination_hosts: Vec<String>,
    writer: &ProgressWriter,
) -> ProvisionResult<Vec<ContainerRecord>> {
    if count == 0 {
        return Err(ProvisionError::Validation("Cannot add 0 units".to_string()));
    }
    let image = image::app_image(&deps.config, &app.name);
    let plural = if count == 1 { "" } else { "s" };
    writer.raw(format!("\n---- Starting {count} new unit{plural} ----"));

    let mut tasks = JoinSet::new();
    for _ in 0..count {
        let deps = deps.clone();
        let app = app.clone();
        let image = image.clone();
        let hosts = destination_hosts.clone();
        let writer = writer.clone();
        tasks.spawn(async move { start_unit(deps, app, image, hosts, writer).await });
    }

    let mut created = Vec::with_capacity(count);
    let mut first_error: Option<ProvisionError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(record)) => {
                writer.raw(format!(
                    " ---> Started unit {}/{count}...",
                    created.len() + 1
                ));
                created.push(record);
            }
            Ok(Err(err)) => {
                if first_error.is_some() {
                    error!(error = %err, "additional unit start failure");
                } else {
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                error!(error = %join_err, "unit start task failed");
                if first_error.is_none() {
                    first_error = Some(ProvisionError::Internal(join_err.to_string()));
                }
            }
        }
    }

    if let Some(err) = first_error {
        for record in &created {
            error!(
                container = %record.id,
                error = %err,
                "removing container after failed unit add"
            );
            remove_container(deps, record).await;
        }
        return Err(err);
    }
    Ok(created)
}

// ── Change-units pipelines ─────────────────────────────────────────

/// New units plus their routes; used by first deploys and scale-up.
pub async fn run_create_units(
    deps: &Deps,
    app: &AppSpec,
    count: usize,
    destination_hosts: Vec<String>,
    writer: &ProgressWriter,
) -> ProvisionResult<Vec<ContainerRecord>> {
    let mut ctx = ChangeUnitsCtx {
        app: app.clone(),
        units_to_add: count,
        to_remove: Vec::new(),
        destination_hosts,
        writer: writer.clone(),
        added: Vec::new(),
    };
    let actions: Vec<Box<dyn quaygrid_pipeline::Action<ChangeUnitsCtx, ProvisionError>>> = vec![
        Box::new(ProvisionAddUnits { deps: deps.clone() }),
        Box::new(AddNewRoutes { deps: deps.clone() }),
    ];
    Pipeline::new(actions).execute(&mut ctx).await?;
    Ok(ctx.added)
}

/// Replace a set of units with fresh ones: the replacements are routed
/// before the outgoing units lose their routes, so the app never has zero
/// routes.
pub async fn run_replace_units(
    deps: &Deps,
    app: &AppSpec,
    to_remove: Vec<ContainerRecord>,
    destination_hosts: Vec<String>,
    writer: &ProgressWriter,
) -> ProvisionResult<Vec<ContainerRecord>> {
    let mut ctx = ChangeUnitsCtx {
        app: app.clone(),
        units_to_add: to_remove.len(),
        to_remove,
        destination_hosts,
        writer: writer.clone(),
        added: Vec::new(),
    };
    let actions: Vec<Box<dyn quaygrid_pipeline::Action<ChangeUnitsCtx, ProvisionError>>> = vec![
        Box::new(ProvisionAddUnits { deps: deps.clone() }),
        Box::new(AddNewRoutes { deps: deps.clone() }),
        Box::new(RemoveOldRoutes { deps: deps.clone() }),
        Box::new(RemoveOldUnits { deps: deps.clone() }),
    ];
    Pipeline::new(actions).execute(&mut ctx).await?;
    Ok(ctx.added)
}

// ── Per-app fan-outs ───────────────────────────────────────────────

/// Scale up by `count` units. Only valid after the first deploy.
pub async fn add_units(
    deps: &Deps,
    app: &AppSpec,
    count: usize,
    writer: &ProgressWriter,
) -> ProvisionResult<Vec<ContainerRecord>> {
    if count == 0 {
        return Err(ProvisionError::Validation("Cannot add 0 units".to_string()));
    }
    if deps.store.count_by_app(&app.name)? == 0 {
        return Err(ProvisionError::Validation(
            "New units can only be added after the first deployment".to_string(),
        ));
    }
    run_create_units(deps, app, count, Vec::new(), writer).await
}

/// Scale down by `count` units, picking victims in removable-first order.
/// Removing every unit of an app is forbidden.
pub async fn remove_units(deps: &Deps, app: &AppSpec, count: usize) -> ProvisionResult<()> {
    if count == 0 {
        return Err(ProvisionError::Validation(
            "remove units: units must be at least 1".to_string(),
        ));
    }
    let containers = deps.store.list_by_app_ordered_by_status(&app.name)?;
    if count >= containers.len() {
        return Err(ProvisionError::Validation(
            "remove units: cannot remove all units from app".to_string(),
        ));
    }
    let mut tasks = JoinSet::new();
    for record in containers.into_iter().take(count) {
        let deps = deps.clone();
        tasks.spawn(async move { remove_container(&deps, &record).await });
    }
    while let Some(joined) = tasks.join_next().await {
        log_failure("unit removal task", joined);
    }
    Ok(())
}

/// Start every container of the app, refreshing drifted network info.
pub async fn start_app(deps: &Deps, app: &AppSpec) -> ProvisionResult<()> {
    let containers = deps.store.list_by_app(&app.name)?;
    let mut tasks = JoinSet::new();
    for record in containers {
        let deps = deps.clone();
        tasks.spawn(async move {
            deps.cluster.start_container(&record.id).await?;
            let mut record = deps.store.set_status(&record.id, Status::Started)?;
            if let Ok(info) = netinfo::network_info(&deps, &record.id).await {
                if netinfo::drifted(&record, &info) {
                    record.ip = info.ip;
                    record.host_port = info.http_host_port;
                    record.ssh_host_port = info.ssh_host_port;
                    deps.store.update_container(&record)?;
                }
            }
            Ok::<(), ProvisionError>(())
        });
    }
    join_first_error(&mut tasks, "start task").await
}

/// Stop every container of the app.
pub async fn stop_app(deps: &Deps, app: &AppSpec) -> ProvisionResult<()> {
    let containers = match deps.store.list_by_app(&app.name) {
        Ok(containers) => containers,
        Err(err) => {
            error!(error = %err, "listing app containers for stop");
            return Ok(());
        }
    };
    let mut tasks = JoinSet::new();
    for record in containers {
        let deps = deps.clone();
        tasks.spawn(async move { stop_container(&deps, &record).await });
    }
    join_first_error(&mut tasks, "stop task").await
}

/// Tear an app down: remove every container in parallel, then its image
/// and router backend. Failures past the initial listing are logged and
/// the teardown proceeds.
pub async fn destroy_app(deps: &Deps, app: &AppSpec) -> ProvisionResult<()> {
    let containers = deps.store.list_by_app(&app.name)?;
    let mut tasks = JoinSet::new();
    for record in containers {
        let deps = deps.clone();
        tasks.spawn(async move { remove_container(&deps, &record).await });
    }
    while let Some(joined) = tasks.join_next().await {
        log_failure("destroy task", joined);
    }

    log_failure(
        "removing app image",
        deps.cluster
            .remove_image(&image::app_image(&deps.config, &app.name))
            .await,
    );
    match deps.router.remove_backend(&app.name).await {
        Ok(()) => {}
        Err(err) => warn!(app = %app.name, error = %err, "removing router backend"),
    }
    Ok(())
}

/// Join all tasks; the first error wins, the rest are logged.
async fn join_first_error(
    tasks: &mut JoinSet<ProvisionResult<()>>,
    context: &str,
) -> ProvisionResult<()> {
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_some() {
                    error!(error = %err, "additional {context} failure");
                } else {
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                error!(error = %join_err, "{context} panicked");
                if first_error.is_none() {
                    first_error = Some(ProvisionError::Internal(join_err.to_string()));
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

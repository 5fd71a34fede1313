//! Container moves and fleet rebalancing.
//!
//! A move never leaves the app without routes: the replacement unit is
//! created and routed before the victim's route is withdrawn and the
//! victim removed. Rebalance honors cancellation between moves, never in
//! the middle of one.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use quay_core::ProgressWriter;
use quaygrid_state::ContainerRecord;

use crate::error::{ProvisionError, ProvisionResult};
use crate::lifecycle;
use crate::provisioner::Deps;

/// Move one container to an explicit destination host.
pub async fn move_container(
    deps: &Deps,
    container_id: &str,
    to_host: &str,
    writer: &ProgressWriter,
) -> ProvisionResult<()> {
    let record = deps.store.container_by_id(container_id)?;
    let app = app_spec_for(&record);
    writer.message(format!("Moving unit {container_id}..."));
    lifecycle::run_replace_units(
        deps,
        &app,
        vec![record],
        vec![to_host.to_string()],
        writer,
    )
    .await?;
    writer.message(format!("Finished moving unit {container_id}."));
    Ok(())
}

/// Move every container off `from_host`, streaming progress.
pub async fn move_containers(
    deps: &Deps,
    from_host: &str,
    to_host: &str,
    writer: &ProgressWriter,
) -> ProvisionResult<()> {
    if from_host.is_empty() || to_host.is_empty() {
        return Err(ProvisionError::Validation(format!(
            "Invalid params: from: {from_host} - to: {to_host}"
        )));
    }
    let containers = deps.store.list_by_host(from_host)?;
    if containers.is_empty() {
        writer.message(format!("No units to move in {from_host}."));
        writer.message("Containers moved successfully!");
        return Ok(());
    }
    writer.message(format!(
        "Moving {} units from {from_host}...",
        containers.len()
    ));
    for record in containers {
        move_container(deps, &record.id, to_host, writer).await?;
    }
    writer.message("Containers moved successfully!");
    Ok(())
}

/// Redistribute each app's units so no host carries more than
/// `ceil(total / hosts)` of them. With `dry` set, only reports what would
/// move.
pub async fn rebalance(
    deps: &Deps,
    dry: bool,
    writer: &ProgressWriter,
    cancel: &CancellationToken,
) -> ProvisionResult<()> {
    let hosts: Vec<String> = deps
        .cluster
        .nodes()
        .await?
        .iter()
        .map(|n| n.host())
        .collect();

    let mut by_app: BTreeMap<String, Vec<ContainerRecord>> = BTreeMap::new();
    for record in deps.store.list_all()? {
        by_app.entry(record.app_name.clone()).or_default().push(record);
    }

    for (app_name, containers) in by_app {
        let total = containers.len();
        writer.message(format!("Rebalancing app \"{app_name}\" ({total} units)..."));
        if hosts.is_empty() {
            writer.message(format!("Rebalance finished for \"{app_name}\""));
            continue;
        }
        let cap = total.div_ceil(hosts.len());

        let mut by_host: BTreeMap<String, Vec<ContainerRecord>> = BTreeMap::new();
        for record in containers {
            by_host
                .entry(record.host_addr.clone())
                .or_default()
                .push(record);
        }

        for (host, mut units) in by_host {
            if units.len() <= cap {
                continue;
            }
            let excess = units.len() - cap;
            writer.message(format!(
                "Trying to move {excess} units for \"{app_name}\" from {host}..."
            ));
            // Oldest units move first.
            units.sort_by(|a, b| a.last_status_update.cmp(&b.last_status_update));

            let destinations: Vec<String> =
                hosts.iter().filter(|h| **h != host).cloned().collect();
            for victim in units.into_iter().take(excess) {
                if cancel.is_cancelled() {
                    info!("rebalance cancelled between moves");
                    writer.message("Rebalance cancelled.");
                    return Ok(());
                }
                if dry {
                    writer.message(format!("Would move unit {}...", victim.id));
                    continue;
                }
                writer.message(format!("Moving unit {}...", victim.id));
                let app = app_spec_for(&victim);
                let victim_id = victim.id.clone();
                match lifecycle::run_replace_units(
                    deps,
                    &app,
                    vec![victim],
                    destinations.clone(),
                    writer,
                )
                .await
                {
                    Ok(_) => writer.message(format!("Finished moving unit {victim_id}.")),
                    Err(err) => {
                        error!(container = %victim_id, error = %err, "rebalance move failed");
                        writer.message(format!("Error moving unit {victim_id}: {err}"));
                    }
                }
            }
        }
        writer.message(format!("Rebalance finished for \"{app_name}\""));
    }
    writer.message("Containers rebalanced successfully!");
    Ok(())
}

/// Reconstruct the minimal app view a move needs from a record. Placement
/// and image naming only require the name and platform.
fn app_spec_for(record: &ContainerRecord) -> quay_core::AppSpec {
    quay_core::AppSpec::new(&record.app_name, &record.kind, 1)
}

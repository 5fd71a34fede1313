//! Repair records that drifted from actual host state.

use tracing::{info, warn};

use crate::error::ProvisionResult;
use crate::netinfo;
use crate::provisioner::{log_failure, Deps};

/// Walk every record, compare it with what the host engine reports, and
/// rewrite drifted addressing. Repaired records get their route re-added;
/// the router treats a duplicate add as a no-op.
pub async fn fix_containers(deps: &Deps) -> ProvisionResult<()> {
    for mut record in deps.store.list_all()? {
        if record.id.is_empty() {
            continue;
        }
        let info = match netinfo::network_info(deps, &record.id).await {
            Ok(info) => info,
            Err(err) => {
                warn!(container = %record.id, error = %err, "skipping unfixable container");
                continue;
            }
        };
        if !netinfo::drifted(&record, &info) {
            continue;
        }

        info!(
            container = %record.id,
            ip = %info.ip,
            host_port = %info.http_host_port,
            "fixing drifted container record"
        );
        record.ip = info.ip;
        record.host_port = info.http_host_port;
        record.ssh_host_port = info.ssh_host_port;
        deps.store.update_container(&record)?;
        log_failure(
            "restoring route for fixed container",
            deps.router
                .add_route(&record.app_name, &record.address())
                .await,
        );
    }
    Ok(())
}

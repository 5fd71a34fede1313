//! Network details reported by the host engine for a container.

use quaygrid_state::ContainerRecord;

use crate::error::{ProvisionError, ProvisionResult};
use crate::provisioner::Deps;

/// Published addressing of a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ip: String,
    pub http_host_port: String,
    pub ssh_host_port: String,
}

/// Inspect a container and extract its in-container IP and published
/// application/shell ports. Fails when the application port is not mapped
/// to any host port.
pub async fn network_info(deps: &Deps, container_id: &str) -> ProvisionResult<NetworkInfo> {
    let app_port = deps.config.run_cmd.port.clone();
    let inspect = deps.cluster.inspect_container(container_id).await?;

    let mut info = NetworkInfo::default();
    if let Some(settings) = inspect.network_settings {
        if let Some(ip) = settings.ip_address {
            info.ip = ip;
        }
        if let Some(ports) = settings.ports {
            info.http_host_port = first_host_port(&ports, &format!("{app_port}/tcp"));
            info.ssh_host_port = first_host_port(&ports, "22/tcp");
        }
    }
    if info.http_host_port.is_empty() {
        return Err(ProvisionError::PortNotMapped(app_port));
    }
    Ok(info)
}

fn first_host_port(
    ports: &std::collections::HashMap<
        String,
        Option<Vec<bollard::models::PortBinding>>,
    >,
    key: &str,
) -> String {
    ports
        .get(key)
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| {
            bindings.iter().find(|b| {
                b.host_port.as_deref().unwrap_or("") != ""
                    && b.host_ip.as_deref().unwrap_or("") != ""
            })
        })
        .and_then(|b| b.host_port.clone())
        .unwrap_or_default()
}

/// True when the host-reported addressing differs from the record.
pub fn drifted(record: &ContainerRecord, info: &NetworkInfo) -> bool {
    record.ip != info.ip || record.host_port != info.http_host_port
}

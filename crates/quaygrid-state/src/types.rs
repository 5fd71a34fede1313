//! Domain types persisted by the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle status of a container unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Building,
    Created,
    Started,
    Stopped,
    Unreachable,
    Down,
    Error,
}

impl Status {
    /// Scale-down victim ordering: removable states first, then unreachable,
    /// then stopped, created, started.
    pub fn removal_rank(self) -> u8 {
        match self {
            Status::Building | Status::Down | Status::Error => 0,
            Status::Unreachable => 1,
            Status::Stopped => 2,
            Status::Created => 3,
            Status::Started => 4,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Building => "building",
            Status::Created => "created",
            Status::Started => "started",
            Status::Stopped => "stopped",
            Status::Unreachable => "unreachable",
            Status::Down => "down",
            Status::Error => "error",
        };
        f.write_str(name)
    }
}

/// One persisted row per running unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Engine-assigned container ID; empty until the container exists.
    pub id: String,
    /// Client-chosen 20-hex-char token, unique while the record exists.
    pub name: String,
    pub app_name: String,
    /// Platform family of the owning app.
    pub kind: String,
    /// In-container address.
    pub ip: String,
    /// Host IP of the node running this container.
    pub host_addr: String,
    /// Published application port on the host.
    pub host_port: String,
    /// Published shell port on the host.
    pub ssh_host_port: String,
    /// Last committed image reference.
    pub image: String,
    /// User the shell transport authenticates as.
    pub user: String,
    /// PEM private key, used only by the shell transport.
    pub private_key: String,
    pub version: String,
    pub status: Status,
    pub last_status_update: DateTime<Utc>,
}

impl ContainerRecord {
    /// A fresh record in `building` state with a generated name.
    pub fn building(app_name: &str, kind: &str) -> Self {
        ContainerRecord {
            id: String::new(),
            name: record_name(),
            app_name: app_name.to_string(),
            kind: kind.to_string(),
            ip: String::new(),
            host_addr: String::new(),
            host_port: String::new(),
            ssh_host_port: String::new(),
            image: String::new(),
            user: String::new(),
            private_key: String::new(),
            version: String::new(),
            status: Status::Building,
            last_status_update: Utc::now(),
        }
    }

    /// Routable address of the published application port.
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.host_addr, self.host_port)
    }

    /// True when the unit can serve traffic.
    pub fn available(&self) -> bool {
        matches!(self.status, Status::Started | Status::Unreachable)
    }
}

/// Generate a container record name: 20 hex chars hashed from a
/// high-resolution timestamp.
pub fn record_name() -> String {
    let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
    let digest = Sha256::digest(now.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..20].to_string()
}

/// A scheduling pool: hosts declare membership via node metadata, teams are
/// entitled to one or more pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    #[serde(default)]
    pub teams: Vec<String>,
}

/// A machine created through the machine provider to host a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub iaas: String,
    pub status: String,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_format() {
        let record = ContainerRecord {
            host_addr: "10.10.10.10".to_string(),
            host_port: "49153".to_string(),
            ..ContainerRecord::building("myapp", "python")
        };
        assert_eq!(record.address(), "http://10.10.10.10:49153");
    }

    #[test]
    fn available_by_status() {
        let cases = [
            (Status::Started, true),
            (Status::Unreachable, true),
            (Status::Down, false),
            (Status::Stopped, false),
            (Status::Building, false),
        ];
        for (status, expected) in cases {
            let record = ContainerRecord {
                status,
                ..ContainerRecord::building("app", "python")
            };
            assert_eq!(record.available(), expected, "status {status}");
        }
    }

    #[test]
    fn record_names_are_20_hex_chars_and_unique() {
        let a = record_name();
        let b = record_name();
        assert_eq!(a.len(), 20);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn removal_rank_orders_removable_first() {
        assert!(Status::Building.removal_rank() < Status::Unreachable.removal_rank());
        assert!(Status::Down.removal_rank() < Status::Stopped.removal_rank());
        assert!(Status::Error.removal_rank() < Status::Started.removal_rank());
        assert!(Status::Stopped.removal_rank() < Status::Started.removal_rank());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Status::Unreachable).unwrap(),
            "\"unreachable\""
        );
        assert_eq!(Status::Building.to_string(), "building");
    }
}

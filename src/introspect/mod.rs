//! Live process and container state.
//!
//! Reconciliation needs to know which allocated ports and addresses are still
//! backed by something running. The allocation core only ever sees the typed
//! [`LiveSnapshot`]; how it is gathered is up to a [`LiveStateSource`]. The
//! production source, [`SystemInspector`], lives in `system.rs` and is the
//! only place that parses tool output.
//!
//! Subnet derivation also needs the host's primary IPv4 address, which comes
//! from a [`HostAddressSource`].

pub mod system;

pub use system::SystemInspector;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{AllocError, Result};
use crate::storage;
use crate::types::{ChainId, Subnet};

/// A node process running directly on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveProcess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

/// A container attached to a container-managed network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveContainer {
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Subnet>,
    pub container_name: String,
    /// Chain the container's network belongs to, when its name encodes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,
}

/// Everything observed running at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSnapshot {
    #[serde(default)]
    pub processes: Vec<LiveProcess>,
    #[serde(default)]
    pub containers: Vec<LiveContainer>,
}

impl LiveSnapshot {
    /// Ports held by live node processes
    pub fn active_ports(&self) -> BTreeSet<u16> {
        self.processes.iter().map(|p| p.port).collect()
    }

    /// Addresses bound to live containers
    pub fn active_ips(&self) -> BTreeSet<Ipv4Addr> {
        self.containers.iter().map(|c| c.ip).collect()
    }

    /// Load a captured snapshot from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        storage::read_json(path)?.ok_or_else(|| {
            AllocError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "snapshot file not found"),
            )
        })
    }
}

/// Collaborator that reports what is currently running
pub trait LiveStateSource {
    fn snapshot(&self) -> Result<LiveSnapshot>;
}

/// A fixed snapshot is its own source; used for captured state and tests.
impl LiveStateSource for LiveSnapshot {
    fn snapshot(&self) -> Result<LiveSnapshot> {
        Ok(self.clone())
    }
}

/// Collaborator that reports the host's primary IPv4 address
pub trait HostAddressSource {
    fn primary_ipv4(&self) -> Result<Ipv4Addr>;
}

/// A configured address overrides detection.
impl HostAddressSource for Ipv4Addr {
    fn primary_ipv4(&self) -> Result<Ipv4Addr> {
        Ok(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_sets() {
        let snapshot = LiveSnapshot {
            processes: vec![
                LiveProcess { chain_id: Some(ChainId(10)), port: 30403, data_dir: None },
                LiveProcess { chain_id: None, port: 30404, data_dir: None },
            ],
            containers: vec![LiveContainer {
                ip: Ipv4Addr::new(10, 0, 0, 2),
                subnet: None,
                container_name: "eth10-signer".to_string(),
                chain_id: Some(ChainId(10)),
            }],
        };

        assert_eq!(snapshot.active_ports().into_iter().collect::<Vec<_>>(), vec![30403, 30404]);
        assert!(snapshot.active_ips().contains(&Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_snapshot_json_is_minimal() {
        let raw = r#"{"processes": [{"port": 30403}], "containers": [{"ip": "10.0.0.1", "containerName": "c1"}]}"#;
        let snapshot: LiveSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.processes[0].port, 30403);
        assert_eq!(snapshot.containers[0].container_name, "c1");
        assert_eq!(snapshot.snapshot().unwrap(), snapshot);
    }
}

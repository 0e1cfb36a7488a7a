//! Permanent per-chain RPC ports (`networks/rpcPorts.json`).
//!
//! A chain gets exactly one RPC port, the lowest unused port at or above the
//! configured base, and keeps it forever; reconciliation never releases it so
//! a chain's RPC URL stays stable across node restarts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::AllocatorConfig;
use crate::error::{AllocError, ResourceKind, Result};
use crate::storage::{self, StateLayout};
use crate::types::ChainId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcPorts {
    pub rpc_ports: BTreeMap<ChainId, u16>,
}

impl RpcPorts {
    /// Existing port for the chain, or the lowest free one from `base` upward
    fn assign(&mut self, chain_id: ChainId, base: u16) -> Result<(u16, bool)> {
        if let Some(port) = self.rpc_ports.get(&chain_id) {
            return Ok((*port, false));
        }

        let used: BTreeSet<u16> = self.rpc_ports.values().copied().collect();
        let port = (base..=u16::MAX)
            .find(|port| !used.contains(port))
            .ok_or(AllocError::PoolExhausted {
                resource: ResourceKind::RpcPort,
                chain_id,
            })?;
        self.rpc_ports.insert(chain_id, port);
        Ok((port, true))
    }
}

#[derive(Debug, Clone)]
pub struct RpcPortAllocator {
    path: PathBuf,
    base_port: u16,
    lock_timeout: Duration,
}

impl RpcPortAllocator {
    pub fn new(layout: &StateLayout, config: &AllocatorConfig) -> Self {
        RpcPortAllocator {
            path: layout.rpc_ports_file(),
            base_port: config.rpc.base_port,
            lock_timeout: config.lock_timeout,
        }
    }

    /// The chain's RPC port, assigning one on first use
    pub fn allocate(&self, chain_id: ChainId) -> Result<u16> {
        let (port, fresh) = storage::update_json(
            &self.path,
            self.lock_timeout,
            || Ok(RpcPorts::default()),
            |ports| ports.assign(chain_id, self.base_port),
        )?;
        if fresh {
            log::info!("Assigned RPC port {} to chain {}", port, chain_id);
        }
        Ok(port)
    }

    /// The chain's RPC port, if one was ever assigned
    pub fn lookup(&self, chain_id: ChainId) -> Result<Option<u16>> {
        let ports: Option<RpcPorts> = storage::read_json(&self.path)?;
        Ok(ports.and_then(|p| p.rpc_ports.get(&chain_id).copied()))
    }
}

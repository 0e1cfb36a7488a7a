//! # Network Registry
//!
//! The registry ties the three allocators to the per-chain node lists. It is
//! the entry point for deployment collaborators:
//!
//! - [`NetworkRegistry::add_node`] grants a node its P2P port, container
//!   address and the chain's RPC port, and records it in
//!   `networks/<chainId>/network-config.json`.
//! - [`NetworkRegistry::load_network_config`] reads a chain's assignments back.
//! - [`NetworkRegistry::collect_and_cleanup_network_configs`] drops node
//!   records that nothing running backs any more and reports what they held.
//! - [`NetworkRegistry::update_global_allocations`] does the same and returns
//!   the freed ports and addresses to their pools.
//!
//! ## Node lifecycle
//!
//! A node record is created by `add_node` and removed only by reconciliation,
//! once neither its port is held by a live node process nor its address is
//! bound to a live container. The record's port and address move to the
//! chain's `pendingRelease` list in the same write, and stay there until they
//! are back in their pools, so a failed release is retried by the next pass.
//! RPC ports are never reclaimed.
//!
//! ## Failure handling
//!
//! If the live-state source fails, reconciliation reclaims nothing and returns
//! the error. The implicit reclaim pass that runs before an allocation only
//! logs such a failure and lets the allocation proceed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::AllocatorConfig;
use crate::error::{AllocError, Result};
use crate::introspect::{HostAddressSource, LiveSnapshot, LiveStateSource, SystemInspector};
use crate::pool::{AddressPoolAllocator, PortPoolAllocator, RpcPortAllocator};
use crate::storage::{self, StateLayout};
use crate::types::{ChainId, ChainNetworkConfig, NodeAllocation, NodeRecord, NodeRole, PartialGrant};

pub use crate::types::ReclaimableResources;

/// Reconciliation result for every persisted chain
pub type ReclaimReport = BTreeMap<ChainId, ReclaimableResources>;

/// Orchestrates the port, address and RPC port allocators per chain
pub struct NetworkRegistry {
    layout: StateLayout,
    lock_timeout: Duration,
    reconcile_before_allocate: bool,
    ports: PortPoolAllocator,
    addresses: AddressPoolAllocator,
    rpc_ports: RpcPortAllocator,
    live: Box<dyn LiveStateSource + Send + Sync>,
}

impl fmt::Debug for NetworkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkRegistry")
            .field("layout", &self.layout)
            .field("ports", &self.ports)
            .field("addresses", &self.addresses)
            .field("rpc_ports", &self.rpc_ports)
            .finish_non_exhaustive()
    }
}

impl NetworkRegistry {
    /// Build a registry over `config.state_dir` with explicit collaborators
    pub fn new(
        config: &AllocatorConfig,
        host: Box<dyn HostAddressSource + Send + Sync>,
        live: Box<dyn LiveStateSource + Send + Sync>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = StateLayout::new(&config.state_dir);

        Ok(NetworkRegistry {
            ports: PortPoolAllocator::new(&layout, config),
            addresses: AddressPoolAllocator::new(&layout, config, host),
            rpc_ports: RpcPortAllocator::new(&layout, config),
            lock_timeout: config.lock_timeout,
            reconcile_before_allocate: config.reconcile_before_allocate,
            live,
            layout,
        })
    }

    /// Registry that inspects the local system for live state and, unless the
    /// config pins one, the host address
    pub fn with_system(config: &AllocatorConfig) -> Result<Self> {
        let host: Box<dyn HostAddressSource + Send + Sync> = match config.host_address {
            Some(address) => Box::new(address),
            None => Box::new(SystemInspector::new()),
        };
        Self::new(config, host, Box::new(SystemInspector::new()))
    }

    /// Same registry, reconciling against a fixed snapshot instead
    pub fn with_snapshot(mut self, snapshot: LiveSnapshot) -> Self {
        self.live = Box::new(snapshot);
        self
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn ports(&self) -> &PortPoolAllocator {
        &self.ports
    }

    pub fn addresses(&self) -> &AddressPoolAllocator {
        &self.addresses
    }

    pub fn rpc_ports(&self) -> &RpcPortAllocator {
        &self.rpc_ports
    }

    /// Allocate a port, an address and the chain's RPC port for a new node.
    ///
    /// All three allocators are tried even if one fails. The node is recorded
    /// whenever it got both a port and an address; otherwise a lone port or
    /// address goes straight back to its pool. On any failure the call returns
    /// `AllocError::PartialAllocation` carrying what the caller still holds.
    pub fn add_node(
        &self,
        chain_id: ChainId,
        role: NodeRole,
        address: impl Into<String>,
    ) -> Result<NodeAllocation> {
        let address = address.into();

        if self.reconcile_before_allocate {
            match self.update_global_allocations() {
                Ok(_) => {}
                Err(e @ AllocError::ExternalToolFailure { .. }) => {
                    log::warn!("Skipping reclaim before allocating for chain {}: {}", chain_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.ensure_network_config(chain_id)?;

        let port = self.ports.allocate(chain_id);
        let ip = self.addresses.allocate(chain_id);
        let rpc_port = self.rpc_ports.allocate(chain_id);

        let mut granted = PartialGrant {
            ip: ip.as_ref().ok().copied(),
            port: port.as_ref().ok().copied(),
            rpc_port: rpc_port.as_ref().ok().copied(),
        };

        match (granted.port, granted.ip) {
            (Some(port), Some(ip)) => {
                let record = NodeRecord {
                    address: address.clone(),
                    role,
                    port,
                    rpc_port: granted.rpc_port,
                    ip,
                };
                let recorded = self.update_network_config(chain_id, |config| {
                    config.nodes.push(record);
                    Ok(())
                });
                if let Err(e) = recorded {
                    self.return_unrecorded(chain_id, Some(port), Some(ip));
                    return Err(e);
                }
            }
            // No record would ever point at a lone port or address
            (lone_port, lone_ip) => {
                self.return_unrecorded(chain_id, lone_port, lone_ip);
                granted.port = None;
                granted.ip = None;
            }
        }

        let source = match (port, ip, rpc_port) {
            (Ok(port), Ok(ip), Ok(rpc_port)) => {
                log::info!(
                    "Added {} node {} to chain {}: ip {}, port {}, rpc port {}",
                    role,
                    address,
                    chain_id,
                    ip,
                    port,
                    rpc_port
                );
                return Ok(NodeAllocation { ip, port, rpc_port });
            }
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => e,
        };

        log::error!(
            "Failed to allocate resources for {} node {} in chain {}: {}",
            role,
            address,
            chain_id,
            source
        );
        Err(AllocError::PartialAllocation {
            chain_id,
            granted,
            source: Box::new(source),
        })
    }

    fn return_unrecorded(&self, chain_id: ChainId, port: Option<u16>, ip: Option<Ipv4Addr>) {
        if let Some(port) = port {
            if let Err(e) = self.ports.release(chain_id, &[port]) {
                log::warn!("Port {} of chain {} is leaked: {}", port, chain_id, e);
            }
        }
        if let Some(ip) = ip {
            if let Err(e) = self.addresses.release(chain_id, &[ip]) {
                log::warn!("IP {} of chain {} is leaked: {}", ip, chain_id, e);
            }
        }
    }

    /// Read a chain's persisted network config
    pub fn load_network_config(&self, chain_id: ChainId) -> Result<ChainNetworkConfig> {
        let path = self.layout.network_config_file(chain_id);
        storage::read_json(&path)?.ok_or(AllocError::ConfigNotFound { chain_id, path })
    }

    /// Reclaim what is no longer running, then read the chain's config
    pub fn load_config(&self, chain_id: ChainId) -> Result<ChainNetworkConfig> {
        self.update_global_allocations()?;
        self.load_network_config(chain_id)
    }

    /// Every persisted chain config, ascending by chain id
    pub fn load_all_network_configs(&self) -> Result<Vec<ChainNetworkConfig>> {
        let mut configs = Vec::new();
        for chain_id in self.layout.chain_ids()? {
            match storage::read_json(&self.layout.network_config_file(chain_id))? {
                Some(config) => configs.push(config),
                None => log::debug!("Chain directory {} has no network config", chain_id),
            }
        }
        Ok(configs)
    }

    /// The chain's RPC port, if one was assigned
    pub fn rpc_port(&self, chain_id: ChainId) -> Result<Option<u16>> {
        self.rpc_ports.lookup(chain_id)
    }

    /// Drop node records with no live process or container behind them.
    ///
    /// A record stays if its port is held by a live node process or its
    /// address is bound to a live container. Dropped values are reported and
    /// queued in the chain's pending release list. Each chain's file is
    /// rewritten under its lock; unchanged files are left alone.
    pub fn collect_and_cleanup_network_configs(&self) -> Result<ReclaimReport> {
        let snapshot = self.live.snapshot()?;
        let active_ports = snapshot.active_ports();
        let active_ips = snapshot.active_ips();

        let mut report = ReclaimReport::new();
        for chain_id in self.layout.chain_ids()? {
            match self.cleanup_chain(chain_id, &active_ports, &active_ips) {
                Ok(reclaimed) => {
                    report.insert(chain_id, reclaimed);
                }
                Err(AllocError::ConfigNotFound { .. }) => {
                    log::debug!("Chain directory {} has no network config", chain_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    fn cleanup_chain(
        &self,
        chain_id: ChainId,
        active_ports: &BTreeSet<u16>,
        active_ips: &BTreeSet<Ipv4Addr>,
    ) -> Result<ReclaimableResources> {
        self.update_network_config(chain_id, |config| {
            let (active, orphaned): (Vec<NodeRecord>, Vec<NodeRecord>) = config
                .nodes
                .drain(..)
                .partition(|node| active_ports.contains(&node.port) || active_ips.contains(&node.ip));

            if !orphaned.is_empty() {
                log::info!(
                    "Chain {}: keeping {} nodes, reclaiming {}",
                    chain_id,
                    active.len(),
                    orphaned.len()
                );
            }
            config.nodes = active;

            let reclaimed = ReclaimableResources {
                available_ports: orphaned.iter().map(|node| node.port).collect(),
                available_ips: orphaned.iter().map(|node| node.ip).collect(),
            };
            config.pending_release.merge(&reclaimed);
            Ok(reclaimed)
        })
    }

    /// Reconcile, then return every pending port and address to its pool.
    ///
    /// The report lists what reached the pools in this pass. A chain whose
    /// release fails keeps the unreleased values pending; the remaining chains
    /// are still processed and the first failure is returned.
    pub fn update_global_allocations(&self) -> Result<ReclaimReport> {
        self.collect_and_cleanup_network_configs()?;

        let mut report = ReclaimReport::new();
        let mut first_error = None;
        for chain_id in self.layout.chain_ids()? {
            match self.release_pending(chain_id) {
                Ok(released) => {
                    report.insert(chain_id, released);
                }
                Err(AllocError::ConfigNotFound { .. }) => {}
                Err(e) => {
                    log::error!("Chain {}: reclaimed resources stay pending: {}", chain_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Release the chain's pending values while holding its config lock.
    ///
    /// Ports and addresses are released independently; whichever succeeds is
    /// cleared from the pending list even if the other fails.
    fn release_pending(&self, chain_id: ChainId) -> Result<ReclaimableResources> {
        let (released, failure) = self.update_network_config(chain_id, |config| {
            let pending = &mut config.pending_release;
            let mut released = ReclaimableResources::default();
            let mut failure = None;

            if !pending.available_ports.is_empty() {
                match self.ports.release(chain_id, &pending.available_ports) {
                    Ok(_) => released.available_ports = std::mem::take(&mut pending.available_ports),
                    Err(e) => failure = Some(e),
                }
            }
            if !pending.available_ips.is_empty() {
                match self.addresses.release(chain_id, &pending.available_ips) {
                    Ok(_) => released.available_ips = std::mem::take(&mut pending.available_ips),
                    Err(e) => {
                        if let Some(earlier) = &failure {
                            log::warn!("Chain {}: port release also failed: {}", chain_id, earlier);
                        }
                        failure = Some(e);
                    }
                }
            }
            Ok((released, failure))
        })?;

        match failure {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// Delete all persisted pools and chain configs
    pub fn reset(&self) -> Result<()> {
        self.layout.reset()
    }

    /// Create the chain's config with its bucket subnet if it does not exist
    fn ensure_network_config(&self, chain_id: ChainId) -> Result<()> {
        storage::update_json(
            &self.layout.network_config_file(chain_id),
            self.lock_timeout,
            || {
                let subnet = self.addresses.assign_subnet(chain_id)?;
                log::info!("Created network config for chain {} with subnet {}", chain_id, subnet);
                Ok(ChainNetworkConfig::new(chain_id, subnet))
            },
            |_| Ok(()),
        )
    }

    fn update_network_config<R>(
        &self,
        chain_id: ChainId,
        update: impl FnOnce(&mut ChainNetworkConfig) -> Result<R>,
    ) -> Result<R> {
        let path = self.layout.network_config_file(chain_id);
        storage::update_json(
            &path,
            self.lock_timeout,
            || Err(AllocError::ConfigNotFound { chain_id, path: path.clone() }),
            update,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceKind;
    use crate::introspect::{LiveContainer, LiveProcess};
    use crate::pool::PoolState;
    use crate::storage::StateLock;
    use tempfile::TempDir;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 9, 9);

    fn registry(dir: &TempDir, snapshot: LiveSnapshot) -> NetworkRegistry {
        let mut config = AllocatorConfig::with_state_dir(dir.path());
        config.reconcile_before_allocate = false;
        NetworkRegistry::new(&config, Box::new(HOST), Box::new(snapshot)).unwrap()
    }

    struct BrokenInspector;

    impl LiveStateSource for BrokenInspector {
        fn snapshot(&self) -> Result<LiveSnapshot> {
            Err(AllocError::tool("docker", "daemon not running"))
        }
    }

    #[test]
    fn test_add_node_records_allocation() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, LiveSnapshot::default());

        let allocation = registry.add_node(ChainId(10), NodeRole::Bootstrap, "0xaaa").unwrap();
        assert_eq!(
            allocation,
            NodeAllocation { ip: Ipv4Addr::new(10, 0, 0, 1), port: 30403, rpc_port: 8575 }
        );

        let config = registry.load_network_config(ChainId(10)).unwrap();
        assert_eq!(config.subnet.to_string(), "10.0.0.0/24");
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].address, "0xaaa");
        assert_eq!(config.nodes[0].rpc_port, Some(8575));
    }

    #[test]
    fn test_rpc_port_shared_within_chain() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, LiveSnapshot::default());

        let first = registry.add_node(ChainId(10), NodeRole::Bootstrap, "a").unwrap();
        let second = registry.add_node(ChainId(10), NodeRole::Signer, "b").unwrap();
        assert_eq!(first.rpc_port, second.rpc_port);
        assert_eq!(second.port, 30404);
        assert_eq!(registry.rpc_port(ChainId(10)).unwrap(), Some(8575));
    }

    #[test]
    fn test_missing_config_is_not_found() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, LiveSnapshot::default());
        assert!(matches!(
            registry.load_network_config(ChainId(5)),
            Err(AllocError::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn test_node_alive_by_port_or_ip_is_kept() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, LiveSnapshot::default());
        let by_port = registry.add_node(ChainId(10), NodeRole::Bootstrap, "a").unwrap();
        let by_ip = registry.add_node(ChainId(10), NodeRole::Member, "b").unwrap();
        let dead = registry.add_node(ChainId(10), NodeRole::Member, "c").unwrap();

        let snapshot = LiveSnapshot {
            processes: vec![LiveProcess { chain_id: Some(ChainId(10)), port: by_port.port, data_dir: None }],
            containers: vec![LiveContainer {
                ip: by_ip.ip,
                subnet: None,
                container_name: "eth10-member".to_string(),
                chain_id: Some(ChainId(10)),
            }],
        };
        let registry = registry.with_snapshot(snapshot);

        let report = registry.collect_and_cleanup_network_configs().unwrap();
        assert_eq!(report[&ChainId(10)].available_ports, vec![dead.port]);
        assert_eq!(report[&ChainId(10)].available_ips, vec![dead.ip]);

        let addresses: Vec<String> = registry
            .load_network_config(ChainId(10))
            .unwrap()
            .nodes
            .into_iter()
            .map(|n| n.address)
            .collect();
        assert_eq!(addresses, vec!["a", "b"]);
    }

    #[test]
    fn test_failing_live_source_reclaims_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, LiveSnapshot::default());
        registry.add_node(ChainId(10), NodeRole::Bootstrap, "a").unwrap();

        let mut config = AllocatorConfig::with_state_dir(dir.path());
        config.reconcile_before_allocate = true;
        let broken = NetworkRegistry::new(&config, Box::new(HOST), Box::new(BrokenInspector)).unwrap();

        assert!(matches!(
            broken.update_global_allocations(),
            Err(AllocError::ExternalToolFailure { .. })
        ));
        assert_eq!(broken.load_network_config(ChainId(10)).unwrap().nodes.len(), 1);

        // The implicit reclaim pass only warns; allocation still succeeds
        let allocation = broken.add_node(ChainId(10), NodeRole::Member, "b").unwrap();
        assert_eq!(allocation.port, 30404);
        assert_eq!(broken.load_network_config(ChainId(10)).unwrap().nodes.len(), 2);
    }

    #[test]
    fn test_exhausted_pool_reports_partial_grant() {
        let dir = TempDir::new().unwrap();
        let mut config = AllocatorConfig::with_state_dir(dir.path());
        config.reconcile_before_allocate = false;
        config.pools.bucket_count = 1;
        config.pools.bucket_capacity = 1;
        let registry =
            NetworkRegistry::new(&config, Box::new(HOST), Box::new(LiveSnapshot::default())).unwrap();

        registry.add_node(ChainId(1), NodeRole::Bootstrap, "a").unwrap();
        let err = registry.add_node(ChainId(1), NodeRole::Signer, "b").unwrap_err();
        match err {
            AllocError::PartialAllocation { granted, source, .. } => {
                assert_eq!(granted.port, None);
                assert_eq!(granted.ip, None);
                assert_eq!(granted.rpc_port, Some(8575));
                assert!(matches!(*source, AllocError::PoolExhausted { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.load_network_config(ChainId(1)).unwrap().nodes.len(), 1);
    }

    #[test]
    fn test_unrecorded_grant_goes_back_to_pool() {
        let dir = TempDir::new().unwrap();
        let mut config = AllocatorConfig::with_state_dir(dir.path());
        config.reconcile_before_allocate = false;
        config.pools.bucket_count = 1;
        config.pools.bucket_capacity = 1;
        let registry =
            NetworkRegistry::new(&config, Box::new(HOST), Box::new(LiveSnapshot::default())).unwrap();

        // Drain the port bucket so only the address can be granted
        registry.ports().allocate(ChainId(1)).unwrap();

        match registry.add_node(ChainId(1), NodeRole::Member, "a").unwrap_err() {
            AllocError::PartialAllocation { granted, source, .. } => {
                assert_eq!(granted.port, None);
                assert_eq!(granted.ip, None);
                assert_eq!(granted.rpc_port, Some(8575));
                assert!(matches!(
                    *source,
                    AllocError::PoolExhausted { resource: ResourceKind::Port, .. }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.load_network_config(ChainId(1)).unwrap().nodes.is_empty());
        assert_eq!(registry.addresses().allocate(ChainId(1)).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_failed_release_is_retried() {
        let dir = TempDir::new().unwrap();
        let mut config = AllocatorConfig::with_state_dir(dir.path());
        config.reconcile_before_allocate = false;
        config.lock_timeout = Duration::from_millis(50);
        let registry =
            NetworkRegistry::new(&config, Box::new(HOST), Box::new(LiveSnapshot::default())).unwrap();
        let node = registry.add_node(ChainId(10), NodeRole::Bootstrap, "a").unwrap();

        let held = StateLock::acquire(&registry.layout().ports_file(), Duration::from_secs(1)).unwrap();
        assert!(matches!(
            registry.update_global_allocations(),
            Err(AllocError::LockTimeout { .. })
        ));
        drop(held);

        let chain = registry.load_network_config(ChainId(10)).unwrap();
        assert!(chain.nodes.is_empty());
        assert_eq!(chain.pending_release.available_ports, vec![node.port]);
        // The address pool was not locked, so the address already went back
        assert!(chain.pending_release.available_ips.is_empty());

        let report = registry.update_global_allocations().unwrap();
        assert_eq!(report[&ChainId(10)].available_ports, vec![node.port]);
        assert!(report[&ChainId(10)].available_ips.is_empty());
        assert!(registry.load_network_config(ChainId(10)).unwrap().pending_release.is_empty());

        let ports = registry.ports().load().unwrap().unwrap();
        assert_eq!(ports.free_count(), 76);
        assert!(ports.ports.values().any(|free| free.contains(&node.port)));
        let ips = registry.addresses().load().unwrap().unwrap();
        assert!(ips.ips.values().any(|free| free.contains(&node.ip)));
    }

    #[test]
    fn test_reconcile_alone_keeps_values_pending() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, LiveSnapshot::default());
        let node = registry.add_node(ChainId(3), NodeRole::Member, "a").unwrap();

        let report = registry.collect_and_cleanup_network_configs().unwrap();
        assert_eq!(report[&ChainId(3)].available_ports, vec![node.port]);
        let pending = registry.load_network_config(ChainId(3)).unwrap().pending_release;
        assert_eq!(pending.available_ports, vec![node.port]);
        assert_eq!(pending.available_ips, vec![node.ip]);

        // The next refresh hands them to the pools
        let report = registry.update_global_allocations().unwrap();
        assert_eq!(report[&ChainId(3)].available_ips, vec![node.ip]);
        assert!(registry.load_network_config(ChainId(3)).unwrap().pending_release.is_empty());
    }

    #[test]
    fn test_corrupt_chain_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, LiveSnapshot::default());
        let path = registry.layout().network_config_file(ChainId(4));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "nodes: []").unwrap();

        assert!(matches!(
            registry.collect_and_cleanup_network_configs(),
            Err(AllocError::ConfigCorrupt { .. })
        ));
        assert!(matches!(
            registry.add_node(ChainId(4), NodeRole::Member, "x"),
            Err(AllocError::ConfigCorrupt { .. })
        ));
    }
}

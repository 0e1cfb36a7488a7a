//! P2P port pool (`networks/ports.json`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use super::{Buckets, PoolState};
use crate::config::{AllocatorConfig, PoolConfig};
use crate::error::{AllocError, ResourceKind, Result};
use crate::storage::{self, StateLayout};
use crate::types::{BucketId, ChainId};

/// Persisted port pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPool {
    pub ports: Buckets<u16>,
    pub chain_id_mapping: BTreeMap<ChainId, BucketId>,
}

impl PortPool {
    /// Fresh pool: bucket `i` (1-based) holds `base + i * stride + slot` for
    /// each slot in `0..capacity`.
    pub fn initial(config: &PoolConfig) -> Self {
        let mut ports = Buckets::new();
        for index in 1..=config.bucket_count {
            let first = index
                .saturating_mul(u32::from(config.port_stride))
                .saturating_add(u32::from(config.base_port));
            let bucket: VecDeque<u16> = (0..config.bucket_capacity)
                .filter_map(|slot| u16::try_from(first.saturating_add(slot)).ok())
                .collect();
            ports.insert(BucketId(index), bucket);
        }
        PortPool {
            ports,
            chain_id_mapping: BTreeMap::new(),
        }
    }
}

impl PoolState for PortPool {
    type Value = u16;
    const RESOURCE: ResourceKind = ResourceKind::Port;

    fn buckets(&self) -> &Buckets<u16> {
        &self.ports
    }
    fn buckets_mut(&mut self) -> &mut Buckets<u16> {
        &mut self.ports
    }
    fn chain_buckets(&self) -> &BTreeMap<ChainId, BucketId> {
        &self.chain_id_mapping
    }
    fn chain_buckets_mut(&mut self) -> &mut BTreeMap<ChainId, BucketId> {
        &mut self.chain_id_mapping
    }
}

/// Hands out P2P ports from the persisted port pool
#[derive(Debug, Clone)]
pub struct PortPoolAllocator {
    path: PathBuf,
    pools: PoolConfig,
    lock_timeout: Duration,
}

impl PortPoolAllocator {
    pub fn new(layout: &StateLayout, config: &AllocatorConfig) -> Self {
        PortPoolAllocator {
            path: layout.ports_file(),
            pools: config.pools.clone(),
            lock_timeout: config.lock_timeout,
        }
    }

    fn init(&self) -> Result<PortPool> {
        log::info!(
            "Port assignment file {:?} does not exist, creating {} buckets of {} ports",
            self.path,
            self.pools.bucket_count,
            self.pools.bucket_capacity
        );
        Ok(PortPool::initial(&self.pools))
    }

    /// Grant the next free port of the chain's bucket
    pub fn allocate(&self, chain_id: ChainId) -> Result<u16> {
        let result = storage::update_json(&self.path, self.lock_timeout, || self.init(), |pool| {
            pool.take(chain_id, self.pools.sharing)
        });
        match &result {
            Ok(port) => log::info!("Allocated port {} to chain {}", port, chain_id),
            Err(e @ AllocError::PoolExhausted { .. }) => log::error!("{}", e),
            Err(_) => {}
        }
        result
    }

    /// Return reclaimed ports to the chain's bucket
    pub fn release(&self, chain_id: ChainId, ports: &[u16]) -> Result<usize> {
        if ports.is_empty() {
            return Ok(0);
        }
        let inserted = storage::update_json(&self.path, self.lock_timeout, || self.init(), |pool| {
            Ok(pool.give_back(chain_id, ports))
        })?;
        log::info!("Returned {} of {} ports to the pool for chain {}", inserted, ports.len(), chain_id);
        Ok(inserted)
    }

    /// Bucket the chain is bound to, without binding it
    pub fn bucket_for(&self, chain_id: ChainId) -> Result<Option<BucketId>> {
        Ok(self.load()?.and_then(|pool| pool.bucket_of(chain_id)))
    }

    /// Current persisted pool, if it has been initialized
    pub fn load(&self) -> Result<Option<PortPool>> {
        storage::read_json(&self.path)
    }
}

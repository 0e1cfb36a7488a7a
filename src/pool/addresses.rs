//! IPv4 address pool and per-bucket subnets (`networks/ips.json`).
//!
//! Subnets are derived once, when the pool file is first created: the first
//! two octets come from the host's primary address and bucket `i` (0-based)
//! gets third octet `i * capacity`. Bucket addresses are `.1 ..= .capacity`
//! inside that subnet.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use super::{Buckets, PoolState};
use crate::config::{AllocatorConfig, PoolConfig};
use crate::error::{AllocError, ResourceKind, Result};
use crate::introspect::HostAddressSource;
use crate::storage::{self, StateLayout};
use crate::types::{BucketId, ChainId, Subnet};

/// Persisted address pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressPool {
    pub ips: Buckets<Ipv4Addr>,
    pub chain_id_mapping: BTreeMap<ChainId, BucketId>,
    pub subnets: BTreeMap<BucketId, Subnet>,
}

impl AddressPool {
    pub fn initial(config: &PoolConfig, host: Ipv4Addr) -> Self {
        let [a, b, _, _] = host.octets();
        let mut pool = AddressPool::default();

        for index in 0..config.bucket_count {
            let bucket = BucketId(index + 1);
            // Validated configs never wrap; the modulo keeps odd ones inside .0-.253
            let segment = (u64::from(index) * u64::from(config.bucket_capacity) % 254) as u8;
            let hosts: VecDeque<Ipv4Addr> = (1..=config.bucket_capacity)
                .filter_map(|host| u8::try_from(host).ok())
                .map(|host| Ipv4Addr::new(a, b, segment, host))
                .collect();

            pool.subnets
                .insert(bucket, Subnet::new(Ipv4Addr::new(a, b, segment, 0), 24));
            pool.ips.insert(bucket, hosts);
        }
        pool
    }

    /// Subnet of the chain's bucket, if the chain is bound
    pub fn subnet_of(&self, chain_id: ChainId) -> Option<Subnet> {
        self.bucket_of(chain_id)
            .and_then(|bucket| self.subnets.get(&bucket).copied())
    }
}

impl PoolState for AddressPool {
    type Value = Ipv4Addr;
    const RESOURCE: ResourceKind = ResourceKind::Ip;

    fn buckets(&self) -> &Buckets<Ipv4Addr> {
        &self.ips
    }
    fn buckets_mut(&mut self) -> &mut Buckets<Ipv4Addr> {
        &mut self.ips
    }
    fn chain_buckets(&self) -> &BTreeMap<ChainId, BucketId> {
        &self.chain_id_mapping
    }
    fn chain_buckets_mut(&mut self) -> &mut BTreeMap<ChainId, BucketId> {
        &mut self.chain_id_mapping
    }
}

/// Hands out container addresses and reports each chain's subnet
pub struct AddressPoolAllocator {
    path: PathBuf,
    pools: PoolConfig,
    lock_timeout: Duration,
    host: Box<dyn HostAddressSource + Send + Sync>,
}

impl fmt::Debug for AddressPoolAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressPoolAllocator")
            .field("path", &self.path)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

impl AddressPoolAllocator {
    /// `host` is only consulted when the pool file has to be created.
    pub fn new(
        layout: &StateLayout,
        config: &AllocatorConfig,
        host: Box<dyn HostAddressSource + Send + Sync>,
    ) -> Self {
        AddressPoolAllocator {
            path: layout.ips_file(),
            pools: config.pools.clone(),
            lock_timeout: config.lock_timeout,
            host,
        }
    }

    fn init(&self) -> Result<AddressPool> {
        let host = self.host.primary_ipv4()?;
        let pool = AddressPool::initial(&self.pools, host);
        log::info!(
            "Address assignment file {:?} does not exist, creating {} buckets from host address {}",
            self.path,
            self.pools.bucket_count,
            host
        );
        for (bucket, subnet) in &pool.subnets {
            log::debug!("Bucket {} uses subnet {}", bucket, subnet);
        }
        Ok(pool)
    }

    fn update<R>(&self, update: impl FnOnce(&mut AddressPool) -> Result<R>) -> Result<R> {
        storage::update_json(&self.path, self.lock_timeout, || self.init(), update)
    }

    /// Grant the next free address of the chain's bucket
    pub fn allocate(&self, chain_id: ChainId) -> Result<Ipv4Addr> {
        let result = self.update(|pool| pool.take(chain_id, self.pools.sharing));
        match &result {
            Ok(ip) => log::info!("Allocated IP {} to chain {}", ip, chain_id),
            Err(e @ AllocError::PoolExhausted { .. }) => log::error!("{}", e),
            Err(_) => {}
        }
        result
    }

    /// Bind the chain to a bucket without consuming an address
    pub fn ensure_binding(&self, chain_id: ChainId) -> Result<BucketId> {
        self.update(|pool| pool.bind(chain_id, self.pools.sharing))
    }

    /// Bind the chain if needed and return its bucket's subnet
    pub fn assign_subnet(&self, chain_id: ChainId) -> Result<Subnet> {
        self.update(|pool| {
            let bucket = pool.bind(chain_id, self.pools.sharing)?;
            pool.subnets.get(&bucket).copied().ok_or_else(|| AllocError::ConfigCorrupt {
                path: self.path.clone(),
                source: serde::de::Error::custom(format!("bucket {} has no subnet", bucket)),
            })
        })
    }

    /// Subnet of the chain's bucket. Pure read: never binds or allocates.
    pub fn subnet_for(&self, chain_id: ChainId) -> Result<Option<Subnet>> {
        Ok(self.load()?.and_then(|pool| pool.subnet_of(chain_id)))
    }

    /// Return reclaimed addresses to the chain's bucket
    pub fn release(&self, chain_id: ChainId, ips: &[Ipv4Addr]) -> Result<usize> {
        if ips.is_empty() {
            return Ok(0);
        }
        let inserted = self.update(|pool| Ok(pool.give_back(chain_id, ips)))?;
        log::info!("Returned {} of {} IPs to the pool for chain {}", inserted, ips.len(), chain_id);
        Ok(inserted)
    }

    /// Bucket the chain is bound to, without binding it
    pub fn bucket_for(&self, chain_id: ChainId) -> Result<Option<BucketId>> {
        Ok(self.load()?.and_then(|pool| pool.bucket_of(chain_id)))
    }

    /// Current persisted pool, if it has been initialized
    pub fn load(&self) -> Result<Option<AddressPool>> {
        storage::read_json(&self.path)
    }
}

//! Bucketed resource pools.
//!
//! Ports and addresses are handed out the same way: the pool is split into a
//! fixed number of buckets, each chain is bound to one bucket the first time
//! it asks, and every request pops the lowest free value of that bucket.
//! [`PoolState`] carries that algorithm; the port and address pools only
//! describe their persisted shape and how to build the initial buckets.
//!
//! Each allocator call is one locked read-modify-write of its pool file (see
//! [`crate::storage::update_json`]), so concurrent callers never lose updates
//! or receive the same value.

pub mod addresses;
pub mod ports;
pub mod rpc;

pub use addresses::{AddressPool, AddressPoolAllocator};
pub use ports::{PortPool, PortPoolAllocator};
pub use rpc::{RpcPortAllocator, RpcPorts};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::config::BucketSharing;
use crate::error::{AllocError, ResourceKind, Result};
use crate::types::{BucketId, ChainId};

/// Free values per bucket, lowest first
pub type Buckets<T> = BTreeMap<BucketId, VecDeque<T>>;

/// Persisted state of one bucketed pool.
pub trait PoolState: Serialize + DeserializeOwned {
    type Value: Copy + Ord + fmt::Display;

    const RESOURCE: ResourceKind;

    fn buckets(&self) -> &Buckets<Self::Value>;
    fn buckets_mut(&mut self) -> &mut Buckets<Self::Value>;
    fn chain_buckets(&self) -> &BTreeMap<ChainId, BucketId>;
    fn chain_buckets_mut(&mut self) -> &mut BTreeMap<ChainId, BucketId>;

    /// Bucket bound to `chain_id`, if any
    fn bucket_of(&self, chain_id: ChainId) -> Option<BucketId> {
        self.chain_buckets().get(&chain_id).copied()
    }

    /// Return the chain's bucket, binding it to the first bucket (in bucket
    /// order) with a free value if it has none yet. With
    /// `BucketSharing::Exclusive`, buckets bound to other chains are skipped.
    /// A binding never changes.
    fn bind(&mut self, chain_id: ChainId, sharing: BucketSharing) -> Result<BucketId> {
        if let Some(bucket) = self.bucket_of(chain_id) {
            return Ok(bucket);
        }

        let taken: Vec<BucketId> = match sharing {
            BucketSharing::Shared => Vec::new(),
            BucketSharing::Exclusive => self.chain_buckets().values().copied().collect(),
        };
        let bucket = self
            .buckets()
            .iter()
            .find(|(id, free)| !free.is_empty() && !taken.contains(id))
            .map(|(id, _)| *id)
            .ok_or(AllocError::PoolExhausted {
                resource: Self::RESOURCE,
                chain_id,
            })?;

        self.chain_buckets_mut().insert(chain_id, bucket);
        log::info!("Bound chain {} to {} bucket {}", chain_id, Self::RESOURCE, bucket);
        Ok(bucket)
    }

    /// Pop the lowest free value from the chain's bucket
    fn take(&mut self, chain_id: ChainId, sharing: BucketSharing) -> Result<Self::Value> {
        let bucket = self.bind(chain_id, sharing)?;
        self.buckets_mut()
            .get_mut(&bucket)
            .and_then(|free| free.pop_front())
            .ok_or(AllocError::PoolExhausted {
                resource: Self::RESOURCE,
                chain_id,
            })
    }

    /// Append reclaimed values to the back of the chain's bucket.
    ///
    /// Values already free in any bucket are rejected, as is everything for a
    /// chain with no binding. Returns how many values were re-inserted.
    fn give_back(&mut self, chain_id: ChainId, values: &[Self::Value]) -> usize {
        let Some(bucket) = self.bucket_of(chain_id) else {
            if !values.is_empty() {
                log::warn!(
                    "Chain {} has no {} bucket; dropping {} reclaimed values",
                    chain_id,
                    Self::RESOURCE,
                    values.len()
                );
            }
            return 0;
        };

        let mut inserted = 0;
        for value in values {
            if self.buckets().values().any(|free| free.contains(value)) {
                log::warn!("{} {} is already free; not re-inserting", Self::RESOURCE, value);
                continue;
            }
            self.buckets_mut().entry(bucket).or_default().push_back(*value);
            inserted += 1;
        }
        inserted
    }

    /// Total number of free values across all buckets
    fn free_count(&self) -> usize {
        self.buckets().values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const SHARED: BucketSharing = BucketSharing::Shared;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct NumberPool {
        numbers: Buckets<u32>,
        chain_id_mapping: BTreeMap<ChainId, BucketId>,
    }

    impl PoolState for NumberPool {
        type Value = u32;
        const RESOURCE: ResourceKind = ResourceKind::Port;

        fn buckets(&self) -> &Buckets<u32> {
            &self.numbers
        }
        fn buckets_mut(&mut self) -> &mut Buckets<u32> {
            &mut self.numbers
        }
        fn chain_buckets(&self) -> &BTreeMap<ChainId, BucketId> {
            &self.chain_id_mapping
        }
        fn chain_buckets_mut(&mut self) -> &mut BTreeMap<ChainId, BucketId> {
            &mut self.chain_id_mapping
        }
    }

    fn pool(buckets: &[&[u32]]) -> NumberPool {
        let mut pool = NumberPool::default();
        for (i, values) in buckets.iter().enumerate() {
            pool.numbers
                .insert(BucketId(i as u32 + 1), values.iter().copied().collect());
        }
        pool
    }

    #[test]
    fn test_take_is_lowest_first() {
        let mut pool = pool(&[&[1, 2, 3]]);
        assert_eq!(pool.take(ChainId(7), SHARED).unwrap(), 1);
        assert_eq!(pool.take(ChainId(7), SHARED).unwrap(), 2);
    }

    #[test]
    fn test_bind_skips_empty_buckets() {
        let mut pool = pool(&[&[], &[10, 11]]);
        assert_eq!(pool.bind(ChainId(1), SHARED).unwrap(), BucketId(2));
    }

    #[test]
    fn test_binding_survives_exhaustion() {
        let mut pool = pool(&[&[1], &[10]]);
        assert_eq!(pool.take(ChainId(1), SHARED).unwrap(), 1);

        let err = pool.take(ChainId(1), SHARED).unwrap_err();
        assert!(matches!(err, AllocError::PoolExhausted { .. }));
        // Never migrates to bucket 2 even though it has room
        assert_eq!(pool.bucket_of(ChainId(1)), Some(BucketId(1)));
    }

    #[test]
    fn test_exhausted_pool_binds_nothing() {
        let mut pool = pool(&[&[], &[]]);
        assert!(pool.take(ChainId(3), SHARED).is_err());
        assert_eq!(pool.bucket_of(ChainId(3)), None);
    }

    #[test]
    fn test_n_free_slots_serve_n_new_chains() {
        let mut pool = pool(&[&[1, 2, 3]]);
        for chain in 0..3 {
            assert!(pool.take(ChainId(chain), SHARED).is_ok());
        }
        assert!(matches!(
            pool.take(ChainId(99), SHARED),
            Err(AllocError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_exclusive_binding_skips_claimed_buckets() {
        let mut pool = pool(&[&[1, 2], &[10, 11], &[20]]);
        assert_eq!(pool.bind(ChainId(1), BucketSharing::Exclusive).unwrap(), BucketId(1));
        assert_eq!(pool.bind(ChainId(2), BucketSharing::Exclusive).unwrap(), BucketId(2));
        assert_eq!(pool.bind(ChainId(3), BucketSharing::Exclusive).unwrap(), BucketId(3));
        assert!(matches!(
            pool.bind(ChainId(4), BucketSharing::Exclusive),
            Err(AllocError::PoolExhausted { .. })
        ));
        // Shared binding still lands on the first non-empty bucket
        assert_eq!(pool.bind(ChainId(4), SHARED).unwrap(), BucketId(1));
    }

    #[test]
    fn test_give_back_appends_and_dedups() {
        let mut pool = pool(&[&[1, 2, 3], &[10]]);
        let first = pool.take(ChainId(5), SHARED).unwrap();

        assert_eq!(pool.give_back(ChainId(5), &[first, 2, 10]), 1);
        let free: Vec<u32> = pool.numbers[&BucketId(1)].iter().copied().collect();
        assert_eq!(free, vec![2, 3, 1]);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_give_back_without_binding_drops_values() {
        let mut pool = pool(&[&[1]]);
        assert_eq!(pool.give_back(ChainId(42), &[5]), 0);
        assert_eq!(pool.free_count(), 1);
    }
}

//! Allocator configuration.
//!
//! Every field has a default matching the historical pool geometry
//! (4 buckets of 19 slots, P2P ports from 30303, RPC ports from 8575), so an
//! empty YAML document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Each bucket needs its own third octet
const MAX_BUCKETS: u32 = 254;

/// How new chains pick a bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketSharing {
    /// First bucket with a free value, even if other chains are bound to it
    #[default]
    Shared,
    /// First bucket with a free value that no other chain is bound to
    Exclusive,
}

/// Bucket geometry shared by the port and address pools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of buckets, fixed at first initialization
    pub bucket_count: u32,
    /// Slots per bucket (ports and IPs alike)
    pub bucket_capacity: u32,
    /// P2P port numbering: `base_port + bucket_index * port_stride + slot`
    pub base_port: u16,
    pub port_stride: u16,
    pub sharing: BucketSharing,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bucket_count: 4,
            bucket_capacity: 19,
            base_port: 30303,
            port_stride: 100,
            sharing: BucketSharing::Shared,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// First port tried when assigning a chain its RPC port
    pub base_port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { base_port: 8575 }
    }
}

/// Top-level configuration for the allocation subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Root of the persisted state; pool files live in `<state_dir>/networks`
    pub state_dir: PathBuf,
    pub pools: PoolConfig,
    pub rpc: RpcConfig,
    /// Address whose first two octets seed the subnets. Detected from the
    /// host when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_address: Option<Ipv4Addr>,
    /// How long to wait for another writer to release a state file
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Run a reclaim pass before every node allocation
    pub reconcile_before_allocate: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("local-storage"),
            pools: PoolConfig::default(),
            rpc: RpcConfig::default(),
            host_address: None,
            lock_timeout: Duration::from_secs(10),
            reconcile_before_allocate: true,
        }
    }
}

impl AllocatorConfig {
    /// Default configuration rooted at `state_dir`
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        let pools = &self.pools;

        if pools.bucket_count == 0 || pools.bucket_count > MAX_BUCKETS {
            return Err(ValidationError::InvalidPool(format!(
                "bucket_count must be between 1 and {}, got {}",
                MAX_BUCKETS, pools.bucket_count
            )));
        }
        if pools.bucket_capacity == 0 || pools.bucket_capacity > 254 {
            return Err(ValidationError::InvalidPool(format!(
                "bucket_capacity must be between 1 and 254, got {}",
                pools.bucket_capacity
            )));
        }
        // Each bucket's subnet takes the third octet `index * capacity`; they must not wrap
        if (pools.bucket_count - 1) * pools.bucket_capacity >= 254 {
            return Err(ValidationError::InvalidPool(format!(
                "{} buckets of {} addresses do not fit in distinct /24 subnets",
                pools.bucket_count, pools.bucket_capacity
            )));
        }

        if u32::from(pools.port_stride) < pools.bucket_capacity {
            return Err(ValidationError::InvalidPorts(format!(
                "port_stride {} is smaller than bucket_capacity {}; buckets would overlap",
                pools.port_stride, pools.bucket_capacity
            )));
        }
        let (low, high) = self.p2p_port_range();
        if high > u32::from(u16::MAX) {
            return Err(ValidationError::InvalidPorts(format!(
                "highest pool port {} exceeds 65535",
                high
            )));
        }

        let rpc = u32::from(self.rpc.base_port);
        if rpc >= low && rpc <= high {
            return Err(ValidationError::InvalidPorts(format!(
                "rpc base port {} lies inside the P2P pool range {}-{}",
                rpc, low, high
            )));
        }

        if self.state_dir.as_os_str().is_empty() {
            return Err(ValidationError::InvalidState(
                "state_dir cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Lowest and highest port the P2P pool can ever hand out
    fn p2p_port_range(&self) -> (u32, u32) {
        let pools = &self.pools;
        let stride = u32::from(pools.port_stride);
        let low = u32::from(pools.base_port) + stride;
        let high = u32::from(pools.base_port) + pools.bucket_count * stride + pools.bucket_capacity - 1;
        (low, high)
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid pool configuration: {0}")]
    InvalidPool(String),
    #[error("Invalid port configuration: {0}")]
    InvalidPorts(String),
    #[error("Invalid state configuration: {0}")]
    InvalidState(String),
}

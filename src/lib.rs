//! # Chainnet Alloc - local resources for sandbox chain networks
//!
//! This library allocates and tracks the finite local resources that
//! independently deployed sandbox chains need on one host: P2P ports, container
//! IPv4 addresses and subnets, and one RPC port per chain.
//!
//! ## Overview
//!
//! Resources come from fixed-size pools split into buckets. A chain is bound
//! to one bucket the first time it asks for a value and keeps that bucket for
//! the lifetime of the pool file. Every grant is persisted immediately, so
//! state survives restarts, and every persisted file is updated under an
//! advisory lock so concurrent deploys never receive the same value.
//!
//! Reconciliation compares the recorded nodes against what is actually
//! running (node processes and containers) and returns the resources of dead
//! nodes to their pools.
//!
//! ## Architecture
//!
//! - `types`: chain ids, bucket ids, subnets and node records
//! - `config` / `config_loader`: pool geometry and YAML loading
//! - `storage`: state directory layout, atomic JSON files, file locks
//! - `pool`: the bucketed port and address pools and the RPC port table
//! - `introspect`: live process/container state behind a typed interface
//! - `registry`: the `NetworkRegistry` that deployment code talks to
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chainnet_alloc::{AllocatorConfig, ChainId, NetworkRegistry, NodeRole};
//!
//! let config = AllocatorConfig::with_state_dir("local-storage");
//! let registry = NetworkRegistry::with_system(&config)?;
//!
//! let allocation = registry.add_node(ChainId(12), NodeRole::Signer, "0x5e1f...")?;
//! println!("start the node on {}:{}", allocation.ip, allocation.port);
//!
//! // Later, before the next deploy: free what is no longer running
//! let report = registry.update_global_allocations()?;
//! # let _ = report;
//! # Ok::<(), chainnet_alloc::AllocError>(())
//! ```
//!
//! ## Persisted Files
//!
//! ```text
//! local-storage/networks/
//! |-- ports.json
//! |-- ips.json
//! |-- rpcPorts.json
//! \-- <chainId>/network-config.json
//! ```
//!
//! ## Error Handling
//!
//! Library functions return [`AllocError`], one variant per failure kind
//! (pool exhaustion, missing or corrupt state, tool failures, locking). The
//! binary reports them through `color_eyre`.

pub mod config;
pub mod config_loader;
pub mod error;
pub mod introspect;
pub mod pool;
pub mod registry;
pub mod storage;
pub mod types;

pub use config::{AllocatorConfig, BucketSharing, PoolConfig, RpcConfig, ValidationError};
pub use error::{AllocError, ResourceKind, Result};
pub use introspect::{HostAddressSource, LiveSnapshot, LiveStateSource, SystemInspector};
pub use registry::{NetworkRegistry, ReclaimReport, ReclaimableResources};
pub use types::{BucketId, ChainId, ChainNetworkConfig, NodeAllocation, NodeRecord, NodeRole, Subnet};

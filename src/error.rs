//! Error kinds surfaced by the allocators and the registry.

use crate::config::ValidationError;
use crate::types::{ChainId, PartialGrant};
use std::path::PathBuf;
use std::time::Duration;

/// Which finite pool a failure refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Port,
    Ip,
    RpcPort,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Port => f.write_str("port"),
            ResourceKind::Ip => f.write_str("ip"),
            ResourceKind::RpcPort => f.write_str("rpc port"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("no free {resource} left for chain {chain_id}")]
    PoolExhausted {
        resource: ResourceKind,
        chain_id: ChainId,
    },

    #[error("no network config for chain {chain_id} at {}", .path.display())]
    ConfigNotFound { chain_id: ChainId, path: PathBuf },

    #[error("corrupt state file {}: {source}", .path.display())]
    ConfigCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{tool} failed: {message}")]
    ExternalToolFailure { tool: String, message: String },

    #[error("allocation for chain {chain_id} incomplete (granted {granted:?}): {source}")]
    PartialAllocation {
        chain_id: ChainId,
        granted: PartialGrant,
        #[source]
        source: Box<AllocError>,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {waited:?} waiting for lock on {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error(transparent)]
    InvalidConfig(#[from] ValidationError),

    #[error("cannot determine host IPv4 address: {0}")]
    HostAddressUnavailable(String),
}

impl AllocError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AllocError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        AllocError::ExternalToolFailure {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AllocError>;

//! Persisted state layout and JSON file access.
//!
//! All state lives under one directory:
//!
//! ```text
//! <state_dir>/networks/
//! |-- ports.json                  # P2P port buckets + chain bindings
//! |-- ips.json                    # address buckets, chain bindings, subnets
//! |-- rpcPorts.json               # permanent per-chain RPC ports
//! \-- <chainId>/network-config.json
//! ```
//!
//! Writers replace files atomically (temp file + rename). Shared files are only
//! mutated through [`update_json`], which holds a [`StateLock`] for the whole
//! read-modify-write span.

pub mod lock;

pub use lock::StateLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AllocError, Result};
use crate::types::ChainId;

pub const NETWORKS_DIR: &str = "networks";
pub const PORTS_FILE: &str = "ports.json";
pub const IPS_FILE: &str = "ips.json";
pub const RPC_PORTS_FILE: &str = "rpcPorts.json";
pub const NETWORK_CONFIG_FILE: &str = "network-config.json";

/// Paths of every persisted file, derived from the state directory
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        StateLayout {
            root: state_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn networks_dir(&self) -> PathBuf {
        self.root.join(NETWORKS_DIR)
    }

    pub fn ports_file(&self) -> PathBuf {
        self.networks_dir().join(PORTS_FILE)
    }

    pub fn ips_file(&self) -> PathBuf {
        self.networks_dir().join(IPS_FILE)
    }

    pub fn rpc_ports_file(&self) -> PathBuf {
        self.networks_dir().join(RPC_PORTS_FILE)
    }

    pub fn chain_dir(&self, chain_id: ChainId) -> PathBuf {
        self.networks_dir().join(chain_id.to_string())
    }

    pub fn network_config_file(&self, chain_id: ChainId) -> PathBuf {
        self.chain_dir(chain_id).join(NETWORK_CONFIG_FILE)
    }

    /// Chain ids that have a directory under `networks/`, ascending.
    ///
    /// Entries whose name is not a chain id (pool files, lock files) are ignored.
    pub fn chain_ids(&self) -> Result<Vec<ChainId>> {
        let dir = self.networks_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AllocError::io(&dir, e)),
        };

        let mut chain_ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AllocError::io(&dir, e))?;
            let is_dir = entry
                .file_type()
                .map_err(|e| AllocError::io(entry.path(), e))?
                .is_dir();
            if !is_dir {
                continue;
            }
            if let Some(chain_id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                chain_ids.push(chain_id);
            }
        }
        chain_ids.sort();
        Ok(chain_ids)
    }

    /// Remove every persisted pool and chain file
    pub fn reset(&self) -> Result<()> {
        let dir = self.networks_dir();
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                log::info!("Removed network state at {:?}", dir);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AllocError::io(&dir, e)),
        }
    }
}

/// Read and parse a JSON file; `Ok(None)` when it does not exist.
///
/// A file that exists but does not parse is `AllocError::ConfigCorrupt`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    Ok(read_json_raw(path)?.map(|(value, _)| value))
}

fn read_json_raw<T: DeserializeOwned>(path: &Path) -> Result<Option<(T, String)>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AllocError::io(path, e)),
    };
    let value = serde_json::from_str(&content).map_err(|source| AllocError::ConfigCorrupt {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some((value, content)))
}

fn to_json_string<T: Serialize>(path: &Path, value: &T) -> Result<String> {
    let mut content = serde_json::to_string_pretty(value).map_err(|e| {
        AllocError::io(path, std::io::Error::new(ErrorKind::InvalidData, e))
    })?;
    content.push('\n');
    Ok(content)
}

/// Serialize `value` and atomically replace `path` with it
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = to_json_string(path, value)?;
    write_atomic(path, &content)
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AllocError::io(parent, e))?;
    }
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, content).map_err(|e| AllocError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| AllocError::io(path, e))
}

/// Locked read-modify-write of one JSON file.
///
/// Holds the file's [`StateLock`] while it loads the current value (or builds
/// one with `init` when the file is missing), applies `update`, and persists
/// the result. Nothing is written if `update` fails, and an unchanged value
/// leaves the file untouched.
pub fn update_json<T, R>(
    path: &Path,
    lock_timeout: Duration,
    init: impl FnOnce() -> Result<T>,
    update: impl FnOnce(&mut T) -> Result<R>,
) -> Result<R>
where
    T: Serialize + DeserializeOwned,
{
    let _lock = StateLock::acquire(path, lock_timeout)?;

    let (mut value, previous) = match read_json_raw::<T>(path)? {
        Some((value, content)) => (value, Some(content)),
        None => (init()?, None),
    };

    let result = update(&mut value)?;

    let content = to_json_string(path, &value)?;
    if previous.as_deref() != Some(content.as_str()) {
        write_atomic(path, &content)?;
    }
    Ok(result)
}

//! Advisory file locks guarding read-modify-write cycles on state files.
//!
//! Uses `fs2` (flock on Unix, LockFileEx on Windows). Each acquisition opens
//! its own handle, so the lock excludes other threads of this process as well
//! as other processes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{AllocError, Result};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(2);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Exclusive lock on one state file, released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Lock `target` by locking its sibling `<name>.lock` file.
    ///
    /// Retries with exponential backoff until `timeout` expires, then returns
    /// `AllocError::LockTimeout`.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<Self> {
        let path = lock_path_for(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AllocError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| AllocError::io(&path, e))?;

        let started = Instant::now();
        let mut retry_delay = INITIAL_RETRY_DELAY;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    log::trace!("Acquired lock {:?}", path);
                    return Ok(StateLock { file, path });
                }
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(AllocError::LockTimeout { path, waited });
                    }
                    thread::sleep(retry_delay);
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => return Err(AllocError::io(&path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

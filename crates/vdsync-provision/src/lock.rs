//! Host-wide advisory lock: at most one install/uninstall at a time.

use crate::error::{ProvisionError, ProvisionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    operation: String,
    acquired_at: DateTime<Utc>,
}

/// Held for the lifetime of a transaction; the lock file goes away on drop.
#[derive(Debug)]
pub struct TransactionLock {
    path: PathBuf,
    /// What this holder wrote, to tell our lock from a successor's.
    body: Vec<u8>,
}

impl TransactionLock {
    /// Take the lock or fail fast with `ConcurrentTransaction`. A lock older
    /// than `stale_after` is assumed abandoned by a dead process and taken over.
    pub fn acquire(path: &Path, operation: &str, stale_after: Duration) -> ProvisionResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ProvisionError::persistence("lock", e))?;
        }
        let info = LockInfo {
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&info).map_err(|e| ProvisionError::persistence("lock", e))?;

        let mut took_over = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    file.write_all(&body)
                        .and_then(|()| file.sync_all())
                        .map_err(|e| ProvisionError::persistence("lock", e))?;
                    info!(?path, operation, "Transaction lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        body,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let (holder, stale) = inspect(path, stale_after);
                    if stale && !took_over {
                        warn!(?path, ?holder, "Taking over abandoned transaction lock");
                        set_aside(path, stale_after)?;
                        took_over = true;
                        continue;
                    }
                    return Err(concurrent(holder));
                }
                Err(e) => return Err(ProvisionError::persistence("lock", e)),
            }
        }
    }
}

/// Who holds the lock at `path`, and whether it looks abandoned.
fn inspect(path: &Path, stale_after: Duration) -> (Option<LockInfo>, bool) {
    let holder = fs::read(path)
        .ok()
        .and_then(|b| serde_json::from_slice::<LockInfo>(&b).ok());
    let stale = match &holder {
        Some(h) => Utc::now()
            .signed_duration_since(h.acquired_at)
            .to_std()
            .map_or(false, |age| age > stale_after),
        // Unreadable: possibly mid-write by its creator, so go by mtime.
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map_or(false, |age| age > stale_after),
    };
    (holder, stale)
}

/// Move a stale lock out of the way under a name only this process uses,
/// then check that what moved is still stale. Another process may have
/// replaced it with a fresh lock in between; that one is put back.
fn set_aside(path: &Path, stale_after: Duration) -> ProvisionResult<()> {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".stale-{}-{nonce}", std::process::id()));
    let aside = PathBuf::from(aside);

    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ProvisionError::persistence("lock", e)),
    }
    let (holder, stale) = inspect(&aside, stale_after);
    if !stale {
        // hard_link never clobbers a lock created meanwhile.
        if let Err(e) = fs::hard_link(&aside, path) {
            warn!(?path, error = %e, "Could not put back a live transaction lock");
        }
        if let Err(e) = fs::remove_file(&aside) {
            warn!(path = ?aside, error = %e, "Could not remove set-aside lock");
        }
        return Err(concurrent(holder));
    }
    fs::remove_file(&aside).map_err(|e| ProvisionError::persistence("lock", e))
}

fn concurrent(holder: Option<LockInfo>) -> ProvisionError {
    let holder = holder.map_or_else(
        || "unknown holder".to_string(),
        |h| format!("pid {} running {} since {}", h.pid, h.operation, h.acquired_at),
    );
    ProvisionError::ConcurrentTransaction { holder }
}

impl Drop for TransactionLock {
    fn drop(&mut self) {
        match fs::read(&self.path) {
            Ok(current) if current == self.body => match fs::remove_file(&self.path) {
                Ok(()) => info!(path = ?self.path, "Transaction lock released"),
                Err(e) => warn!(path = ?self.path, error = %e, "Failed to release transaction lock"),
            },
            Ok(_) => warn!(path = ?self.path, "Transaction lock was taken over, leaving it in place"),
            Err(e) => warn!(path = ?self.path, error = %e, "Transaction lock already gone"),
        }
    }
}

//! Snapshot and restore of the streaming server's config file.
//!
//! A snapshot lands at `<path>.bak`. If an earlier committed backup is
//! already there it is parked at `<path>.bak.prev` for the duration of the
//! transaction: commit drops the parked copy, discard puts it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vdsync_config::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    /// Where the previous committed backup was parked, if there was one.
    pub previous_backup: Option<PathBuf>,
    /// SHA-256 of the original content, hex.
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `<path>.bak`
pub fn backup_path_for(path: &Path) -> PathBuf {
    with_suffix(path, ".bak")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Tracks the backups taken by one transaction.
#[derive(Debug, Default)]
pub struct ConfigBackupManager {
    pending: Vec<BackupRecord>,
}

impl ConfigBackupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backups taken and not yet committed or discarded.
    pub fn pending(&self) -> &[BackupRecord] {
        &self.pending
    }

    /// Copy `path` to `<path>.bak`. Returns only once the copy is on disk.
    pub fn snapshot(&mut self, path: &Path) -> io::Result<BackupRecord> {
        let contents = fs::read(path)?;
        let backup_path = backup_path_for(path);

        let previous_backup = if backup_path.exists() {
            let parked = with_suffix(&backup_path, ".prev");
            fs::rename(&backup_path, &parked)?;
            Some(parked)
        } else {
            None
        };

        if let Err(e) = write_atomic(&backup_path, &contents) {
            if let Some(parked) = &previous_backup {
                if let Err(undo) = fs::rename(parked, &backup_path) {
                    warn!(?parked, error = %undo, "Could not un-park previous backup");
                }
            }
            return Err(e);
        }

        let record = BackupRecord {
            original_path: path.to_path_buf(),
            backup_path,
            previous_backup,
            checksum: Some(sha256_hex(&contents)),
            created_at: Utc::now(),
        };
        info!(original = ?record.original_path, backup = ?record.backup_path, "Config snapshot taken");
        self.pending.push(record.clone());
        Ok(record)
    }

    /// Put the backed-up content back over the original. An original that
    /// already matches is left untouched.
    pub fn restore(&self, record: &BackupRecord) -> io::Result<()> {
        let contents = match fs::read(&record.backup_path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(io::Error::new(
                    ErrorKind::NotFound,
                    format!("backup {} is missing", record.backup_path.display()),
                ))
            }
            Err(e) => return Err(e),
        };
        if let Some(expected) = &record.checksum {
            let actual = sha256_hex(&contents);
            if &actual != expected {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "backup {} checksum mismatch (expected {expected}, found {actual})",
                        record.backup_path.display()
                    ),
                ));
            }
        }
        if fs::read(&record.original_path).ok().as_deref() == Some(contents.as_slice()) {
            info!(original = ?record.original_path, "Config already matches backup");
            return Ok(());
        }
        write_atomic(&record.original_path, &contents)?;
        info!(original = ?record.original_path, "Config restored from backup");
        Ok(())
    }

    /// Drop an uncommitted backup and reinstate the previous baseline.
    pub fn discard(&mut self, record: &BackupRecord) -> io::Result<()> {
        remove_if_present(&record.backup_path)?;
        if let Some(parked) = &record.previous_backup {
            if parked.exists() {
                fs::rename(parked, &record.backup_path)?;
            }
        }
        self.forget(record);
        Ok(())
    }

    /// Make `record` the new baseline; the file stays at `<path>.bak`.
    pub fn commit(&mut self, record: &BackupRecord) -> io::Result<()> {
        if let Some(parked) = &record.previous_backup {
            remove_if_present(parked)?;
        }
        self.forget(record);
        info!(backup = ?record.backup_path, "Config backup committed");
        Ok(())
    }

    /// Commit everything still pending. Failures are logged; the transaction
    /// is already durable at this point.
    pub fn commit_all(&mut self) {
        for record in std::mem::take(&mut self.pending) {
            if let Err(e) = self.commit(&record) {
                warn!(backup = ?record.backup_path, error = %e, "Could not finalise backup");
            }
        }
    }

    fn forget(&mut self, record: &BackupRecord) {
        self.pending.retain(|r| r.backup_path != record.backup_path);
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

//! Durable mirror of an in-flight transaction.
//!
//! Each step is written before its side effect runs, so a transaction cut
//! short by process death can still be rolled back on the next run. Every
//! undo therefore tolerates a side effect that never happened.

use crate::backup::BackupRecord;
use crate::error::{ProvisionError, ProvisionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use vdsync_config::{write_atomic, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Install,
    Uninstall,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
        })
    }
}

/// A side effect that has happened or may have happened, with what it takes
/// to undo it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum CompletedStep {
    ServiceStopped { service: String, was_running: bool },
    /// Registration started; the published id is not known yet.
    DriverRegistering { package: PathBuf },
    DriverRegistered { id: String },
    DriverDeregistered { id: String, package: Option<PathBuf> },
    ConfigBackedUp { record: BackupRecord },
    SettingsWritten { previous: Option<Settings> },
    SettingsDeleted { previous: Settings },
    ServiceRestarted { service: String },
}

impl CompletedStep {
    pub fn describe(&self) -> String {
        match self {
            Self::ServiceStopped { service, .. } => format!("service {service} stopped"),
            Self::DriverRegistering { package } => format!("driver {} registering", package.display()),
            Self::DriverRegistered { id } => format!("driver {id} registered"),
            Self::DriverDeregistered { id, .. } => format!("driver {id} removed"),
            Self::ConfigBackedUp { record } => {
                format!("config {} backed up", record.original_path.display())
            }
            Self::SettingsWritten { .. } => "settings written".into(),
            Self::SettingsDeleted { .. } => "settings deleted".into(),
            Self::ServiceRestarted { service } => format!("service {service} restarted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub operation: OperationKind,
    pub started_at: DateTime<Utc>,
    /// In the order they happened.
    pub steps: Vec<CompletedStep>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Journal at `<dir>/transaction.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("transaction.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> ProvisionResult<Option<JournalRecord>> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ProvisionError::persistence("journal", e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProvisionError::persistence("journal", e)),
        }
    }

    pub fn save(&self, record: &JournalRecord) -> ProvisionResult<()> {
        let body = serde_json::to_vec_pretty(record).map_err(|e| ProvisionError::persistence("journal", e))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ProvisionError::persistence("journal", e))?;
        }
        write_atomic(&self.path, &body).map_err(|e| ProvisionError::persistence("journal", e))?;
        debug!(path = ?self.path, steps = record.steps.len(), "Journal updated");
        Ok(())
    }

    pub fn clear(&self) -> ProvisionResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = ?self.path, "Journal cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProvisionError::persistence("journal", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::in_dir(dir.path());
        assert_eq!(journal.load().unwrap(), None);

        let record = JournalRecord {
            operation: OperationKind::Install,
            started_at: Utc::now(),
            steps: vec![
                CompletedStep::ServiceStopped {
                    service: "SunshineService".into(),
                    was_running: true,
                },
                CompletedStep::DriverRegistered { id: "oem3.inf".into() },
            ],
        };
        journal.save(&record).unwrap();
        assert_eq!(journal.load().unwrap(), Some(record));

        let raw = fs::read_to_string(journal.path()).unwrap();
        assert!(raw.contains("\"step\": \"driverRegistered\""));

        journal.clear().unwrap();
        journal.clear().unwrap();
        assert_eq!(journal.load().unwrap(), None);
    }
}

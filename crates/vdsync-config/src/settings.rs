use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use crate::atomic::write_atomic;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// Where a provisioning transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallState {
    Idle,
    PreflightChecked,
    ServiceStopped,
    DriverInstalled,
    ConfigUpdated,
    SettingsPersisted,
    ServiceRestarted,
    Committed,
    RollingBack,
    RolledBack,
    /// Rollback could not complete; manual recovery required.
    Failed,
}

/// The persistent record of this host's provisioning.
///
/// Present iff the host is provisioned. Fields this version does not know
/// about are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Published name of the registered driver package (e.g. `oem42.inf`).
    pub virtual_display_id: String,
    pub config_path: PathBuf,
    #[serde(default)]
    pub config_backup_path: Option<PathBuf>,
    pub service_name: String,
    pub install_state: InstallState,
    pub install_timestamp: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Package the driver was installed from, used to reinstall on a failed
    /// uninstall.
    #[serde(default)]
    pub driver_package: Option<PathBuf>,
    /// The `key = value` line install added to the config file. Uninstall
    /// removes exactly this line.
    #[serde(default)]
    pub directive: Option<RecordedDirective>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDirective {
    pub key: String,
    pub value: String,
}

fn default_schema_version() -> u32 {
    SETTINGS_SCHEMA_VERSION
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings at {path} are malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable home of the single [`Settings`] record.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/settings.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. `Ok(None)` means the host is not provisioned.
    pub fn load(&self) -> Result<Option<Settings>, SettingsError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_err(source)),
        };
        let settings = serde_json::from_str(&contents).map_err(|source| SettingsError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = ?self.path, "Loaded settings");
        Ok(Some(settings))
    }

    /// Write the record atomically (temp file, fsync, rename).
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let json = serde_json::to_vec_pretty(settings).map_err(|source| SettingsError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        write_atomic(&self.path, &json).map_err(|e| self.io_err(e))?;
        info!(path = ?self.path, state = ?settings.install_state, "Saved settings");
        Ok(())
    }

    /// Remove the record. Returns whether one existed.
    pub fn delete(&self) -> Result<bool, SettingsError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = ?self.path, "Deleted settings");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn io_err(&self, source: std::io::Error) -> SettingsError {
        SettingsError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Settings {
        Settings {
            virtual_display_id: "oem42.inf".into(),
            config_path: PathBuf::from("sunshine.conf"),
            config_backup_path: Some(PathBuf::from("sunshine.conf.bak")),
            service_name: "SunshineService".into(),
            install_state: InstallState::Committed,
            install_timestamp: Utc::now(),
            schema_version: SETTINGS_SCHEMA_VERSION,
            driver_package: None,
            directive: Some(RecordedDirective {
                key: "output_name".into(),
                value: "VDD by MTT".into(),
            }),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn absent_record_means_not_provisioned() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::in_dir(dir.path());
        assert!(store.load().unwrap().is_none());
        assert!(!store.delete().unwrap());
    }

    #[test]
    fn save_then_load_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::in_dir(dir.path());
        let settings = sample();
        store.save(&settings).unwrap();
        assert_eq!(store.load().unwrap(), Some(settings));
        assert!(store.delete().unwrap());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn unknown_fields_survive_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::in_dir(dir.path());
        fs::write(
            store.path(),
            r#"{
                "virtualDisplayId": "oem7.inf",
                "configPath": "sunshine.conf",
                "serviceName": "SunshineService",
                "installState": "Committed",
                "installTimestamp": "2024-05-01T10:00:00Z",
                "monitorGuid": "{abc}"
            }"#,
        )
        .unwrap();

        let mut settings = store.load().unwrap().unwrap();
        assert_eq!(settings.schema_version, SETTINGS_SCHEMA_VERSION);
        assert_eq!(settings.config_backup_path, None);
        assert_eq!(settings.directive, None);
        settings.virtual_display_id = "oem8.inf".into();
        store.save(&settings).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["monitorGuid"], "{abc}");
        assert_eq!(raw["virtualDisplayId"], "oem8.inf");
    }

    #[test]
    fn garbage_is_reported_as_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::in_dir(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(SettingsError::Malformed { .. })));
    }
}

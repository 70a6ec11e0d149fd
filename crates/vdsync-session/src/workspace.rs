//! Per-session scratch directory with its record and log.
//!
//! Layout: `<sessions>/<id>/session.json` and `<sessions>/<id>/session.log`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use vdsync_config::write_atomic;
use vdsync_vdisplay::{AchievedMode, Mode, ModeRequest};

const RECORD_FILE: &str = "session.json";
const LOG_FILE: &str = "session.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    /// Display the session drives.
    pub display: String,
    pub request: Option<ModeRequest>,
    /// Mode that was active before connect changed anything.
    pub previous_mode: Option<Mode>,
    pub applied: Option<AchievedMode>,
    /// Set once anything was logged as an error.
    pub keep_artifacts: bool,
    /// Cleared by disconnect.
    pub active: bool,
}

#[derive(Debug)]
pub struct SessionWorkspace {
    dir: PathBuf,
    record: SessionRecord,
}

impl SessionWorkspace {
    /// Create a fresh workspace under `root`, named by the current time.
    pub fn create(root: &Path, display: &str) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let started_at = Utc::now();
        let stamp = started_at.format("%Y%m%dT%H%M%S%.3fZ").to_string();

        let mut suffix = 0u32;
        let (id, dir) = loop {
            let id = if suffix == 0 {
                stamp.clone()
            } else {
                format!("{stamp}-{suffix}")
            };
            let dir = root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => break (id, dir),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e),
            }
        };

        let workspace = Self {
            dir,
            record: SessionRecord {
                id,
                started_at,
                display: display.to_string(),
                request: None,
                previous_mode: None,
                applied: None,
                keep_artifacts: false,
                active: true,
            },
        };
        workspace.save()?;
        info!(session = %workspace.record.id, dir = ?workspace.dir, "Session workspace created");
        Ok(workspace)
    }

    pub fn open(dir: &Path) -> io::Result<Self> {
        let bytes = fs::read(dir.join(RECORD_FILE))?;
        let record = serde_json::from_slice(&bytes).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            record,
        })
    }

    /// The newest workspace under `root` still marked active.
    pub fn latest_active(root: &Path) -> io::Result<Option<Self>> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut latest: Option<Self> = None;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let workspace = match Self::open(&entry.path()) {
                Ok(w) => w,
                Err(e) => {
                    debug!(dir = ?entry.path(), error = %e, "Skipping unreadable session");
                    continue;
                }
            };
            if !workspace.record.active {
                continue;
            }
            let newer = latest.as_ref().map_or(true, |l| {
                (workspace.record.started_at, &workspace.record.id) > (l.record.started_at, &l.record.id)
            });
            if newer {
                latest = Some(workspace);
            }
        }
        Ok(latest)
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut SessionRecord {
        &mut self.record
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn save(&self) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(&self.record).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        write_atomic(&self.dir.join(RECORD_FILE), &body)
    }

    pub fn info(&mut self, message: &str) {
        info!(session = %self.record.id, "{message}");
        self.append("INFO", message);
    }

    /// Log an error; the workspace will be kept for diagnosis.
    pub fn error(&mut self, message: &str) {
        error!(session = %self.record.id, "{message}");
        self.append("ERROR", message);
        if !self.record.keep_artifacts {
            self.record.keep_artifacts = true;
            if let Err(e) = self.save() {
                warn!(session = %self.record.id, error = %e, "Could not mark session for keeping");
            }
        }
    }

    fn append(&self, level: &str, message: &str) {
        let line = format!(
            "{} {level} {message}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            warn!(session = %self.record.id, error = %e, "Could not write session log");
        }
    }

    /// End the session. Removes the workspace unless an error was logged.
    /// Returns whether it was removed.
    pub fn finish(mut self) -> io::Result<bool> {
        self.record.active = false;
        if self.record.keep_artifacts {
            self.append("INFO", "session ended; workspace kept");
            self.save()?;
            warn!(session = %self.record.id, dir = ?self.dir, "Session had errors, keeping workspace");
            return Ok(false);
        }
        fs::remove_dir_all(&self.dir)?;
        info!(session = %self.record.id, "Session workspace removed");
        Ok(true)
    }
}

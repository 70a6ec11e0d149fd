use crate::directive::DirectiveParseError;
use crate::service::ServiceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use vdsync_config::SettingsError;
use vdsync_vdisplay::DriverError;

/// Machine-distinguishable failure class, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Internal,
    Precondition,
    ServiceControl,
    Driver,
    Config,
    Persistence,
    RollbackPartialFailure,
    ConcurrentTransaction,
    NoAchievableMode,
    Fetch,
    SessionAbort,
}

impl ErrorKind {
    /// Process exit code for this class.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Internal => 1,
            Self::Precondition => 10,
            Self::ServiceControl => 11,
            Self::Driver => 12,
            Self::Config => 13,
            Self::Persistence => 14,
            Self::RollbackPartialFailure => 15,
            Self::ConcurrentTransaction => 16,
            Self::NoAchievableMode => 20,
            Self::Fetch => 21,
            Self::SessionAbort => 22,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Precondition => "precondition",
            Self::ServiceControl => "service_control",
            Self::Driver => "driver",
            Self::Config => "config",
            Self::Persistence => "persistence",
            Self::RollbackPartialFailure => "rollback_partial_failure",
            Self::ConcurrentTransaction => "concurrent_transaction",
            Self::NoAchievableMode => "no_achievable_mode",
            Self::Fetch => "fetch",
            Self::SessionAbort => "session_abort",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which install/uninstall prerequisite is missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error("administrator privileges are required")]
    NotElevated,
    #[error("network is unreachable (probed {probe})")]
    NetworkUnreachable { probe: String },
    #[error("streaming server is not installed: {what}")]
    CollaboratorMissing { what: String },
    #[error("no driver package given (use --driver-package or driver.package_path)")]
    NoDriverPackage,
    #[error("driver package {0} does not exist")]
    DriverPackageMissing(PathBuf),
    #[error("host is already provisioned")]
    AlreadyProvisioned,
    #[error("host is not provisioned")]
    NotProvisioned,
    #[error("streaming.directive is malformed: {0}")]
    InvalidDirective(#[from] DirectiveParseError),
}

/// A compensating action that could not be completed during rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub error: String,
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("precondition failed: {0}")]
    Precondition(#[from] Precondition),

    #[error("service control failed: {0}")]
    ServiceControl(#[from] ServiceError),

    #[error("driver step failed: {0}")]
    Driver(#[from] DriverError),

    #[error("config {path} could not be updated: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist {what}: {source}")]
    Persistence {
        what: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("another transaction is in flight ({holder})")]
    ConcurrentTransaction { holder: String },

    #[error("{operation} transaction started {started_at} was interrupted")]
    Interrupted {
        operation: String,
        started_at: DateTime<Utc>,
    },

    #[error(
        "rollback after \"{cause}\" is incomplete; manual recovery required: {}",
        join_failures(.failures)
    )]
    RollbackPartialFailure {
        cause: Box<ProvisionError>,
        failures: Vec<CompensationFailure>,
    },
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::ServiceControl(_) => ErrorKind::ServiceControl,
            Self::Driver(_) => ErrorKind::Driver,
            Self::Config { .. } => ErrorKind::Config,
            Self::Persistence { .. } => ErrorKind::Persistence,
            Self::ConcurrentTransaction { .. } => ErrorKind::ConcurrentTransaction,
            Self::Interrupted { .. } => ErrorKind::Internal,
            Self::RollbackPartialFailure { .. } => ErrorKind::RollbackPartialFailure,
        }
    }

    pub(crate) fn persistence(
        what: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            what,
            source: Box::new(source),
        }
    }
}

impl From<SettingsError> for ProvisionError {
    fn from(e: SettingsError) -> Self {
        Self::persistence("settings", e)
    }
}

fn join_failures(failures: &[CompensationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

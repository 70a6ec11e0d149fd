//! Install and uninstall of the virtual display as a rollback-capable
//! transaction, plus the collaborators it drives.

pub mod backup;
pub mod directive;
pub mod error;
pub mod journal;
pub mod lock;
pub mod preflight;
pub mod retry;
pub mod service;
pub mod transaction;

pub use backup::{sha256_hex, BackupRecord, ConfigBackupManager};
pub use directive::{ConfigFile, Directive, DirectiveParseError};
pub use error::{CompensationFailure, ErrorKind, Precondition, ProvisionError, ProvisionResult};
pub use journal::{CompletedStep, Journal, JournalRecord, OperationKind};
pub use lock::TransactionLock;
pub use preflight::{HostProbe, SystemProbe};
pub use retry::{Backoff, RetryPolicy};
pub use service::{ScService, ServiceError, ServicePort, ServiceState};
pub use transaction::{
    recover, status, Operation, ProvisionContext, RecoveryReport, StatusReport, Transaction, TransactionReport,
};

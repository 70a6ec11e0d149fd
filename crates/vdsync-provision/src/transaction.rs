//! Install and uninstall as one all-or-nothing transaction.
//!
//! Forward path:
//!
//! `Idle -> PreflightChecked -> ServiceStopped -> DriverInstalled ->
//! ConfigUpdated -> SettingsPersisted -> ServiceRestarted -> Committed`
//!
//! Every side effect is recorded as a [`CompletedStep`] (in memory and in the
//! [`Journal`]) before it runs. When a step fails, the recorded steps are
//! compensated in reverse. Every compensation is attempted; the ones that
//! fail are reported together as `RollbackPartialFailure` and stay in the
//! journal.

use crate::backup::ConfigBackupManager;
use crate::directive::{ConfigFile, Directive};
use crate::error::{CompensationFailure, Precondition, ProvisionError, ProvisionResult};
use crate::journal::{CompletedStep, Journal, JournalRecord, OperationKind};
use crate::lock::TransactionLock;
use crate::preflight::HostProbe;
use crate::retry::RetryPolicy;
use crate::service::{wait_for_state, ServicePort, ServiceState};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use vdsync_config::{InstallState, RecordedDirective, Settings, SettingsStore, SETTINGS_SCHEMA_VERSION};
use vdsync_vdisplay::DriverPort;

/// Everything a transaction talks to. Owned by the caller and lent to the
/// transaction for its whole lifetime.
pub struct ProvisionContext<'a> {
    pub driver: &'a mut dyn DriverPort,
    pub service: &'a mut dyn ServicePort,
    pub probe: &'a dyn HostProbe,
    pub store: &'a SettingsStore,
    pub journal: &'a Journal,
    pub lock_path: PathBuf,
    pub stale_lock_after: Duration,
    pub service_name: String,
    pub config_path: PathBuf,
    pub directive: Directive,
    /// Polling used while waiting for the service to stop or start.
    pub service_wait: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Install { package: Option<PathBuf> },
    Uninstall,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Install { .. } => OperationKind::Install,
            Self::Uninstall => OperationKind::Uninstall,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionReport {
    pub operation: OperationKind,
    pub state: InstallState,
    /// The record as committed; `None` after an uninstall.
    pub settings: Option<Settings>,
    /// Whether the directive edit actually changed the file.
    pub config_changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Operation of the interrupted transaction, if there was one.
    pub operation: Option<OperationKind>,
    pub compensated: usize,
}

pub struct Transaction {
    operation: Operation,
    state: InstallState,
    started_at: DateTime<Utc>,
    steps: Vec<CompletedStep>,
    backups: ConfigBackupManager,
}

impl Transaction {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            state: InstallState::Idle,
            started_at: Utc::now(),
            steps: Vec::new(),
            backups: ConfigBackupManager::new(),
        }
    }

    pub fn state(&self) -> InstallState {
        self.state
    }

    /// Run to `Committed`, or roll back and return the failure.
    pub fn run(mut self, ctx: &mut ProvisionContext<'_>) -> ProvisionResult<TransactionReport> {
        let kind = self.operation.kind();
        let _lock = TransactionLock::acquire(&ctx.lock_path, &kind.to_string(), ctx.stale_lock_after)?;
        info!(operation = %kind, "Transaction started");

        replay_journal(ctx)?;

        let settings = self.preflight(ctx)?;
        self.transition(InstallState::PreflightChecked);

        let result = match self.operation.clone() {
            Operation::Install { package } => match package {
                Some(package) => self.install(ctx, &package),
                None => Err(Precondition::NoDriverPackage.into()),
            },
            Operation::Uninstall => match settings {
                Some(settings) => self.uninstall(ctx, settings),
                None => Err(Precondition::NotProvisioned.into()),
            },
        };

        match result {
            Ok(report) => {
                info!(operation = %kind, "Transaction committed");
                Ok(report)
            }
            Err(cause) => Err(self.roll_back(ctx, cause)),
        }
    }

    fn transition(&mut self, next: InstallState) {
        info!(from = ?self.state, to = ?next, "Transaction state");
        self.state = next;
    }

    fn record(&mut self, ctx: &ProvisionContext<'_>, step: CompletedStep) -> ProvisionResult<()> {
        self.steps.push(step);
        ctx.journal.save(&JournalRecord {
            operation: self.operation.kind(),
            started_at: self.started_at,
            steps: self.steps.clone(),
        })
    }

    /// No side effects. Returns the current settings, if any.
    fn preflight(&self, ctx: &mut ProvisionContext<'_>) -> ProvisionResult<Option<Settings>> {
        if !ctx.probe.is_elevated() {
            return Err(Precondition::NotElevated.into());
        }
        if matches!(self.operation, Operation::Install { .. }) && !ctx.probe.network_reachable() {
            return Err(Precondition::NetworkUnreachable {
                probe: ctx.probe.network_probe(),
            }
            .into());
        }
        if !ctx.config_path.is_file() {
            return Err(Precondition::CollaboratorMissing {
                what: format!("config file {} not found", ctx.config_path.display()),
            }
            .into());
        }
        if ctx.service.query(&ctx.service_name)? == ServiceState::Missing {
            return Err(Precondition::CollaboratorMissing {
                what: format!("service {} not installed", ctx.service_name),
            }
            .into());
        }

        let settings = ctx.store.load()?;
        match &self.operation {
            Operation::Install { package } => {
                if settings.is_some() {
                    return Err(Precondition::AlreadyProvisioned.into());
                }
                match package {
                    None => return Err(Precondition::NoDriverPackage.into()),
                    Some(p) if !p.is_file() => {
                        return Err(Precondition::DriverPackageMissing(p.clone()).into())
                    }
                    Some(_) => {}
                }
            }
            Operation::Uninstall => {
                if settings.is_none() {
                    return Err(Precondition::NotProvisioned.into());
                }
            }
        }
        Ok(settings)
    }

    fn install(&mut self, ctx: &mut ProvisionContext<'_>, package: &Path) -> ProvisionResult<TransactionReport> {
        let was_running = self.stop_service(ctx)?;

        let id = self.register_driver(ctx, package)?;
        self.transition(InstallState::DriverInstalled);

        let directive = ctx.directive.clone();
        let (backup_path, config_changed) = self.edit_config(ctx, &directive, |file, d| file.add(d))?;

        let mut settings = Settings {
            virtual_display_id: id,
            config_path: ctx.config_path.clone(),
            config_backup_path: Some(backup_path),
            service_name: ctx.service_name.clone(),
            install_state: InstallState::SettingsPersisted,
            install_timestamp: Utc::now(),
            schema_version: SETTINGS_SCHEMA_VERSION,
            driver_package: Some(package.to_path_buf()),
            directive: Some(RecordedDirective::from(&directive)),
            extra: serde_json::Map::new(),
        };
        self.record(ctx, CompletedStep::SettingsWritten { previous: None })?;
        ctx.store.save(&settings)?;
        self.transition(InstallState::SettingsPersisted);

        self.restart_service(ctx, was_running)?;

        settings.install_state = InstallState::Committed;
        ctx.store.save(&settings)?;
        self.commit(ctx)?;

        Ok(TransactionReport {
            operation: OperationKind::Install,
            state: self.state,
            settings: Some(settings),
            config_changed,
        })
    }

    fn uninstall(&mut self, ctx: &mut ProvisionContext<'_>, settings: Settings) -> ProvisionResult<TransactionReport> {
        let was_running = self.stop_service(ctx)?;

        let id = settings.virtual_display_id.clone();
        self.record(
            ctx,
            CompletedStep::DriverDeregistered {
                id: id.clone(),
                package: settings.driver_package.clone(),
            },
        )?;
        ctx.driver.deregister(&id)?;
        self.transition(InstallState::DriverInstalled);

        // Remove exactly what install added, even if the executable moved since.
        let directive = settings
            .directive
            .as_ref()
            .map(Directive::from)
            .unwrap_or_else(|| ctx.directive.clone());
        let (_, config_changed) = self.edit_config(ctx, &directive, |file, d| file.remove(d) > 0)?;

        self.record(ctx, CompletedStep::SettingsDeleted { previous: settings })?;
        ctx.store.delete()?;
        self.transition(InstallState::SettingsPersisted);

        self.restart_service(ctx, was_running)?;
        self.commit(ctx)?;

        Ok(TransactionReport {
            operation: OperationKind::Uninstall,
            state: self.state,
            settings: None,
            config_changed,
        })
    }

    /// Stop the service if it runs; returns whether it was running. The step
    /// is journaled first so a stop that never completes still gets a restart.
    fn stop_service(&mut self, ctx: &mut ProvisionContext<'_>) -> ProvisionResult<bool> {
        let name = ctx.service_name.clone();
        let was_running = ctx.service.query(&name)? != ServiceState::Stopped;
        self.record(
            ctx,
            CompletedStep::ServiceStopped {
                service: name.clone(),
                was_running,
            },
        )?;
        if was_running {
            ctx.service.stop(&name)?;
            wait_for_state(ctx.service, &name, ServiceState::Stopped, &ctx.service_wait)?;
        } else {
            info!(service = %name, "Service already stopped");
        }
        self.transition(InstallState::ServiceStopped);
        Ok(was_running)
    }

    /// Journal the intent, register, then swap the intent for the published id.
    fn register_driver(&mut self, ctx: &mut ProvisionContext<'_>, package: &Path) -> ProvisionResult<String> {
        self.record(
            ctx,
            CompletedStep::DriverRegistering {
                package: package.to_path_buf(),
            },
        )?;
        let registered = ctx.driver.register(package);
        self.steps.pop();
        // A failed pnputil run added nothing; rollback rewrites the journal.
        let id = registered?;
        self.record(ctx, CompletedStep::DriverRegistered { id: id.clone() })?;
        Ok(id)
    }

    /// Snapshot, then apply `edit`. Returns the backup path and whether the
    /// file changed.
    fn edit_config(
        &mut self,
        ctx: &ProvisionContext<'_>,
        directive: &Directive,
        edit: impl FnOnce(&mut ConfigFile, &Directive) -> bool,
    ) -> ProvisionResult<(PathBuf, bool)> {
        let path = ctx.config_path.clone();
        let config_err = |source| ProvisionError::Config {
            path: path.clone(),
            source,
        };

        let record = self.backups.snapshot(&path).map_err(config_err)?;
        let backup_path = record.backup_path.clone();
        self.record(ctx, CompletedStep::ConfigBackedUp { record })?;

        let mut file = ConfigFile::read(&path).map_err(config_err)?;
        let changed = edit(&mut file, directive);
        if changed {
            file.write(&path).map_err(config_err)?;
        }
        info!(?path, changed, %directive, "Config updated");
        self.transition(InstallState::ConfigUpdated);
        Ok((backup_path, changed))
    }

    fn restart_service(&mut self, ctx: &mut ProvisionContext<'_>, was_running: bool) -> ProvisionResult<()> {
        if was_running {
            let name = ctx.service_name.clone();
            self.record(ctx, CompletedStep::ServiceRestarted { service: name.clone() })?;
            ctx.service.start(&name)?;
            wait_for_state(ctx.service, &name, ServiceState::Running, &ctx.service_wait)?;
        }
        self.transition(InstallState::ServiceRestarted);
        Ok(())
    }

    fn commit(&mut self, ctx: &ProvisionContext<'_>) -> ProvisionResult<()> {
        ctx.journal.clear()?;
        self.backups.commit_all();
        self.steps.clear();
        self.transition(InstallState::Committed);
        Ok(())
    }

    fn roll_back(&mut self, ctx: &mut ProvisionContext<'_>, cause: ProvisionError) -> ProvisionError {
        error!(kind = %cause.kind(), error = %cause, state = ?self.state, "Transaction step failed, rolling back");
        self.transition(InstallState::RollingBack);

        let steps = std::mem::take(&mut self.steps);
        let failed = compensate(ctx, &mut self.backups, steps);
        if failed.is_empty() {
            if let Err(e) = ctx.journal.clear() {
                warn!(error = %e, "Rolled back but could not clear journal");
            }
            self.transition(InstallState::RolledBack);
            return cause;
        }

        let failures = failed.iter().map(|(_, failure)| failure.clone()).collect();
        let remaining = JournalRecord {
            operation: self.operation.kind(),
            started_at: self.started_at,
            steps: failed.into_iter().map(|(step, _)| step).collect(),
        };
        if let Err(e) = ctx.journal.save(&remaining) {
            error!(error = %e, "Could not record failed compensations");
        }
        self.transition(InstallState::Failed);
        let err = ProvisionError::RollbackPartialFailure {
            cause: Box::new(cause),
            failures,
        };
        error!(kind = %err.kind(), error = %err, "Rollback incomplete");
        err
    }
}

/// Roll back a transaction left behind by a dead process, under the lock.
pub fn recover(ctx: &mut ProvisionContext<'_>) -> ProvisionResult<RecoveryReport> {
    let _lock = TransactionLock::acquire(&ctx.lock_path, "recover", ctx.stale_lock_after)?;
    replay_journal(ctx)
}

/// Compensate whatever the journal still lists. Caller holds the lock.
fn replay_journal(ctx: &mut ProvisionContext<'_>) -> ProvisionResult<RecoveryReport> {
    let Some(record) = ctx.journal.load()? else {
        return Ok(RecoveryReport {
            operation: None,
            compensated: 0,
        });
    };
    warn!(
        operation = %record.operation,
        started_at = %record.started_at,
        steps = record.steps.len(),
        "Rolling back interrupted transaction"
    );

    let total = record.steps.len();
    let mut backups = ConfigBackupManager::new();
    let failed = compensate(ctx, &mut backups, record.steps);
    if failed.is_empty() {
        ctx.journal.clear()?;
        info!(operation = %record.operation, compensated = total, "Interrupted transaction rolled back");
        return Ok(RecoveryReport {
            operation: Some(record.operation),
            compensated: total,
        });
    }

    let failures = failed.iter().map(|(_, failure)| failure.clone()).collect();
    ctx.journal.save(&JournalRecord {
        operation: record.operation,
        started_at: record.started_at,
        steps: failed.into_iter().map(|(step, _)| step).collect(),
    })?;
    Err(ProvisionError::RollbackPartialFailure {
        cause: Box::new(ProvisionError::Interrupted {
            operation: record.operation.to_string(),
            started_at: record.started_at,
        }),
        failures,
    })
}

/// Undo `steps` newest first. Returns the steps whose undo failed, oldest
/// first, so they can be journaled and replayed in the same order.
fn compensate(
    ctx: &mut ProvisionContext<'_>,
    backups: &mut ConfigBackupManager,
    steps: Vec<CompletedStep>,
) -> Vec<(CompletedStep, CompensationFailure)> {
    let mut failed = Vec::new();
    for step in steps.into_iter().rev() {
        match undo(ctx, backups, &step) {
            Ok(()) => info!(step = %step.describe(), "Compensated"),
            Err(e) => {
                error!(step = %step.describe(), error = %e, "Compensation failed");
                let failure = CompensationFailure {
                    step: step.describe(),
                    error: e.to_string(),
                };
                failed.push((step, failure));
            }
        }
    }
    failed.reverse();
    failed
}

fn undo(ctx: &mut ProvisionContext<'_>, backups: &mut ConfigBackupManager, step: &CompletedStep) -> ProvisionResult<()> {
    match step {
        CompletedStep::ServiceStopped { service, was_running } => {
            if *was_running && ctx.service.query(service)? != ServiceState::Running {
                ctx.service.start(service)?;
                wait_for_state(ctx.service, service, ServiceState::Running, &ctx.service_wait)?;
            }
        }
        CompletedStep::ServiceRestarted { service } => {
            // Stop again so the ServiceStopped undo restarts it on the restored config.
            ctx.service.stop(service)?;
            wait_for_state(ctx.service, service, ServiceState::Stopped, &ctx.service_wait)?;
        }
        CompletedStep::DriverRegistering { package } => {
            if let Some(id) = ctx.driver.find_registered(package)? {
                ctx.driver.deregister(&id)?;
            }
        }
        CompletedStep::DriverRegistered { id } => ctx.driver.deregister(id)?,
        CompletedStep::DriverDeregistered { id, package } => match package {
            Some(package) if package.is_file() => {
                let current = match ctx.driver.find_registered(package)? {
                    Some(current) => current,
                    None => ctx.driver.register(package)?,
                };
                if current != *id {
                    adopt_driver_id(ctx.store, &current);
                }
            }
            _ => warn!(
                %id,
                ?package,
                "No cached driver package; cannot reinstall the virtual display driver"
            ),
        },
        CompletedStep::ConfigBackedUp { record } => {
            let to_config_err = |source| ProvisionError::Config {
                path: record.original_path.clone(),
                source,
            };
            backups.restore(record).map_err(to_config_err)?;
            backups.discard(record).map_err(to_config_err)?;
        }
        CompletedStep::SettingsWritten { previous } => match previous {
            Some(previous) => ctx.store.save(previous)?,
            None => {
                ctx.store.delete()?;
            }
        },
        CompletedStep::SettingsDeleted { previous } => ctx.store.save(previous)?,
    }
    Ok(())
}

/// A reinstalled driver may get a new published name; point settings at it.
fn adopt_driver_id(store: &SettingsStore, new_id: &str) {
    let updated = store.load().and_then(|settings| match settings {
        Some(mut settings) => {
            settings.virtual_display_id = new_id.to_string();
            store.save(&settings)
        }
        None => Ok(()),
    });
    match updated {
        Ok(()) => info!(%new_id, "Settings now reference the reinstalled driver"),
        Err(e) => warn!(%new_id, error = %e, "Could not record reinstalled driver id"),
    }
}

/// Snapshot of provisioning state for `provision status`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub settings: Option<Settings>,
    pub pending_journal: Option<JournalRecord>,
    /// `None` when the config file cannot be read.
    pub directive_present: Option<bool>,
}

pub fn status(
    store: &SettingsStore,
    journal: &Journal,
    config_path: &Path,
    directive: &Directive,
) -> ProvisionResult<StatusReport> {
    Ok(StatusReport {
        settings: store.load()?,
        pending_journal: journal.load()?,
        directive_present: ConfigFile::read(config_path).ok().map(|f| f.contains(directive)),
    })
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use vdsync_config::{AppConfig, Settings, SettingsStore};
use vdsync_provision::{
    recover, status, Directive, ErrorKind, Journal, Operation, Precondition, ProvisionContext, ProvisionError,
    RetryPolicy, ScService, SystemProbe, Transaction,
};
use vdsync_session::{HttpFetcher, SessionCoordinator, SessionError, ToolCache};
use vdsync_vdisplay::driver::PnpUtilDriver;
use vdsync_vdisplay::manager::{ToolCommands, ToolDisplay};
use vdsync_vdisplay::DisplayPort;

#[derive(Parser)]
#[command(name = "vdsync", about = "Virtual display provisioning and per-session mode sync")]
struct Cli {
    /// Config file (default: <config dir>/vdsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Install or remove the virtual display
    Provision {
        #[command(subcommand)]
        action: ProvisionCmd,
    },
    /// Hooks run by the streaming server around each stream
    Session {
        #[command(subcommand)]
        action: SessionCmd,
    },
}

#[derive(Subcommand)]
enum ProvisionCmd {
    /// Register the driver and enable the session hooks
    Install {
        /// Driver package (.inf); falls back to driver.package_path
        #[arg(long)]
        driver_package: Option<PathBuf>,
    },
    /// Remove the driver and the session hooks
    Uninstall,
    /// Show provisioning state
    Status,
    /// Roll back a transaction interrupted by a crash
    Recover,
}

#[derive(Subcommand)]
enum SessionCmd {
    /// Apply the connecting client's mode
    Connect,
    /// Restore the mode from before connect
    Disconnect,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vdsync=info,vdsync_config=info,vdsync_provision=info,vdsync_session=info,vdsync_vdisplay=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => vdsync_config::load_config_from(path),
        None => vdsync_config::load_config(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            // Malformed configuration aborts a session; for provisioning it is user-fixable.
            let kind = match cli.command {
                Cmd::Session { .. } => ErrorKind::SessionAbort,
                Cmd::Provision { .. } => ErrorKind::Precondition,
            };
            fail(kind, e.context("loading config"));
        }
    };

    let result = match cli.command {
        Cmd::Provision { action } => provision(action, &config),
        Cmd::Session { action } => session(action, &config),
    };
    if let Err(e) = result {
        fail(kind_of(&e), e);
    }
}

fn kind_of(err: &anyhow::Error) -> ErrorKind {
    if let Some(e) = err.downcast_ref::<ProvisionError>() {
        e.kind()
    } else if let Some(e) = err.downcast_ref::<SessionError>() {
        e.kind()
    } else {
        ErrorKind::Internal
    }
}

fn fail(kind: ErrorKind, err: anyhow::Error) -> ! {
    error!(%kind, code = kind.exit_code(), error = %format!("{err:#}"), "Command failed");
    eprintln!("Error [{kind}]: {err:#}");
    std::process::exit(kind.exit_code());
}

/// The directive install recorded, else the configured one, else the hooks
/// pointing back at this executable.
fn directive(config: &AppConfig, recorded: Option<&Settings>) -> Result<Directive> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let directive = Directive::select(recorded, config.streaming.directive.as_deref(), &exe)
        .map_err(|e| ProvisionError::from(Precondition::from(e)))?;
    Ok(directive)
}

fn provision(action: ProvisionCmd, config: &AppConfig) -> Result<()> {
    let data = vdsync_config::data_dir()?;
    let store = SettingsStore::in_dir(&data);
    let journal = Journal::in_dir(&data);

    // Uninstall acts on what install recorded, not on today's config.
    let recorded = store.load().map_err(ProvisionError::from)?;
    let directive = directive(config, recorded.as_ref())?;
    let (service_name, config_path) = match &recorded {
        Some(settings) => (settings.service_name.clone(), settings.config_path.clone()),
        None => (config.streaming.service_name.clone(), config.streaming.config_path.clone()),
    };

    let mut driver = PnpUtilDriver::new();
    let mut service = ScService::new();
    let probe = SystemProbe::new(
        config.provision.connectivity_probe.clone(),
        Duration::from_secs(config.provision.connectivity_timeout_secs),
    );
    let mut ctx = ProvisionContext {
        driver: &mut driver,
        service: &mut service,
        probe: &probe,
        store: &store,
        journal: &journal,
        lock_path: data.join("transaction.lock"),
        stale_lock_after: Duration::from_secs(config.provision.stale_lock_secs),
        service_name,
        config_path,
        directive,
        service_wait: RetryPolicy::polling(
            Duration::from_secs(config.provision.service_timeout_secs),
            Duration::from_millis(config.provision.service_poll_ms),
        ),
    };

    let operation = match action {
        ProvisionCmd::Install { driver_package } => Operation::Install {
            package: driver_package.or_else(|| config.driver.package_path.clone()),
        },
        ProvisionCmd::Uninstall => Operation::Uninstall,
        ProvisionCmd::Recover => {
            let report = recover(&mut ctx)?;
            match report.operation {
                Some(operation) => println!(
                    "Rolled back interrupted {operation} ({} step(s) compensated)",
                    report.compensated
                ),
                None => println!("Nothing to recover"),
            }
            return Ok(());
        }
        ProvisionCmd::Status => return print_status(&store, &journal, &ctx.config_path, &ctx.directive),
    };

    let report = Transaction::new(operation).run(&mut ctx)?;
    info!(operation = %report.operation, config_changed = report.config_changed, "Done");
    match report.settings {
        Some(settings) => println!(
            "Installed virtual display {} (config {})",
            settings.virtual_display_id,
            if report.config_changed { "updated" } else { "already had directive" }
        ),
        None => println!("Uninstalled virtual display"),
    }
    Ok(())
}

fn print_status(store: &SettingsStore, journal: &Journal, config_path: &Path, directive: &Directive) -> Result<()> {
    let report = status(store, journal, config_path, directive)?;

    match &report.settings {
        Some(settings) => println!("Provisioned:\n{}", serde_json::to_string_pretty(settings)?),
        None => println!("Not provisioned"),
    }
    match &report.pending_journal {
        Some(pending) => println!(
            "Interrupted {} from {} pending ({} step(s)); run `vdsync provision recover`",
            pending.operation,
            pending.started_at,
            pending.steps.len()
        ),
        None => println!("No interrupted transaction"),
    }
    match report.directive_present {
        Some(true) => println!("Directive present in {}", config_path.display()),
        Some(false) => println!("Directive absent from {}", config_path.display()),
        None => println!("{} is not readable", config_path.display()),
    }
    Ok(())
}

fn session(action: SessionCmd, config: &AppConfig) -> Result<()> {
    let data = vdsync_config::data_dir()
        .map_err(|e| SessionError::Workspace(std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string())))?;
    let store = SettingsStore::in_dir(&data);
    let tool = &config.display.tool;
    let commands = ToolCommands {
        list_modes: tool.list_modes_args.clone(),
        current_mode: tool.current_mode_args.clone(),
        set_mode: tool.set_mode_args.clone(),
    };
    let mut fetcher = HttpFetcher::new(Duration::from_secs(config.fetch.timeout_secs));
    let mut coordinator = SessionCoordinator::new(
        &store,
        data.join("sessions"),
        ToolCache::new(data.join("tools")),
        config.display.clone(),
        RetryPolicy::fixed(config.fetch.attempts, Duration::from_millis(config.fetch.delay_ms)),
        &mut fetcher,
        Box::new(move |path: &Path| -> Box<dyn DisplayPort> { Box::new(ToolDisplay::new(path, commands.clone())) }),
    );

    match action {
        SessionCmd::Connect => {
            let report = coordinator.connect(|name| std::env::var(name).ok())?;
            match report.achieved {
                Some(achieved) => println!(
                    "Session {}: {} ({:?})",
                    report.session_id, achieved.mode, achieved.reason
                ),
                None => println!("Session {}: display mode unchanged", report.session_id),
            }
        }
        SessionCmd::Disconnect => {
            let report = coordinator.disconnect()?;
            match report.session_id {
                Some(id) => println!(
                    "Session {id} ended{}",
                    if report.workspace_removed { "" } else { "; workspace kept for diagnosis" }
                ),
                None => println!("No active session"),
            }
        }
    }
    Ok(())
}

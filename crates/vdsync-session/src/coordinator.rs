use crate::fetch::{ToolCache, ToolFetcher};
use crate::request::request_from;
use crate::workspace::SessionWorkspace;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use vdsync_config::{DisplayConfig, InstallState, SettingsError, SettingsStore};
use vdsync_provision::{ErrorKind, RetryPolicy};
use vdsync_vdisplay::{
    negotiate, AchievedMode, Availability, DisplayPort, Mode, ModeParseError, ModeRequest, NoAchievableMode,
    OverrideTable,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("settings unreadable: {0}")]
    Settings(#[from] SettingsError),
    #[error("host is not provisioned; run `provision install` first")]
    NotProvisioned,
    #[error("display configuration is invalid: {0}")]
    Config(#[from] ModeParseError),
    #[error("session workspace: {0}")]
    Workspace(#[from] io::Error),
    #[error(transparent)]
    NoAchievableMode(#[from] NoAchievableMode),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoAchievableMode(_) => ErrorKind::NoAchievableMode,
            _ => ErrorKind::SessionAbort,
        }
    }
}

/// Builds the display backend for a resolved tool path.
pub type DisplayFactory<'a> = Box<dyn FnMut(&Path) -> Box<dyn DisplayPort> + 'a>;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectReport {
    pub session_id: String,
    pub workspace: PathBuf,
    pub request: ModeRequest,
    /// `None` when the session continues without a mode change.
    pub achieved: Option<AchievedMode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectReport {
    /// `None` when no active session was found.
    pub session_id: Option<String>,
    pub restored: Option<Mode>,
    pub workspace_removed: bool,
}

/// Drives one connect/disconnect pair.
pub struct SessionCoordinator<'a> {
    store: &'a SettingsStore,
    sessions_root: PathBuf,
    cache: ToolCache,
    display_config: DisplayConfig,
    fetch_policy: RetryPolicy,
    fetcher: &'a mut dyn ToolFetcher,
    display_for: DisplayFactory<'a>,
}

impl<'a> SessionCoordinator<'a> {
    pub fn new(
        store: &'a SettingsStore,
        sessions_root: impl Into<PathBuf>,
        cache: ToolCache,
        display_config: DisplayConfig,
        fetch_policy: RetryPolicy,
        fetcher: &'a mut dyn ToolFetcher,
        display_for: DisplayFactory<'a>,
    ) -> Self {
        Self {
            store,
            sessions_root: sessions_root.into(),
            cache,
            display_config,
            fetch_policy,
            fetcher,
            display_for,
        }
    }

    /// Negotiate and apply the client's mode. `env` looks up client
    /// parameters by variable name.
    pub fn connect<F>(&mut self, env: F) -> Result<ConnectReport, SessionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = self.store.load()?.ok_or(SessionError::NotProvisioned)?;
        if settings.install_state != InstallState::Committed {
            warn!(state = ?settings.install_state, "Settings record is not committed");
            return Err(SessionError::NotProvisioned);
        }
        let default_mode: Mode = self.display_config.default_mode.parse()?;
        let overrides = OverrideTable::parse(self.display_config.overrides.as_slice())?;
        let display_id = settings.virtual_display_id;

        let mut ws = SessionWorkspace::create(&self.sessions_root, &display_id)?;
        let request = request_from(env, default_mode);
        ws.record_mut().request = Some(request);
        ws.info(&format!("requested {} ({:?})", request.mode, request.source));
        ws.save()?;

        let achieved = match self.resolve(&mut ws, &display_id, &request, &overrides) {
            Ok(achieved) => achieved,
            Err(e) => {
                ws.save()?;
                return Err(e);
            }
        };
        ws.record_mut().applied = achieved;
        ws.save()?;

        Ok(ConnectReport {
            session_id: ws.id().to_string(),
            workspace: ws.dir().to_path_buf(),
            request,
            achieved,
        })
    }

    /// Every failure in here degrades to "no mode change" except
    /// `NoAchievableMode` under strict negotiation.
    fn resolve(
        &mut self,
        ws: &mut SessionWorkspace,
        display_id: &str,
        request: &ModeRequest,
        overrides: &OverrideTable,
    ) -> Result<Option<AchievedMode>, SessionError> {
        let tool_path = match self.cache.ensure(self.fetcher, &self.display_config.tool, &self.fetch_policy) {
            Ok(path) => path,
            Err(e) => {
                ws.error(&format!("resolution tool unavailable, continuing without mode change: {e}"));
                return Ok(None);
            }
        };
        let mut display = (self.display_for)(&tool_path);

        match display.current_mode(display_id) {
            Ok(Availability::Available(mode)) => {
                ws.record_mut().previous_mode = Some(mode);
                ws.info(&format!("current mode {mode}"));
            }
            Ok(Availability::NotAvailable { reason }) => {
                ws.error(&format!("current mode unavailable: {reason}"));
            }
            Err(e) => ws.error(&format!("reading current mode failed: {e}")),
        }

        let capabilities = match display.supported_modes(display_id) {
            Ok(Availability::Available(modes)) => modes,
            Ok(Availability::NotAvailable { reason }) => {
                ws.error(&format!("display modes unavailable, continuing without mode change: {reason}"));
                return Ok(None);
            }
            Err(e) => {
                ws.error(&format!("listing display modes failed, continuing without mode change: {e}"));
                return Ok(None);
            }
        };

        let achieved = match negotiate(request, &capabilities, overrides) {
            Ok(achieved) => achieved,
            Err(e) if self.display_config.strict_negotiation => {
                ws.error(&format!("{e}; aborting"));
                return Err(e.into());
            }
            Err(e) => {
                ws.error(&format!("{e}; continuing without mode change"));
                return Ok(None);
            }
        };

        match display.apply_mode(display_id, achieved.mode) {
            Ok(Availability::Available(())) => {
                info!(
                    mode = %achieved.mode,
                    requested = %achieved.requested,
                    reason = ?achieved.reason,
                    degraded = achieved.degraded,
                    "Applied negotiated mode"
                );
                ws.info(&format!("applied {} ({:?})", achieved.mode, achieved.reason));
                Ok(Some(achieved))
            }
            Ok(Availability::NotAvailable { reason }) => {
                ws.error(&format!("applying {} unavailable: {reason}", achieved.mode));
                Ok(None)
            }
            Err(e) => {
                ws.error(&format!("applying {} failed: {e}", achieved.mode));
                Ok(None)
            }
        }
    }

    /// Restore the mode recorded at connect and release the workspace.
    /// Restore failures are logged, never returned.
    pub fn disconnect(&mut self) -> Result<DisconnectReport, SessionError> {
        let Some(mut ws) = SessionWorkspace::latest_active(&self.sessions_root)? else {
            warn!(root = ?self.sessions_root, "No active session to disconnect");
            return Ok(DisconnectReport {
                session_id: None,
                restored: None,
                workspace_removed: false,
            });
        };
        let session_id = ws.id().to_string();
        let record = ws.record().clone();

        let mut restored = None;
        match (record.previous_mode, record.applied) {
            (Some(previous), Some(applied)) if previous != applied.mode => {
                let tool_path = self.cache.path_for(&self.display_config.tool);
                let mut display = (self.display_for)(&tool_path);
                match display.apply_mode(&record.display, previous) {
                    Ok(Availability::Available(())) => {
                        ws.info(&format!("restored {previous}"));
                        restored = Some(previous);
                    }
                    Ok(Availability::NotAvailable { reason }) => {
                        ws.error(&format!("restoring {previous} unavailable: {reason}"));
                    }
                    Err(e) => ws.error(&format!("restoring {previous} failed: {e}")),
                }
            }
            _ => ws.info("no mode change to undo"),
        }

        let workspace_removed = ws.finish()?;
        Ok(DisconnectReport {
            session_id: Some(session_id),
            restored,
            workspace_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use vdsync_config::{Settings, SETTINGS_SCHEMA_VERSION};
    use vdsync_vdisplay::{DisplayError, ModeSource, NegotiationReason};

    #[derive(Default)]
    struct Screen {
        current: Option<Mode>,
        modes: Vec<Mode>,
        applied: Vec<Mode>,
        fail_apply: bool,
    }

    struct FakeDisplay(Arc<Mutex<Screen>>);

    impl DisplayPort for FakeDisplay {
        fn supported_modes(&mut self, _: &str) -> Result<Availability<Vec<Mode>>, DisplayError> {
            Ok(Availability::Available(self.0.lock().unwrap().modes.clone()))
        }

        fn current_mode(&mut self, _: &str) -> Result<Availability<Mode>, DisplayError> {
            Ok(match self.0.lock().unwrap().current {
                Some(mode) => Availability::Available(mode),
                None => Availability::not_available("no display"),
            })
        }

        fn apply_mode(&mut self, _: &str, mode: Mode) -> Result<Availability<()>, DisplayError> {
            let mut screen = self.0.lock().unwrap();
            if screen.fail_apply {
                return Err(DisplayError::Tool {
                    code: Some(1),
                    stderr: "mode rejected".into(),
                });
            }
            screen.applied.push(mode);
            screen.current = Some(mode);
            Ok(Availability::Available(()))
        }
    }

    struct Offline;

    impl ToolFetcher for Offline {
        fn fetch(&mut self, _: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "offline")))
        }
    }

    struct Host {
        dir: tempfile::TempDir,
        store: SettingsStore,
        screen: Arc<Mutex<Screen>>,
    }

    impl Host {
        fn provisioned() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = SettingsStore::in_dir(dir.path());
            store
                .save(&Settings {
                    virtual_display_id: "oem1.inf".into(),
                    config_path: dir.path().join("sunshine.conf"),
                    config_backup_path: None,
                    service_name: "SunshineService".into(),
                    install_state: InstallState::Committed,
                    install_timestamp: Utc::now(),
                    schema_version: SETTINGS_SCHEMA_VERSION,
                    driver_package: None,
                    directive: None,
                    extra: Default::default(),
                })
                .unwrap();
            // Pretend the tool is already cached.
            fs::create_dir_all(dir.path().join("tools")).unwrap();
            fs::write(dir.path().join("tools").join("QRes.exe"), b"tool").unwrap();
            let screen = Screen {
                current: Some(Mode::new(1920, 1080, 60)),
                modes: vec![
                    Mode::new(1920, 1080, 60),
                    Mode::new(1920, 1080, 90),
                    Mode::new(2560, 1440, 60),
                ],
                ..Screen::default()
            };
            Self {
                dir,
                store,
                screen: Arc::new(Mutex::new(screen)),
            }
        }

        fn sessions(&self) -> PathBuf {
            self.dir.path().join("sessions")
        }

        fn coordinator<'a>(&'a self, fetcher: &'a mut dyn ToolFetcher, display: DisplayConfig) -> SessionCoordinator<'a> {
            let screen = Arc::clone(&self.screen);
            SessionCoordinator::new(
                &self.store,
                self.sessions(),
                ToolCache::new(self.dir.path().join("tools")),
                display,
                RetryPolicy::fixed(1, std::time::Duration::ZERO),
                fetcher,
                Box::new(move |_: &Path| -> Box<dyn DisplayPort> { Box::new(FakeDisplay(Arc::clone(&screen))) }),
            )
        }
    }

    fn client(w: &str, h: &str, r: &str) -> impl Fn(&str) -> Option<String> {
        let env: HashMap<&'static str, String> = [
            ("CLIENT_WIDTH", w.to_string()),
            ("CLIENT_HEIGHT", h.to_string()),
            ("CLIENT_REFRESH_HZ", r.to_string()),
        ]
        .into_iter()
        .collect();
        move |name: &str| env.get(name).cloned()
    }

    #[test]
    fn connect_applies_degraded_mode_and_disconnect_restores() {
        let host = Host::provisioned();
        let mut fetcher = Offline;
        let mut coordinator = host.coordinator(&mut fetcher, DisplayConfig::default());

        let report = coordinator.connect(client("1920", "1080", "120")).unwrap();
        let achieved = report.achieved.unwrap();
        assert_eq!(achieved.mode, Mode::new(1920, 1080, 90));
        assert_eq!(achieved.reason, NegotiationReason::RefreshDegraded);
        assert_eq!(report.request.source, ModeSource::Client);
        assert!(report.workspace.exists());

        let done = coordinator.disconnect().unwrap();
        assert_eq!(done.session_id, Some(report.session_id));
        assert_eq!(done.restored, Some(Mode::new(1920, 1080, 60)));
        assert!(done.workspace_removed);
        assert!(!report.workspace.exists());
        assert_eq!(
            host.screen.lock().unwrap().applied,
            vec![Mode::new(1920, 1080, 90), Mode::new(1920, 1080, 60)]
        );
    }

    #[test]
    fn overrides_and_defaults_come_from_config() {
        let host = Host::provisioned();
        let mut fetcher = Offline;
        let display = DisplayConfig {
            default_mode: "1280x720x60".into(),
            overrides: vec!["1280x720x60=2560x1440x60".into()],
            ..DisplayConfig::default()
        };
        let mut coordinator = host.coordinator(&mut fetcher, display);

        let report = coordinator.connect(|_| None).unwrap();
        assert_eq!(report.request.source, ModeSource::Default);
        let achieved = report.achieved.unwrap();
        assert_eq!(achieved.mode, Mode::new(2560, 1440, 60));
        assert_eq!(achieved.reason, NegotiationReason::OverrideApplied);
    }

    #[test]
    fn unachievable_mode_degrades_and_keeps_log() {
        let host = Host::provisioned();
        let mut fetcher = Offline;
        let mut coordinator = host.coordinator(&mut fetcher, DisplayConfig::default());

        let report = coordinator.connect(client("640", "480", "30")).unwrap();
        assert_eq!(report.achieved, None);
        assert!(host.screen.lock().unwrap().applied.is_empty());

        let done = coordinator.disconnect().unwrap();
        assert_eq!(done.restored, None);
        assert!(!done.workspace_removed);
        let log = fs::read_to_string(report.workspace.join("session.log")).unwrap();
        assert!(log.contains("ERROR no achievable mode"));
    }

    #[test]
    fn strict_negotiation_aborts() {
        let host = Host::provisioned();
        let mut fetcher = Offline;
        let display = DisplayConfig {
            strict_negotiation: true,
            ..DisplayConfig::default()
        };
        let mut coordinator = host.coordinator(&mut fetcher, display);

        let err = coordinator.connect(client("640", "480", "30")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoAchievableMode);
        assert_eq!(err.kind().exit_code(), 20);
    }

    #[test]
    fn missing_tool_continues_without_mode_change() {
        let host = Host::provisioned();
        fs::remove_file(host.dir.path().join("tools").join("QRes.exe")).unwrap();
        let mut fetcher = Offline;
        let mut coordinator = host.coordinator(&mut fetcher, DisplayConfig::default());

        let report = coordinator.connect(client("1920", "1080", "60")).unwrap();
        assert_eq!(report.achieved, None);
        assert!(host.screen.lock().unwrap().applied.is_empty());
    }

    #[test]
    fn failed_restore_is_logged_not_raised() {
        let host = Host::provisioned();
        let mut fetcher = Offline;
        let mut coordinator = host.coordinator(&mut fetcher, DisplayConfig::default());

        let report = coordinator.connect(client("2560", "1440", "60")).unwrap();
        assert!(report.achieved.is_some());
        host.screen.lock().unwrap().fail_apply = true;

        let done = coordinator.disconnect().unwrap();
        assert_eq!(done.restored, None);
        assert!(!done.workspace_removed);
        assert!(report.workspace.join("session.log").exists());
    }

    #[test]
    fn refuses_without_settings() {
        let host = Host::provisioned();
        host.store.delete().unwrap();
        let mut fetcher = Offline;
        let mut coordinator = host.coordinator(&mut fetcher, DisplayConfig::default());

        let err = coordinator.connect(|_| None).unwrap_err();
        assert!(matches!(err, SessionError::NotProvisioned));
        assert_eq!(err.kind(), ErrorKind::SessionAbort);
        assert!(!host.sessions().exists());
    }

    #[test]
    fn malformed_override_aborts() {
        let host = Host::provisioned();
        let mut fetcher = Offline;
        let display = DisplayConfig {
            overrides: vec!["1280x720=4k".into()],
            ..DisplayConfig::default()
        };
        let mut coordinator = host.coordinator(&mut fetcher, display);

        let err = coordinator.connect(|_| None).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert_eq!(err.kind().exit_code(), 22);
    }

    #[test]
    fn disconnect_without_session_is_a_no_op() {
        let host = Host::provisioned();
        let mut fetcher = Offline;
        let mut coordinator = host.coordinator(&mut fetcher, DisplayConfig::default());
        let done = coordinator.disconnect().unwrap();
        assert_eq!(done.session_id, None);
    }
}

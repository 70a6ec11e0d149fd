use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// The streaming server whose config and service we manage.
    pub streaming: StreamingConfig,
    /// Virtual display driver package.
    pub driver: DriverConfig,
    /// Mode negotiation and the resolution tool.
    pub display: DisplayConfig,
    /// Install/uninstall transaction tuning.
    pub provision: ProvisionConfig,
    /// Retry policy for downloads.
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Windows service name of the streaming server.
    pub service_name: String,
    /// Path to the streaming server's line-oriented `key = value` config.
    pub config_path: PathBuf,
    /// Enabling directive written on install. `None` means derive one from
    /// the running executable's path.
    pub directive: Option<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            service_name: "SunshineService".into(),
            config_path: PathBuf::from(r"C:\Program Files\Sunshine\config\sunshine.conf"),
            directive: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Driver package descriptor (`.inf`). Overridden by `--driver-package`.
    pub package_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Mode used when the client does not declare one, as `WxHxR`.
    pub default_mode: String,
    /// Ordered `WxHxR=WxHxR` rewrite rules; first match wins.
    pub overrides: Vec<String>,
    /// Abort connect instead of continuing when no mode is achievable.
    pub strict_negotiation: bool,
    /// The auxiliary resolution-control tool.
    pub tool: ToolConfig,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            default_mode: "1920x1080x60".into(),
            overrides: Vec::new(),
            strict_negotiation: false,
            tool: ToolConfig::default(),
        }
    }
}

/// Where to get the resolution tool and how to drive it.
///
/// Argument templates accept `{display}`, `{width}`, `{height}` and
/// `{refresh}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Download source. Without one, only an already-cached copy is used.
    pub url: Option<String>,
    /// File name inside the tool cache.
    pub file_name: String,
    /// Expected SHA-256 of the download, hex. `None` caches by file name only.
    pub sha256: Option<String>,
    pub list_modes_args: Vec<String>,
    pub current_mode_args: Vec<String>,
    pub set_mode_args: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            url: None,
            file_name: "QRes.exe".into(),
            sha256: None,
            list_modes_args: vec!["/L".into()],
            current_mode_args: vec!["/S".into()],
            set_mode_args: vec![
                "/X:{width}".into(),
                "/Y:{height}".into(),
                "/R:{refresh}".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// How long to wait for the service to reach a stopped or running state.
    pub service_timeout_secs: u64,
    /// Service state polling interval while waiting.
    pub service_poll_ms: u64,
    /// `host:port` probed with a TCP connect to check network reachability.
    pub connectivity_probe: String,
    pub connectivity_timeout_secs: u64,
    /// A lock file older than this is considered abandoned.
    pub stale_lock_secs: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            service_timeout_secs: 30,
            service_poll_ms: 500,
            connectivity_probe: "github.com:443".into(),
            connectivity_timeout_secs: 5,
            stale_lock_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay_ms: u64,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 2000,
            timeout_secs: 30,
        }
    }
}

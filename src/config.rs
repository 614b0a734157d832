use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lower bound on the polling interval, regardless of what the settings ask for.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Top-level configuration loaded from sizeguard.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct SizeguardConfig {
    pub monitor: MonitorConfig,
    pub scheduler: SchedulerConfig,
    pub job: JobConfig,
}

/// Global resource ceilings. A limit of 0 disables that check.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub max_log_bytes: u64,
    pub max_workspace_bytes: u64,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_ticks: usize,
}

/// Paths used by the command-line host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub log_file: PathBuf,
    pub workspace: PathBuf,
    pub report_file: Option<PathBuf>,
    /// Seconds an aborted job gets to exit after SIGTERM before SIGKILL.
    pub kill_grace_secs: u64,
}

// --- Default implementations ---

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_log_bytes: 10 * 1024 * 1024,
            max_workspace_bytes: 0,
            check_interval_secs: 60,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ticks: 8,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("sizeguard.log"),
            workspace: PathBuf::from("."),
            report_file: None,
            kill_grace_secs: 5,
        }
    }
}

/// Read-only view of the global limits.
///
/// Consulted exactly once per job start; monitors never read it again.
pub trait Settings: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn max_log_bytes(&self) -> u64;
    fn max_workspace_bytes(&self) -> u64;
    fn poll_interval_secs(&self) -> u64;
}

impl Settings for MonitorConfig {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn max_log_bytes(&self) -> u64 {
        self.max_log_bytes
    }

    fn max_workspace_bytes(&self) -> u64 {
        self.max_workspace_bytes
    }

    fn poll_interval_secs(&self) -> u64 {
        self.check_interval_secs
    }
}

/// Immutable snapshot of the limits that apply to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_log_bytes: u64,
    pub max_workspace_bytes: u64,
    pub poll_interval: Duration,
}

impl ResourceLimits {
    /// Snapshot the settings for a starting job.
    ///
    /// Returns `None` when monitoring is disabled or neither limit is set.
    /// The interval is clamped to [`MIN_POLL_INTERVAL`].
    pub fn from_settings(settings: &dyn Settings) -> Option<Self> {
        if !settings.is_enabled() {
            return None;
        }
        let limits = Self {
            max_log_bytes: settings.max_log_bytes(),
            max_workspace_bytes: settings.max_workspace_bytes(),
            poll_interval: Duration::from_secs(settings.poll_interval_secs())
                .max(MIN_POLL_INTERVAL),
        };
        limits.any_enabled().then_some(limits)
    }

    pub fn log_limit(&self) -> Option<u64> {
        (self.max_log_bytes > 0).then_some(self.max_log_bytes)
    }

    pub fn workspace_limit(&self) -> Option<u64> {
        (self.max_workspace_bytes > 0).then_some(self.max_workspace_bytes)
    }

    pub fn any_enabled(&self) -> bool {
        self.log_limit().is_some() || self.workspace_limit().is_some()
    }
}

/// Errors from loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<SizeguardConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(SizeguardConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

//! Agent configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! [paths]
//! runtime_dir = "/var/lib/ota-agent"
//! versions_dir = "/data/versions"
//! install_root = "/opt/device"
//!
//! [operation]
//! trust_window_hours = 24
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::DeployConfig;
use crate::download::{CheckpointPolicy, DownloaderConfig};
use crate::error::OtaError;

/// Main agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtaConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub deploy: DeploySettings,

    #[serde(default)]
    pub operation: OperationConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub display: DisplayConfig,
}

impl OtaConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, OtaError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OtaError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content).map_err(|e| OtaError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), OtaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| OtaError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), OtaError> {
        let paths = [
            ("paths.runtime_dir", &self.paths.runtime_dir),
            ("paths.versions_dir", &self.paths.versions_dir),
            ("paths.backups_dir", &self.paths.backups_dir),
            ("paths.install_root", &self.paths.install_root),
        ];
        for (name, path) in paths {
            if path.as_os_str().is_empty() {
                return Err(OtaError::Config(format!("{} must not be empty", name)));
            }
        }
        if !self.paths.install_root.is_absolute() {
            return Err(OtaError::Config("paths.install_root must be absolute".into()));
        }
        if self.paths.install_root.starts_with(&self.paths.versions_dir) {
            return Err(OtaError::Config(
                "paths.install_root must not live inside paths.versions_dir".into(),
            ));
        }

        let timeouts = [
            ("network.connect_timeout_seconds", self.network.connect_timeout_seconds),
            ("network.read_timeout_seconds", self.network.read_timeout_seconds),
            ("deploy.stop_timeout_seconds", self.deploy.stop_timeout_seconds),
            ("deploy.start_timeout_seconds", self.deploy.start_timeout_seconds),
            ("deploy.health_poll_interval_ms", self.deploy.health_poll_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(OtaError::Config(format!("{} must be greater than zero", name)));
            }
        }

        if self.network.checkpoint_percent > 100 {
            return Err(OtaError::Config(
                "network.checkpoint_percent must be at most 100".into(),
            ));
        }
        if self.operation.trust_window_hours <= 0 {
            return Err(OtaError::Config(
                "operation.trust_window_hours must be positive".into(),
            ));
        }
        if let Some(url) = &self.notify.url {
            reqwest::Url::parse(url)
                .map_err(|e| OtaError::Config(format!("notify.url is invalid: {}", e)))?;
        }
        Ok(())
    }

    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig {
            connect_timeout: Duration::from_secs(self.network.connect_timeout_seconds),
            read_timeout: Duration::from_secs(self.network.read_timeout_seconds),
            max_retries: self.network.max_retries,
            retry_base_delay: Duration::from_millis(self.network.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.network.retry_max_delay_ms),
            checkpoint: CheckpointPolicy {
                percent_step: self.network.checkpoint_percent,
                byte_step: self.network.checkpoint_bytes,
            },
            user_agent: self.network.user_agent.clone(),
        }
    }

    pub fn deploy_config(&self) -> DeployConfig {
        DeployConfig {
            versions_dir: self.paths.versions_dir.clone(),
            backups_dir: self.paths.backups_dir.clone(),
            install_root: self.paths.install_root.clone(),
            stop_timeout: Duration::from_secs(self.deploy.stop_timeout_seconds),
            start_timeout: Duration::from_secs(self.deploy.start_timeout_seconds),
            max_snapshots: self.deploy.max_snapshots,
        }
    }

    pub fn trust_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.operation.trust_window_hours)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.operation.settle_delay_ms)
    }
}

/// On-disk locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// State record, downloads and install staging
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Snapshots and the `current`/`previous`/`factory` pointers
    #[serde(default = "default_versions_dir")]
    pub versions_dir: PathBuf,

    /// Backup journal for files replaced outside the install root
    #[serde(default = "default_backups_dir")]
    pub backups_dir: PathBuf,

    /// Directory modules are installed under; resolves through `current`
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            versions_dir: default_versions_dir(),
            backups_dir: default_backups_dir(),
            install_root: default_install_root(),
        }
    }
}

impl PathsConfig {
    /// Directory downloaded artifacts are written to.
    pub fn downloads_dir(&self) -> PathBuf {
        self.runtime_dir.join("downloads")
    }

    /// Directory artifacts are unpacked into before deployment.
    pub fn staging_dir(&self) -> PathBuf {
        self.runtime_dir.join("staging")
    }
}

/// Download settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Maximum silence between two chunks
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// In-process retries of transport failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Persist download progress every N percent
    #[serde(default = "default_checkpoint_percent")]
    pub checkpoint_percent: u8,

    /// ...or every N bytes, whichever comes first
    #[serde(default = "default_checkpoint_bytes")]
    pub checkpoint_bytes: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            read_timeout_seconds: default_read_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            checkpoint_percent: default_checkpoint_percent(),
            checkpoint_bytes: default_checkpoint_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

/// Deployment and service control settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploySettings {
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,

    /// Time a service has to become active before it counts as unhealthy
    #[serde(default = "default_start_timeout")]
    pub start_timeout_seconds: u64,

    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,

    /// Use `systemctl --user`
    #[serde(default)]
    pub systemd_user: bool,

    /// Unreferenced snapshots to keep after a deploy
    #[serde(default)]
    pub max_snapshots: usize,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            stop_timeout_seconds: default_stop_timeout(),
            start_timeout_seconds: default_start_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            systemd_user: false,
            max_snapshots: 0,
        }
    }
}

/// State machine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    /// How long a verified package may wait for installation
    #[serde(default = "default_trust_window")]
    pub trust_window_hours: i64,

    /// How long `success`/`failed` stay visible before returning to idle
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Resume an interrupted download at startup without waiting for the
    /// command to be re-issued
    #[serde(default = "default_true")]
    pub auto_resume: bool,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            trust_window_hours: default_trust_window(),
            settle_delay_ms: default_settle_delay(),
            auto_resume: true,
            listen_addr: default_listen_addr(),
        }
    }
}

/// External status sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Endpoint that receives progress snapshots (disabled when unset)
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_notify_timeout")]
    pub timeout_ms: u64,

    /// Events buffered before new ones are dropped
    #[serde(default = "default_notify_queue")]
    pub queue_size: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_notify_timeout(),
            queue_size: default_notify_queue(),
        }
    }
}

/// Optional progress display process started during installs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub command: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,
}

// Default value functions for serde
fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/var/lib/ota-agent")
}

fn default_versions_dir() -> PathBuf {
    PathBuf::from("/var/lib/ota-agent/versions")
}

fn default_backups_dir() -> PathBuf {
    PathBuf::from("/var/lib/ota-agent/backups")
}

fn default_install_root() -> PathBuf {
    PathBuf::from("/opt/device")
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    2_000
}

fn default_retry_max_delay() -> u64 {
    60_000
}

fn default_checkpoint_percent() -> u8 {
    5
}

fn default_checkpoint_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_user_agent() -> String {
    format!("ota-agent/{}", env!("CARGO_PKG_VERSION"))
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_start_timeout() -> u64 {
    60
}

fn default_health_poll_interval() -> u64 {
    500
}

fn default_trust_window() -> i64 {
    24
}

fn default_settle_delay() -> u64 {
    3_000
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8470))
}

fn default_notify_timeout() -> u64 {
    2_000
}

fn default_notify_queue() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = OtaConfig::default();
        assert_eq!(config.operation.trust_window_hours, 24);
        assert_eq!(config.network.checkpoint_percent, 5);
        assert_eq!(config.network.max_retries, 3);
        assert!(config.operation.auto_resume);
        assert!(config.notify.url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: OtaConfig = toml::from_str("").unwrap();
        assert_eq!(config, OtaConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config: OtaConfig = toml::from_str(
            r#"
            [paths]
            install_root = "/srv/device"

            [deploy]
            start_timeout_seconds = 5
            systemd_user = true
            "#,
        )
        .unwrap();
        assert_eq!(config.paths.install_root, PathBuf::from("/srv/device"));
        assert_eq!(config.deploy.start_timeout_seconds, 5);
        assert!(config.deploy.systemd_user);
        assert_eq!(config.deploy.stop_timeout_seconds, 30);
        assert_eq!(config.deploy_config().start_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf/agent.toml");
        let mut config = OtaConfig::default();
        config.notify.url = Some("http://monitor.local/ota".into());
        config.save_to_file(&path).unwrap();

        let loaded = OtaConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OtaConfig::default();
        config.paths.install_root = PathBuf::from("relative/root");
        assert!(matches!(config.validate(), Err(OtaError::Config(_))));

        let mut config = OtaConfig::default();
        config.deploy.start_timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = OtaConfig::default();
        config.notify.url = Some("not a url".into());
        assert!(config.validate().is_err());

        let mut config = OtaConfig::default();
        config.paths.install_root = config.paths.versions_dir.join("current");
        assert!(config.validate().is_err());
    }
}

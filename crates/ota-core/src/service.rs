//! Service lifecycle control.
//!
//! [`ServiceController`] stops and starts OS services around a deployment and
//! polls their status until the requested state is reached or a timeout
//! expires. It never retries; retry and rollback policy belongs to the
//! deploy engine.
//!
//! The host service manager is abstracted behind [`ServiceBackend`].
//! [`SystemdBackend`] drives `systemctl`; [`ScriptedBackend`] is an in-memory
//! stand-in used by tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::OtaError;

/// Default interval between status polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Observed status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    Active,
    Inactive,
    Failed,
    Unknown,
}

impl ServiceStatus {
    /// Map `systemctl is-active` output to a status.
    ///
    /// Transitional states (`activating`, `deactivating`, `reloading`) are
    /// reported as `Unknown` so that waiters keep polling.
    pub fn from_systemd(s: &str) -> Self {
        match s.trim() {
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Whether the service is not running.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Inactive | Self::Failed)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Primitive operations of a host service manager.
///
/// Requests return as soon as the manager has accepted them; the controller
/// does the waiting.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Ask the manager to stop a service. Must succeed for unknown or
    /// already-stopped services.
    async fn request_stop(&self, name: &str) -> Result<(), String>;

    /// Ask the manager to start a service.
    async fn request_start(&self, name: &str) -> Result<(), String>;

    /// Current status of a service.
    async fn query_status(&self, name: &str) -> Result<ServiceStatus, String>;
}

/// Stops, starts and waits on services with bounded timeouts.
#[derive(Clone)]
pub struct ServiceController {
    backend: Arc<dyn ServiceBackend>,
    poll_interval: Duration,
}

impl ServiceController {
    pub fn new(backend: Arc<dyn ServiceBackend>) -> Self {
        Self {
            backend,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Stop a service and wait until it is inactive.
    ///
    /// Tolerates services that are already stopped.
    ///
    /// # Errors
    ///
    /// [`OtaError::ServiceStopFailed`] if the request is refused or the
    /// service is still running when `timeout` expires.
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<(), OtaError> {
        if self.status(name).await.is_stopped() {
            debug!("Service {} already stopped", name);
            return Ok(());
        }

        info!("Stopping service {}", name);
        self.backend
            .request_stop(name)
            .await
            .map_err(|reason| OtaError::ServiceStopFailed {
                service: name.to_string(),
                reason,
            })?;

        match self.wait_until(name, timeout, ServiceStatus::is_stopped).await {
            Ok(_) => {
                debug!("Service {} stopped", name);
                Ok(())
            }
            Err(last) => Err(OtaError::ServiceStopFailed {
                service: name.to_string(),
                reason: format!("still {} after {:?}", last, timeout),
            }),
        }
    }

    /// Start a service and wait until it is active.
    ///
    /// # Errors
    ///
    /// [`OtaError::ServiceStartFailed`] if the request is refused, the
    /// service fails, or it is not active when `timeout` expires.
    ///
    /// A unit that was already `failed` can keep reporting `failed` until the
    /// queued start job runs, so that state only counts once the unit has
    /// been seen in any other state since the request.
    pub async fn start(&self, name: &str, timeout: Duration) -> Result<(), OtaError> {
        let mut stale_failure = self.status(name).await == ServiceStatus::Failed;

        info!("Starting service {}", name);
        self.backend
            .request_start(name)
            .await
            .map_err(|reason| OtaError::ServiceStartFailed {
                service: name.to_string(),
                reason,
            })?;

        match self
            .wait_until(name, timeout, |s| match s {
                ServiceStatus::Active => true,
                ServiceStatus::Failed => !stale_failure,
                _ => {
                    stale_failure = false;
                    false
                }
            })
            .await
        {
            Ok(ServiceStatus::Active) => {
                debug!("Service {} active", name);
                Ok(())
            }
            Ok(last) => Err(OtaError::ServiceStartFailed {
                service: name.to_string(),
                reason: format!("entered {} state", last),
            }),
            Err(last) => Err(OtaError::ServiceStartFailed {
                service: name.to_string(),
                reason: format!("{} after {:?}", last, timeout),
            }),
        }
    }

    /// Current status. Query failures are logged and reported as `Unknown`.
    pub async fn status(&self, name: &str) -> ServiceStatus {
        match self.backend.query_status(name).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to query status of {}: {}", name, e);
                ServiceStatus::Unknown
            }
        }
    }

    /// Poll until the service reports `target` or `timeout` expires.
    pub async fn wait_for_status(
        &self,
        name: &str,
        target: ServiceStatus,
        timeout: Duration,
    ) -> Result<(), OtaError> {
        self.wait_until(name, timeout, |s| *s == target)
            .await
            .map(|_| ())
            .map_err(|last| OtaError::ServiceWaitTimeout {
                service: name.to_string(),
                target,
                last,
            })
    }

    /// Poll until `accept` returns true. On timeout returns the last status seen.
    async fn wait_until<F>(
        &self,
        name: &str,
        timeout: Duration,
        mut accept: F,
    ) -> Result<ServiceStatus, ServiceStatus>
    where
        F: FnMut(&ServiceStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status(name).await;
            if accept(&status) {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(status);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

/// `systemctl`-based backend.
#[derive(Debug, Clone, Default)]
pub struct SystemdBackend {
    /// Use `systemctl --user` instead of the system manager.
    user_mode: bool,
}

impl SystemdBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_mode(mut self, user_mode: bool) -> Self {
        self.user_mode = user_mode;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("systemctl");
        if self.user_mode {
            cmd.arg("--user");
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ServiceBackend for SystemdBackend {
    async fn request_stop(&self, name: &str) -> Result<(), String> {
        let output = self
            .command()
            .args(["stop", "--no-block", name])
            .output()
            .await
            .map_err(|e| format!("failed to execute systemctl: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not loaded") || stderr.contains("not found") {
                debug!("Service {} not found or not loaded", name);
                return Ok(());
            }
            return Err(format!("systemctl stop failed: {}", stderr.trim()));
        }
        Ok(())
    }

    async fn request_start(&self, name: &str) -> Result<(), String> {
        // Clear a failed state left by an earlier attempt so the next
        // is-active reflects this start.
        match self.command().args(["reset-failed", name]).output().await {
            Ok(output) if !output.status.success() => debug!(
                "systemctl reset-failed {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(_) => {}
            Err(e) => debug!("Failed to execute systemctl reset-failed: {}", e),
        }

        let output = self
            .command()
            .args(["start", "--no-block", name])
            .output()
            .await
            .map_err(|e| format!("failed to execute systemctl: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("systemctl start failed: {}", stderr.trim()));
        }
        Ok(())
    }

    async fn query_status(&self, name: &str) -> Result<ServiceStatus, String> {
        // is-active exits non-zero for anything but "active"; stdout still
        // carries the state.
        let output = self
            .command()
            .args(["is-active", name])
            .output()
            .await
            .map_err(|e| format!("failed to execute systemctl: {}", e))?;

        Ok(ServiceStatus::from_systemd(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// In-memory service manager with scriptable failures.
///
/// Services start `Inactive` unless seeded. A start request reports the
/// transitional state (`Unknown`) to the next status query and then settles;
/// scheduled start failures settle in `Failed`. Every request is appended to
/// a call log.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    inner: Mutex<ScriptedState>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    statuses: HashMap<String, ServiceStatus>,
    failing_starts: HashMap<String, u32>,
    refuse_stop: HashMap<String, bool>,
    activating: HashSet<String>,
    calls: Vec<String>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a service with a status.
    pub fn with_service(self, name: &str, status: ServiceStatus) -> Self {
        self.lock().statuses.insert(name.to_string(), status);
        self
    }

    /// Make the next `count` starts of `name` end in `Failed`.
    pub fn fail_next_starts(&self, name: &str, count: u32) {
        *self.lock().failing_starts.entry(name.to_string()).or_default() += count;
    }

    /// Make stop requests for `name` hang (the service stays active).
    pub fn refuse_stops(&self, name: &str) {
        self.lock().refuse_stop.insert(name.to_string(), true);
    }

    /// Requests seen so far, as `"stop:<name>"` / `"start:<name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn status_of(&self, name: &str) -> ServiceStatus {
        self.lock()
            .statuses
            .get(name)
            .copied()
            .unwrap_or(ServiceStatus::Inactive)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ServiceBackend for ScriptedBackend {
    async fn request_stop(&self, name: &str) -> Result<(), String> {
        let mut state = self.lock();
        state.calls.push(format!("stop:{}", name));
        state.activating.remove(name);
        if state.refuse_stop.get(name).copied().unwrap_or(false) {
            return Ok(());
        }
        state.statuses.insert(name.to_string(), ServiceStatus::Inactive);
        Ok(())
    }

    async fn request_start(&self, name: &str) -> Result<(), String> {
        let mut state = self.lock();
        state.calls.push(format!("start:{}", name));
        let failing = state.failing_starts.entry(name.to_string()).or_default();
        let status = if *failing > 0 {
            *failing -= 1;
            ServiceStatus::Failed
        } else {
            ServiceStatus::Active
        };
        state.statuses.insert(name.to_string(), status);
        state.activating.insert(name.to_string());
        Ok(())
    }

    async fn query_status(&self, name: &str) -> Result<ServiceStatus, String> {
        if self.lock().activating.remove(name) {
            return Ok(ServiceStatus::Unknown);
        }
        Ok(self.status_of(name))
    }
}

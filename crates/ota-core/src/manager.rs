//! OTA manager - the operation state machine.
//!
//! Owns the single in-memory [`OperationState`] and the persisted
//! [`StateRecord`], accepts download/install commands, and runs each
//! operation as one supervised background task:
//!
//! ```text
//! idle -> downloading -> verifying -> toInstall -> installing -> success
//!              |             |            |             |
//!              +-------------+------------+-------------+-----> failed
//! ```
//!
//! `success` and `failed` return to `idle` after the settle delay, except for
//! a fatal rollback failure which stays until acknowledged.
//!
//! Command handlers only validate, transition and spawn; progress queries
//! read a mutex-guarded snapshot and never wait on the running operation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archive::ArtifactUnpacker;
use crate::checksum::parse_digest;
use crate::clock::{Clock, SystemClock};
use crate::config::OtaConfig;
use crate::deploy::{DeployEngine, DeployPhase, DeployReport, Recovery};
use crate::display::ProgressDisplay;
use crate::download::{DownloadProgress, Downloader, FetchObserver, FetchRequest};
use crate::error::{ErrorInfo, OtaError};
use crate::manifest::is_plain_file_name;
use crate::notify::{HttpStatusSink, NullStatusSink, StatusSink};
use crate::record::{StateRecord, StateStore};
use crate::service::{ServiceBackend, ServiceController, SystemdBackend};
use crate::shutdown::ShutdownSignal;
use crate::state::{percent, OperationState, Stage};

/// Download progress is published to the status sink in steps of this size.
const PUBLISH_STEP_PERCENT: u8 = 5;

/// Start (or resume) downloading an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCommand {
    pub version: String,
    #[serde(alias = "sourceURL")]
    pub source_url: String,
    pub artifact_name: String,
    pub declared_size: u64,
    pub expected_checksum: String,
}

/// Install the verified artifact of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallCommand {
    pub version: String,
}

/// How an accepted command was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandAck {
    /// A new operation was started.
    Started,
    /// An interrupted download of the same target was resumed.
    Resumed,
    /// The same operation is already running; nothing was changed.
    AlreadyRunning,
    /// The same artifact is already verified and waiting for install.
    AlreadyStaged,
}

impl CommandAck {
    /// Whether the command started new work.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Started | Self::Resumed)
    }
}

struct Machine {
    op: OperationState,
    /// In-memory mirror of the persisted record.
    target: Option<StateRecord>,
    /// Bumped on every operation start and terminal transition; stale
    /// callbacks and settle timers compare against it.
    generation: u64,
    /// Unacknowledged fatal rollback failure.
    fatal: Option<ErrorInfo>,
    ready: bool,
}

struct Inner {
    config: OtaConfig,
    store: StateStore,
    downloader: Downloader,
    deployer: DeployEngine,
    unpacker: ArtifactUnpacker,
    display: ProgressDisplay,
    sink: Arc<dyn StatusSink>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
    machine: Mutex<Machine>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`OtaManager`].
pub struct OtaManagerBuilder {
    config: OtaConfig,
    clock: Option<Arc<dyn Clock>>,
    backend: Option<Arc<dyn ServiceBackend>>,
    sink: Option<Arc<dyn StatusSink>>,
    shutdown: Option<ShutdownSignal>,
}

impl OtaManagerBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Service manager backend; defaults to systemd.
    pub fn with_service_backend(mut self, backend: Arc<dyn ServiceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Status sink; defaults to HTTP when `notify.url` is set, else none.
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the manager. Must be called inside a Tokio runtime when the
    /// HTTP status sink is configured.
    pub fn build(self) -> Result<OtaManager, OtaError> {
        let config = self.config;
        config.validate()?;

        let backend = self.backend.unwrap_or_else(|| {
            Arc::new(SystemdBackend::new().with_user_mode(config.deploy.systemd_user))
        });
        let services = ServiceController::new(backend).with_poll_interval(
            std::time::Duration::from_millis(config.deploy.health_poll_interval_ms),
        );

        let sink: Arc<dyn StatusSink> = match (self.sink, &config.notify.url) {
            (Some(sink), _) => sink,
            (None, Some(url)) => Arc::new(HttpStatusSink::spawn(
                url,
                std::time::Duration::from_millis(config.notify.timeout_ms),
                config.notify.queue_size,
            )?),
            (None, None) => Arc::new(NullStatusSink),
        };

        let inner = Inner {
            store: StateStore::new(&config.paths.runtime_dir),
            downloader: Downloader::with_config(config.downloader_config())?,
            deployer: DeployEngine::new(config.deploy_config(), services),
            unpacker: ArtifactUnpacker::new(),
            display: ProgressDisplay::new(config.display.command.clone(), config.display.args.clone()),
            sink,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            shutdown: self.shutdown.unwrap_or_else(ShutdownSignal::never),
            machine: Mutex::new(Machine {
                op: OperationState::idle(),
                target: None,
                generation: 0,
                fatal: None,
                ready: false,
            }),
            worker: Mutex::new(None),
            config,
        };
        Ok(OtaManager {
            inner: Arc::new(inner),
        })
    }
}

/// Handle to the state machine. Cheap to clone.
#[derive(Clone)]
pub struct OtaManager {
    inner: Arc<Inner>,
}

impl OtaManager {
    pub fn builder(config: OtaConfig) -> OtaManagerBuilder {
        OtaManagerBuilder {
            config,
            clock: None,
            backend: None,
            sink: None,
            shutdown: None,
        }
    }

    pub fn config(&self) -> &OtaConfig {
        &self.inner.config
    }

    pub fn deployer(&self) -> &DeployEngine {
        &self.inner.deployer
    }

    /// Startup self-healing. Must complete before commands are accepted.
    ///
    /// Settles any interrupted deployment, then inspects the persisted
    /// record: an interrupted download is resumed (or kept for resumption),
    /// a record caught mid-verification or mid-install is discarded, and a
    /// verified package is kept only while it is inside the trust window.
    pub async fn start(&self) -> Result<(), OtaError> {
        let inner = &self.inner;
        for dir in [inner.config.paths.downloads_dir(), inner.config.paths.runtime_dir.clone()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        inner.deployer.init()?;
        let fatal = match inner.deployer.recover().await {
            Ok(Recovery::Clean) => None,
            Ok(Recovery::KeptActivated) => {
                info!("Recovered interrupted deploy: new version kept");
                None
            }
            Ok(Recovery::Restored) => {
                info!("Recovered interrupted deploy: prior files restored");
                None
            }
            Ok(Recovery::RolledBack(level)) => {
                warn!("Recovered interrupted deploy: new version was unhealthy, rolled back to {}", level);
                None
            }
            Err(e) if e.is_fatal() => {
                error!("Interrupted deploy could not be recovered: {}", e);
                Some(e)
            }
            Err(e) => return Err(e),
        };
        remove_dir_if_exists(&inner.config.paths.staging_dir()).await;

        let record = inner.store.load().await?;
        let mut resume = match record {
            None => None,
            Some(record) => self.heal(record).await?,
        };

        {
            let mut m = self.lock();
            if let Some(e) = &fatal {
                // Blocks commands until acknowledged; a pending download is
                // kept so the same command resumes it afterwards.
                if let Some(record) = resume.take() {
                    m.target = Some(record);
                }
                m.fatal = Some(ErrorInfo::from(e));
                m.op = OperationState::failed(e);
            }
            m.ready = true;
        }
        if let Some(record) = resume {
            info!(version = %record.version, "Resuming interrupted download from byte {}", record.bytes_downloaded);
            self.begin_download(record, CommandAck::Resumed);
        }
        Ok(())
    }

    /// Decide what to do with a record found at startup. Returns a record
    /// whose download should be resumed right away.
    async fn heal(&self, record: StateRecord) -> Result<Option<StateRecord>, OtaError> {
        let inner = &self.inner;
        let artifact = self.artifact_path(&record);
        match record.stage {
            Stage::Downloading => {
                if record.bytes_downloaded > 0 && !artifact.exists() {
                    warn!("Partial artifact {:?} is gone; download restarts from zero", artifact);
                }
                if inner.config.operation.auto_resume {
                    return Ok(Some(record));
                }
                let mut m = self.lock();
                m.op.message = format!(
                    "interrupted download of {} can be resumed ({} of {} bytes)",
                    record.version, record.bytes_downloaded, record.declared_size
                );
                m.target = Some(record);
            }
            Stage::ToInstall => {
                let now = inner.clock.now();
                let size_ok = tokio::fs::metadata(&artifact)
                    .await
                    .map(|m| m.len() == record.declared_size)
                    .unwrap_or(false);
                if size_ok && record.within_trust_window(now, inner.config.trust_window()) {
                    info!(version = %record.version, "Verified package is ready to install");
                    let mut m = self.lock();
                    m.op = OperationState::new(
                        Stage::ToInstall,
                        100,
                        format!("version {} verified, ready to install", record.version),
                    );
                    m.target = Some(record);
                } else {
                    warn!(version = %record.version, "Discarding stale or missing verified package");
                    self.discard(&record).await;
                }
            }
            Stage::Verifying => {
                warn!(version = %record.version, "Verification was interrupted; discarding artifact");
                self.discard(&record).await;
            }
            Stage::Installing => {
                warn!(version = %record.version, "Install was interrupted; discarding artifact");
                self.discard(&record).await;
            }
            Stage::Idle | Stage::Success | Stage::Failed => {
                debug!("Clearing settled state record");
                inner.store.clear().await?;
            }
        }
        Ok(None)
    }

    /// Current operation state.
    pub fn progress(&self) -> OperationState {
        self.lock().op.clone()
    }

    /// Handle a download command.
    ///
    /// # Errors
    ///
    /// - [`OtaError::InvalidRequest`] for a malformed command
    /// - [`OtaError::Conflict`] while a different operation is running
    /// - [`OtaError::ManualInterventionRequired`] after an unacknowledged
    ///   fatal rollback failure
    pub fn start_download(&self, cmd: DownloadCommand) -> Result<CommandAck, OtaError> {
        let checksum = validate_download(&cmd)?;
        let now = self.inner.clock.now();

        let (record, ack, stale) = {
            let mut m = self.lock();
            self.check_accepting(&m)?;

            let same = |r: &StateRecord| r.same_target(&cmd.version, &cmd.source_url, &checksum);
            match m.op.stage {
                Stage::Downloading | Stage::Verifying => {
                    return match &m.target {
                        Some(t) if same(t) => Ok(CommandAck::AlreadyRunning),
                        _ => Err(conflict(&m)),
                    };
                }
                Stage::Installing => return Err(conflict(&m)),
                Stage::ToInstall => {
                    if m.target.as_ref().is_some_and(same) {
                        return Ok(CommandAck::AlreadyStaged);
                    }
                }
                Stage::Idle | Stage::Success | Stage::Failed => {}
            }

            let (resume_from, stale) = match m.target.take() {
                Some(t) if t.stage == Stage::Downloading && same(&t) => (t.bytes_downloaded, None),
                other => (0, other),
            };
            let record = StateRecord {
                version: cmd.version.clone(),
                source_url: cmd.source_url.clone(),
                artifact_name: cmd.artifact_name.clone(),
                declared_size: cmd.declared_size,
                expected_checksum: checksum,
                bytes_downloaded: resume_from,
                last_update_timestamp: now,
                stage: Stage::Downloading,
                verified_at_timestamp: None,
            };
            let ack = if resume_from > 0 {
                CommandAck::Resumed
            } else {
                CommandAck::Started
            };
            (record, ack, stale)
        };

        if let Some(stale) = stale {
            let old = self.artifact_path(&stale);
            if old != self.artifact_path(&record) {
                remove_file_now(&old);
            }
        }
        self.begin_download(record, ack);
        Ok(ack)
    }

    /// Handle an install command.
    ///
    /// # Errors
    ///
    /// - [`OtaError::PackageExpired`] if the package was verified longer ago
    ///   than the trust window; the artifact is deleted
    /// - [`OtaError::Conflict`] while a download runs or a different version
    ///   is staged
    /// - [`OtaError::InvalidState`] when no verified package exists
    pub fn start_install(&self, cmd: InstallCommand) -> Result<CommandAck, OtaError> {
        let version = Version::parse(cmd.version.trim())
            .map_err(|e| OtaError::InvalidRequest(format!("invalid version: {}", e)))?;
        let now = self.inner.clock.now();

        let decision = {
            let mut m = self.lock();
            self.check_accepting(&m)?;

            match m.op.stage {
                Stage::Installing => {
                    return match &m.target {
                        Some(t) if same_version(&t.version, &version) => Ok(CommandAck::AlreadyRunning),
                        _ => Err(conflict(&m)),
                    };
                }
                Stage::Downloading | Stage::Verifying => return Err(conflict(&m)),
                Stage::ToInstall => {}
                Stage::Idle | Stage::Success | Stage::Failed => {
                    return Err(OtaError::InvalidState(
                        "no verified package is ready to install".into(),
                    ));
                }
            }

            let Some(mut record) = m.target.clone() else {
                return Err(OtaError::InvalidState("no verified package is ready to install".into()));
            };
            if !same_version(&record.version, &version) {
                return Err(OtaError::Conflict {
                    active: format!("version {} is staged for install", record.version),
                });
            }

            let window = self.inner.config.trust_window();
            if !record.within_trust_window(now, window) {
                let age_hours = record
                    .verified_at_timestamp
                    .map(|t| (now - t).num_hours())
                    .unwrap_or(i64::MAX);
                let err = OtaError::PackageExpired {
                    age_hours,
                    window_hours: window.num_hours(),
                };
                warn!(version = %record.version, "{}", err);
                Err((record, m.generation, err))
            } else {
                record.stage = Stage::Installing;
                record.last_update_timestamp = now;
                m.target = Some(record.clone());
                m.generation += 1;
                m.op = OperationState::new(
                    Stage::Installing,
                    0,
                    format!("installing version {}", record.version),
                );
                Ok((record, m.generation, m.op.clone()))
            }
        };

        // The stage is still `toInstall` while the files go, so no new
        // download can claim the artifact path in between.
        let (record, generation, state) = match decision {
            Ok(started) => started,
            Err((record, generation, err)) => {
                remove_file_now(&self.artifact_path(&record));
                remove_file_now(self.inner.store.path());
                self.finish_failed(generation, &err, true);
                return Err(err);
            }
        };

        info!(version = %record.version, "Install started");
        self.inner.sink.publish(&state);
        let manager = self.clone();
        self.spawn_worker(async move { manager.run_install(record, generation).await });
        Ok(CommandAck::Started)
    }

    /// Clear an unacknowledged fatal rollback failure.
    pub fn acknowledge_fatal(&self) -> Result<(), OtaError> {
        let state = {
            let mut m = self.lock();
            let Some(fatal) = m.fatal.take() else {
                return Err(OtaError::InvalidState("no fatal error to acknowledge".into()));
            };
            warn!("Fatal rollback failure acknowledged: {}", fatal.message);
            m.generation += 1;
            m.op = OperationState::idle();
            m.op.clone()
        };
        self.inner.sink.publish(&state);
        Ok(())
    }

    /// Wait for the running operation task, if any, to finish.
    pub async fn join_worker(&self) {
        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Operation supervisor failed: {}", e);
            }
        }
    }

    /// Wait for the operation task to reach a safe point. Call after
    /// triggering the shutdown signal.
    pub async fn shutdown(&self) {
        info!("Waiting for the running operation to reach a safe point");
        self.join_worker().await;
    }

    fn begin_download(&self, record: StateRecord, ack: CommandAck) {
        let (generation, state) = {
            let mut m = self.lock();
            m.generation += 1;
            m.target = Some(record.clone());
            m.op = OperationState::new(
                Stage::Downloading,
                percent(record.bytes_downloaded, record.declared_size),
                format!("downloading version {}", record.version),
            );
            (m.generation, m.op.clone())
        };
        info!(version = %record.version, url = %record.source_url, ?ack, "Download started");
        self.inner.sink.publish(&state);

        let manager = self.clone();
        self.spawn_worker(async move { manager.run_download(record, generation).await });
    }

    async fn run_download(&self, record: StateRecord, generation: u64) {
        let inner = &self.inner;
        if let Err(e) = inner.store.save(&record).await {
            self.finish_failed(generation, &e, true);
            return;
        }

        let checksum = match parse_digest(&record.expected_checksum) {
            Ok(c) => c,
            Err(e) => {
                self.discard(&record).await;
                self.finish_failed(generation, &e, true);
                return;
            }
        };
        let dest = self.artifact_path(&record);
        let request = FetchRequest {
            url: &record.source_url,
            dest: &dest,
            declared_size: record.declared_size,
            expected_checksum: checksum,
            resume_from: record.bytes_downloaded,
        };
        let observer = DownloadObserver {
            manager: self.clone(),
            generation,
            published_step: AtomicU8::new(percent(record.bytes_downloaded, record.declared_size) / PUBLISH_STEP_PERCENT),
        };

        match inner.downloader.fetch(&request, &observer, &inner.shutdown).await {
            Ok(outcome) => {
                let now = inner.clock.now();
                let mut verified = record.clone();
                verified.bytes_downloaded = outcome.bytes_written;
                verified.stage = Stage::ToInstall;
                verified.last_update_timestamp = now;
                verified.verified_at_timestamp = Some(now);
                if let Err(e) = inner.store.save(&verified).await {
                    self.discard(&verified).await;
                    self.finish_failed(generation, &e, true);
                    return;
                }
                info!(version = %verified.version, "Artifact verified, ready to install");
                let message = format!("version {} verified, ready to install", verified.version);
                self.transition(generation, |m| {
                    m.target = Some(verified);
                    m.op = OperationState::new(Stage::ToInstall, 100, message);
                });
            }
            Err(OtaError::Interrupted) => {
                info!(version = %record.version, "Download paused for shutdown");
                self.transition(generation, |m| {
                    if let Some(t) = m.target.as_mut() {
                        t.stage = Stage::Downloading;
                    }
                    m.op = OperationState::new(Stage::Idle, 0, "download interrupted by shutdown");
                });
            }
            Err(e) if e.preserves_progress() => {
                warn!(version = %record.version, "Download failed, progress kept for resume: {}", e);
                self.finish_failed(generation, &e, false);
            }
            Err(e) => {
                error!(version = %record.version, "Download rejected: {}", e);
                self.discard(&record).await;
                self.finish_failed(generation, &e, true);
            }
        }
    }

    async fn run_install(&self, record: StateRecord, generation: u64) {
        let inner = &self.inner;
        let display = inner.display.launch();
        let staging = inner.config.paths.staging_dir().join(&record.version);

        let result = self.install(&record, &staging, generation).await;

        display.close().await;
        remove_dir_if_exists(&staging).await;
        self.discard(&record).await;

        match result {
            Ok(report) => {
                info!(version = %record.version, "Installed snapshot {:?}", report.snapshot);
                let message = format!("version {} installed", record.version);
                let state = self.transition(generation, |m| {
                    m.target = None;
                    m.op = OperationState::new(Stage::Success, 100, message);
                });
                if let Some(generation) = state {
                    self.schedule_settle(generation);
                }
            }
            Err(e) if e.is_fatal() => {
                error!(version = %record.version, "Install failed and could not be rolled back: {}", e);
                self.transition(generation, |m| {
                    m.target = None;
                    m.fatal = Some(ErrorInfo::from(&e));
                    m.op = OperationState::failed(&e);
                });
            }
            Err(e) => {
                error!(version = %record.version, "Install failed: {}", e);
                self.finish_failed(generation, &e, true);
            }
        }
    }

    async fn install(
        &self,
        record: &StateRecord,
        staging: &Path,
        generation: u64,
    ) -> Result<DeployReport, OtaError> {
        let inner = &self.inner;
        inner.store.save(record).await?;

        let artifact = self.artifact_path(record);
        if !artifact.exists() {
            return Err(OtaError::PackageMissing(artifact));
        }

        let manifest = inner.unpacker.unpack(&artifact, staging).await?;
        if !same_version(&record.version, &manifest.version) {
            return Err(OtaError::InvalidManifest(format!(
                "artifact contains version {}, expected {}",
                manifest.version, record.version
            )));
        }

        let on_phase = |phase: DeployPhase| {
            debug!("Install phase: {}", phase.describe());
            self.transition(generation, |m| {
                m.op.progress = phase.progress();
                m.op.message = phase.describe();
            });
        };
        inner.deployer.deploy(&manifest, staging, &on_phase).await
    }

    /// Land in `failed`; `discard_target` drops the in-memory record mirror.
    fn finish_failed(&self, generation: u64, err: &OtaError, discard_target: bool) {
        let state = self.transition(generation, |m| {
            if discard_target {
                m.target = None;
            }
            m.op = OperationState::failed(err);
        });
        if let Some(generation) = state {
            self.schedule_settle(generation);
        }
    }

    /// Apply `f` if `generation` is still current, publish the new state and
    /// return the generation after the change.
    fn transition<F>(&self, generation: u64, f: F) -> Option<u64>
    where
        F: FnOnce(&mut Machine),
    {
        let (state, generation) = {
            let mut m = self.lock();
            if m.generation != generation {
                debug!("Ignoring update from a superseded operation");
                return None;
            }
            let before = m.op.stage;
            f(&mut m);
            if m.op.stage.is_terminal() && before != m.op.stage {
                m.generation += 1;
            }
            (m.op.clone(), m.generation)
        };
        self.inner.sink.publish(&state);
        Some(generation)
    }

    /// Return to idle after the settle delay unless something else happened.
    fn schedule_settle(&self, generation: u64) {
        let manager = self.clone();
        let delay = self.inner.config.settle_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let state = {
                let mut m = manager.lock();
                if m.generation != generation || m.fatal.is_some() || !m.op.stage.is_terminal() {
                    return;
                }
                m.op = OperationState::idle();
                m.op.clone()
            };
            debug!("Operation settled back to idle");
            manager.inner.sink.publish(&state);
        });
    }

    /// Run `fut` as the operation task, turning a panic into a failed state.
    fn spawn_worker<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let manager = self.clone();
        let task = tokio::spawn(fut);
        let supervisor = tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("Operation task died: {}", e);
                let err = OtaError::Internal(format!("operation task failed: {}", e));
                let generation = manager.lock().generation;
                manager.finish_failed(generation, &err, false);
            }
        });
        *self.inner.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(supervisor);
    }

    fn check_accepting(&self, m: &Machine) -> Result<(), OtaError> {
        if !m.ready {
            return Err(OtaError::InvalidState("agent is still starting".into()));
        }
        if let Some(fatal) = &m.fatal {
            return Err(OtaError::ManualInterventionRequired(fatal.message.clone()));
        }
        Ok(())
    }

    /// Delete the artifact and the persisted record.
    async fn discard(&self, record: &StateRecord) {
        let artifact = self.artifact_path(record);
        if let Err(e) = tokio::fs::remove_file(&artifact).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to delete artifact {:?}: {}", artifact, e);
            }
        }
        if let Err(e) = self.inner.store.clear().await {
            warn!("Failed to clear state record: {}", e);
        }
    }

    fn artifact_path(&self, record: &StateRecord) -> PathBuf {
        self.inner.config.paths.downloads_dir().join(&record.artifact_name)
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.inner.machine.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct DownloadObserver {
    manager: OtaManager,
    generation: u64,
    published_step: AtomicU8,
}

#[async_trait]
impl FetchObserver for DownloadObserver {
    fn on_progress(&self, progress: DownloadProgress) {
        let pct = progress.percent();
        let step = pct / PUBLISH_STEP_PERCENT;
        let mut m = self.manager.lock();
        if m.generation != self.generation || m.op.stage != Stage::Downloading {
            return;
        }
        m.op.progress = pct;
        if self.published_step.swap(step, Ordering::Relaxed) != step {
            let state = m.op.clone();
            drop(m);
            self.manager.inner.sink.publish(&state);
        }
    }

    async fn on_checkpoint(&self, bytes_on_disk: u64) -> Result<(), OtaError> {
        let now = self.manager.inner.clock.now();
        let record = {
            let mut m = self.manager.lock();
            if m.generation != self.generation {
                return Ok(());
            }
            let Some(target) = m.target.as_mut() else {
                return Ok(());
            };
            target.bytes_downloaded = bytes_on_disk;
            target.last_update_timestamp = now;
            target.clone()
        };
        self.manager.inner.store.save(&record).await
    }

    async fn on_stream_complete(&self, bytes: u64) {
        let now = self.manager.inner.clock.now();
        let record = {
            let mut m = self.manager.lock();
            if m.generation != self.generation {
                return;
            }
            let Some(target) = m.target.as_mut() else {
                return;
            };
            target.stage = Stage::Verifying;
            target.bytes_downloaded = bytes;
            target.last_update_timestamp = now;
            let record = target.clone();
            m.op = OperationState::new(Stage::Verifying, 100, format!("verifying version {}", record.version));
            let state = m.op.clone();
            drop(m);
            self.manager.inner.sink.publish(&state);
            record
        };
        if let Err(e) = self.manager.inner.store.save(&record).await {
            warn!("Failed to persist verifying stage: {}", e);
        }
    }
}

/// Check a download command and return its normalized checksum.
fn validate_download(cmd: &DownloadCommand) -> Result<String, OtaError> {
    Version::parse(cmd.version.trim())
        .map_err(|e| OtaError::InvalidRequest(format!("invalid version: {}", e)))?;
    let url = reqwest::Url::parse(&cmd.source_url)
        .map_err(|e| OtaError::InvalidRequest(format!("invalid source url: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(OtaError::InvalidRequest(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }
    if !is_plain_file_name(&cmd.artifact_name) {
        return Err(OtaError::InvalidRequest(format!(
            "artifact name must be a plain file name: {}",
            cmd.artifact_name
        )));
    }
    if cmd.declared_size == 0 {
        return Err(OtaError::InvalidRequest("declared size must be positive".into()));
    }
    Ok(hex::encode(parse_digest(&cmd.expected_checksum)?))
}

fn same_version(recorded: &str, version: &Version) -> bool {
    Version::parse(recorded.trim()).is_ok_and(|v| &v == version)
}

fn conflict(m: &Machine) -> OtaError {
    let active = match &m.target {
        Some(t) => format!("{:?} of version {}", m.op.stage, t.version),
        None => format!("{:?}", m.op.stage),
    };
    OtaError::Conflict { active }
}

fn remove_file_now(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to delete {:?}: {}", path, e);
        }
    }
}

async fn remove_dir_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> DownloadCommand {
        DownloadCommand {
            version: "1.2.0".into(),
            source_url: "https://updates.example.com/fw/1.2.0.tar.gz".into(),
            artifact_name: "fw-1.2.0.tar.gz".into(),
            declared_size: 1000,
            expected_checksum: format!("sha256:{}", "AB".repeat(32)),
        }
    }

    #[test]
    fn test_validate_download_normalizes_checksum() {
        assert_eq!(validate_download(&command()).unwrap(), "ab".repeat(32));
    }

    #[test]
    fn test_validate_download_rejects_bad_commands() {
        let mut cmd = command();
        cmd.artifact_name = "../etc/passwd".into();
        assert!(matches!(validate_download(&cmd), Err(OtaError::InvalidRequest(_))));

        let mut cmd = command();
        cmd.source_url = "ftp://updates.example.com/x".into();
        assert!(validate_download(&cmd).is_err());

        let mut cmd = command();
        cmd.declared_size = 0;
        assert!(validate_download(&cmd).is_err());

        let mut cmd = command();
        cmd.version = "latest".into();
        assert!(validate_download(&cmd).is_err());

        let mut cmd = command();
        cmd.expected_checksum = "abc".into();
        assert!(validate_download(&cmd).is_err());
    }

    #[test]
    fn test_command_wire_format() {
        let cmd: DownloadCommand = serde_json::from_str(
            r#"{"version":"1.2.0","sourceURL":"https://x/a","artifactName":"a",
                "declaredSize":10,"expectedChecksum":"00"}"#,
        )
        .unwrap();
        assert_eq!(cmd.source_url, "https://x/a");
        assert_eq!(serde_json::to_string(&CommandAck::AlreadyRunning).unwrap(), "\"alreadyRunning\"");
    }

    #[test]
    fn test_same_version() {
        let v = Version::parse("1.2.0").unwrap();
        assert!(same_version("1.2.0", &v));
        assert!(!same_version("1.2.1", &v));
        assert!(!same_version("garbage", &v));
    }
}

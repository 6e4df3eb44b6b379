//! Version snapshot deployment.
//!
//! Each release is staged into its own directory under `versions_dir`. Three
//! symlinks in the same directory select snapshots:
//!
//! ```text
//! versions_dir/
//! ├── 1.1.0-1704067200/
//! ├── 1.2.0-1704153600/
//! │   ├── bin/app                 # module staged at dst relative to install root
//! │   ├── .external/helper        # module installed outside the install root
//! │   └── .ota-manifest.json
//! ├── factory-1.0.0/              # read-only
//! ├── current  -> 1.2.0-1704153600
//! ├── previous -> 1.1.0-1704067200
//! └── factory  -> factory-1.0.0
//! ```
//!
//! The install root is expected to resolve through `versions_dir/current`
//! (`init` creates that link when the install root does not exist yet), so
//! repointing `current` is the single step that switches the live version.
//!
//! A deploy stages the snapshot under a `.partial` name and renames it into
//! place only once every module is copied, stops services, installs external
//! modules behind a [`BackupJournal`], swaps `current` and restarts services
//! in `restartOrder`. A failure after staging rolls back to the snapshot that
//! was current when the deploy started, and from there to `factory`.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::backup::{remove_if_exists, replace_file, sync_dir, write_atomic, BackupJournal};
use crate::error::{OtaError, RollbackLevel};
use crate::manifest::{Manifest, Placement, MANIFEST_FILE};
use crate::service::ServiceController;

/// Pointer to the active snapshot.
pub const CURRENT: &str = "current";
/// Pointer to the last known-good snapshot.
pub const PREVIOUS: &str = "previous";
/// Pointer to the factory snapshot.
pub const FACTORY: &str = "factory";

/// Manifest copy stored in every snapshot.
pub const SNAPSHOT_MANIFEST: &str = ".ota-manifest.json";

const EXTERNAL_DIR: &str = ".external";
const PARTIAL_SUFFIX: &str = ".partial";

/// Deploy engine settings.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub versions_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub install_root: PathBuf,
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    /// Unreferenced snapshots kept by [`DeployEngine::prune`].
    pub max_snapshots: usize,
}

/// Step a deploy is in, reported to the caller for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Staging,
    StoppingServices,
    Activating,
    StartingServices,
    RollingBack(RollbackLevel),
}

impl DeployPhase {
    /// Rough install progress for this phase.
    pub fn progress(&self) -> u8 {
        match self {
            Self::Staging => 10,
            Self::StoppingServices => 40,
            Self::Activating => 60,
            Self::StartingServices => 80,
            Self::RollingBack(_) => 90,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Staging => "staging snapshot".to_string(),
            Self::StoppingServices => "stopping services".to_string(),
            Self::Activating => "activating snapshot".to_string(),
            Self::StartingServices => "starting services".to_string(),
            Self::RollingBack(level) => format!("rolling back ({})", level),
        }
    }
}

/// Outcome of a successful deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub snapshot: PathBuf,
    pub superseded: Option<PathBuf>,
}

/// What startup recovery found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No interrupted deploy.
    Clean,
    /// `current` had already been switched; the new snapshot was kept.
    KeptActivated,
    /// The deploy stopped before activation; backed-up files were restored.
    Restored,
    /// The switch had happened but the new snapshot did not come up; it was
    /// rolled back to the given tier.
    RolledBack(RollbackLevel),
}

/// Manages snapshots, pointers and rollback.
pub struct DeployEngine {
    config: DeployConfig,
    services: ServiceController,
}

impl DeployEngine {
    pub fn new(config: DeployConfig, services: ServiceController) -> Self {
        Self { config, services }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Create the managed directories and, if missing, the install-root link
    /// to `versions_dir/current`.
    pub fn init(&self) -> Result<(), OtaError> {
        fs::create_dir_all(&self.config.versions_dir)?;
        fs::create_dir_all(&self.config.backups_dir)?;

        let root = &self.config.install_root;
        if fs::symlink_metadata(root).is_err() {
            if let Some(parent) = root.parent() {
                fs::create_dir_all(parent)?;
            }
            symlink(self.pointer_path(CURRENT), root)?;
            info!("Linked install root {:?} to {:?}", root, self.pointer_path(CURRENT));
        }

        if self.factory().is_none() {
            warn!("No factory snapshot provisioned; level 2 rollback is unavailable");
        }
        Ok(())
    }

    /// Snapshot `current` points to.
    pub fn current(&self) -> Option<PathBuf> {
        self.resolve(CURRENT)
    }

    /// Snapshot `previous` points to.
    pub fn previous(&self) -> Option<PathBuf> {
        self.resolve(PREVIOUS)
    }

    /// Snapshot `factory` points to.
    pub fn factory(&self) -> Option<PathBuf> {
        self.resolve(FACTORY)
    }

    /// Install the factory snapshot from an unpacked artifact directory.
    ///
    /// The snapshot is made read-only and `factory` is pointed at it; if no
    /// version is active yet, `current` is pointed at it too and its external
    /// modules are installed. Refuses to replace an existing factory.
    pub async fn provision_factory(&self, artifact_dir: &Path) -> Result<PathBuf, OtaError> {
        if let Some(existing) = self.factory() {
            return Err(OtaError::InvalidState(format!(
                "factory snapshot already provisioned at {}",
                existing.display()
            )));
        }

        let manifest = Manifest::load_from_dir(artifact_dir)?;
        manifest.validate(&self.config.install_root)?;

        let name = format!("factory-{}", manifest.version);
        let snapshot = self.stage(&manifest, artifact_dir, name).await?;
        make_read_only(&snapshot)?;
        self.set_pointer(FACTORY, &snapshot)?;
        info!("Provisioned factory snapshot {:?}", snapshot);

        if self.current().is_none() {
            self.install_externals(&snapshot, &manifest, None)?;
            self.set_pointer(CURRENT, &snapshot)?;
            info!("Activated factory snapshot as current");
        }
        Ok(snapshot)
    }

    /// Deploy the unpacked artifact at `artifact_dir`.
    ///
    /// Staging failures remove the half-built snapshot and leave the live
    /// system untouched. Failures from the service stop onwards trigger
    /// rollback; if it succeeds the error is [`OtaError::RolledBack`], if both
    /// tiers fail it is [`OtaError::RollbackFatal`].
    pub async fn deploy(
        &self,
        manifest: &Manifest,
        artifact_dir: &Path,
        on_phase: &(dyn Fn(DeployPhase) + Send + Sync),
    ) -> Result<DeployReport, OtaError> {
        manifest.validate(&self.config.install_root)?;
        for module in manifest.external_modules(&self.config.install_root) {
            warn!(
                module = %module.name,
                dst = %module.dst.display(),
                "Module installs outside the install root; it is covered by a file backup only"
            );
        }

        on_phase(DeployPhase::Staging);
        let name = self.snapshot_name(manifest);
        let snapshot = self.stage(manifest, artifact_dir, name).await?;

        let prior = self.current();
        let prior_manifest = prior.as_deref().and_then(read_snapshot_manifest);
        let services = union(
            manifest.services(),
            prior_manifest.map(|m| m.services()).unwrap_or_default(),
        );

        let mut journal = match BackupJournal::begin(
            &self.config.backups_dir,
            &snapshot,
            prior.as_deref(),
            services.clone(),
        ) {
            Ok(journal) => journal,
            Err(e) => {
                remove_snapshot(&snapshot);
                return Err(OtaError::Staging(format!("cannot open backup journal: {}", e)));
            }
        };

        match self
            .activate(manifest, &snapshot, &mut journal, &services, on_phase)
            .await
        {
            Ok(()) => {
                // `current` has switched; the deploy stands even if the
                // bookkeeping below fails.
                let mut prunable = true;
                if let Some(prior) = &prior {
                    if let Err(e) = self.set_pointer(PREVIOUS, prior) {
                        warn!("Failed to point previous at {:?}: {}", prior, e);
                        prunable = false;
                    }
                }
                if let Err(e) = journal.clear() {
                    warn!("Failed to clear backup journal: {}", e);
                }
                info!(version = %manifest.version, "Deployed snapshot {:?}", snapshot);
                if prunable {
                    if let Err(e) = self.prune() {
                        warn!("Snapshot pruning failed: {}", e);
                    }
                }
                Ok(DeployReport {
                    snapshot,
                    superseded: prior,
                })
            }
            Err(cause) => {
                error!(version = %manifest.version, "Deployment failed: {}", cause);
                self.recover_from_failed_deploy(cause, &snapshot, prior, journal, &services, on_phase)
                    .await
            }
        }
    }

    /// Point `current` back at `previous` and restart its services.
    pub async fn rollback_to_previous(&self) -> Result<(), OtaError> {
        let target = self.previous().ok_or_else(|| OtaError::RollbackFailed {
            level: RollbackLevel::Previous,
            reason: "no previous snapshot".into(),
        })?;
        let running = self.current_services();
        self.activate_existing(RollbackLevel::Previous, &target, None, &running)
            .await
    }

    /// Point `current` at `factory` and restart its services.
    pub async fn rollback_to_factory(&self) -> Result<(), OtaError> {
        let target = self.factory().ok_or_else(|| OtaError::RollbackFailed {
            level: RollbackLevel::Factory,
            reason: "no factory snapshot".into(),
        })?;
        let running = self.current_services();
        self.activate_existing(RollbackLevel::Factory, &target, None, &running)
            .await
    }

    /// Clean up after a crash. Must run before any deploy.
    ///
    /// Removes half-staged snapshots and stale pointer temp links, then
    /// settles a leftover backup journal. If `current` already points at the
    /// journal's target, the new snapshot's services are started and, when
    /// they all come up, `previous` is pointed at the snapshot it replaced;
    /// when one does not, the deploy is rolled back like a failed one.
    /// Otherwise backed-up files are restored and the services of `current`
    /// are started again.
    ///
    /// # Errors
    ///
    /// [`OtaError::RollbackFatal`] if the kept snapshot is unhealthy and
    /// neither rollback tier recovers.
    pub async fn recover(&self) -> Result<Recovery, OtaError> {
        self.remove_stale_entries()?;

        let Some(journal) = BackupJournal::load(&self.config.backups_dir)? else {
            return Ok(Recovery::Clean);
        };

        let target = journal.target_snapshot().to_path_buf();
        if self.current().as_deref() == Some(target.as_path()) {
            info!("Interrupted deploy had activated {:?}; verifying it", target);
            return self.settle_activated(&target, journal).await;
        }

        warn!("Interrupted deploy of {:?} did not activate; restoring backups", target);
        journal.restore_all()?;
        if !self.is_referenced(&target) {
            remove_snapshot(&target);
        }

        let plan = self
            .current()
            .as_deref()
            .and_then(read_snapshot_manifest)
            .map(|m| m.restart_plan())
            .unwrap_or_default();
        for service in plan {
            if let Err(e) = self.services.start(&service, self.config.start_timeout).await {
                warn!("Service {} did not come back after recovery: {}", service, e);
            }
        }

        journal.clear()?;
        Ok(Recovery::Restored)
    }

    /// Finish a deploy that was interrupted after `current` switched.
    async fn settle_activated(
        &self,
        target: &Path,
        journal: BackupJournal,
    ) -> Result<Recovery, OtaError> {
        let plan = read_snapshot_manifest(target)
            .map(|m| m.restart_plan())
            .unwrap_or_default();
        let mut health = Ok(());
        for service in plan {
            if let Err(e) = self.services.start(&service, self.config.start_timeout).await {
                health = Err(e);
                break;
            }
        }

        let prior = journal
            .prior_snapshot()
            .filter(|p| p.is_dir() && *p != target)
            .map(Path::to_path_buf);

        match health {
            Ok(()) => {
                if let Some(prior) = &prior {
                    self.set_pointer(PREVIOUS, prior)?;
                }
                journal.clear()?;
                info!("Kept interrupted deploy {:?}", target);
                Ok(Recovery::KeptActivated)
            }
            Err(cause) => {
                error!("Interrupted deploy {:?} is unhealthy: {}", target, cause);
                let services = journal.services().to_vec();
                let quiet = |_: DeployPhase| {};
                match self
                    .recover_from_failed_deploy(cause, target, prior, journal, &services, &quiet)
                    .await
                {
                    Err(OtaError::RolledBack { level, .. }) => Ok(Recovery::RolledBack(level)),
                    Err(e) => Err(e),
                    Ok(report) => Err(OtaError::Internal(format!(
                        "rollback of {:?} reported success",
                        report.snapshot
                    ))),
                }
            }
        }
    }

    /// Remove snapshots no pointer references, keeping the newest
    /// `max_snapshots` of them. Returns the removed directories.
    pub fn prune(&self) -> Result<Vec<PathBuf>, OtaError> {
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&self.config.versions_dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !file_type.is_dir() || name.starts_with('.') || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let path = entry.path();
            if self.is_referenced(&path) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            candidates.push((modified, path));
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        let mut removed = Vec::new();
        for (_, path) in candidates.into_iter().skip(self.config.max_snapshots) {
            debug!("Pruning snapshot {:?}", path);
            fs::remove_dir_all(&path)?;
            removed.push(path);
        }
        Ok(removed)
    }

    async fn activate(
        &self,
        manifest: &Manifest,
        snapshot: &Path,
        journal: &mut BackupJournal,
        services: &[String],
        on_phase: &(dyn Fn(DeployPhase) + Send + Sync),
    ) -> Result<(), OtaError> {
        on_phase(DeployPhase::StoppingServices);
        for service in services {
            self.services.stop(service, self.config.stop_timeout).await?;
        }

        on_phase(DeployPhase::Activating);
        self.install_externals(snapshot, manifest, Some(journal))?;
        self.set_pointer(CURRENT, snapshot)?;

        on_phase(DeployPhase::StartingServices);
        for service in manifest.restart_plan() {
            self.services.start(&service, self.config.start_timeout).await?;
        }
        Ok(())
    }

    async fn recover_from_failed_deploy(
        &self,
        cause: OtaError,
        failed: &Path,
        prior: Option<PathBuf>,
        journal: BackupJournal,
        services: &[String],
        on_phase: &(dyn Fn(DeployPhase) + Send + Sync),
    ) -> Result<DeployReport, OtaError> {
        on_phase(DeployPhase::RollingBack(RollbackLevel::Previous));
        let first = match &prior {
            Some(prior) => {
                self.activate_existing(RollbackLevel::Previous, prior, Some(&journal), services)
                    .await
            }
            None => {
                // Nothing was live before; still put back any replaced files.
                journal.restore_all().and(Err(OtaError::RollbackFailed {
                    level: RollbackLevel::Previous,
                    reason: "no previously active snapshot".into(),
                }))
            }
        };

        let result = match first {
            Ok(()) => Err(OtaError::RolledBack {
                level: RollbackLevel::Previous,
                cause: Box::new(cause),
            }),
            Err(first) => {
                error!("Level 1 rollback failed: {}", first);
                on_phase(DeployPhase::RollingBack(RollbackLevel::Factory));
                let second = match self.factory() {
                    Some(factory) => {
                        self.activate_existing(RollbackLevel::Factory, &factory, None, services)
                            .await
                    }
                    None => Err(OtaError::RollbackFailed {
                        level: RollbackLevel::Factory,
                        reason: "no factory snapshot".into(),
                    }),
                };
                match second {
                    Ok(()) => Err(OtaError::RolledBack {
                        level: RollbackLevel::Factory,
                        cause: Box::new(cause),
                    }),
                    Err(second) => {
                        error!("Level 2 rollback failed: {}", second);
                        Err(OtaError::RollbackFatal {
                            deploy: cause.to_string(),
                            previous: first.to_string(),
                            factory: second.to_string(),
                        })
                    }
                }
            }
        };

        if let Err(e) = journal.clear() {
            warn!("Failed to clear backup journal: {}", e);
        }
        if !self.is_referenced(failed) {
            remove_snapshot(failed);
        }
        result
    }

    /// Switch `current` to an existing snapshot and bring its services up.
    ///
    /// With a journal, replaced external files are restored from it; without
    /// one, the target's own external modules are reinstalled.
    async fn activate_existing(
        &self,
        level: RollbackLevel,
        target: &Path,
        journal: Option<&BackupJournal>,
        running: &[String],
    ) -> Result<(), OtaError> {
        info!("Rolling back {} to {:?}", level, target);
        let failed = |reason: String| OtaError::RollbackFailed { level, reason };

        let target_manifest = read_snapshot_manifest(target);
        let target_services = target_manifest
            .as_ref()
            .map(|m| m.services())
            .unwrap_or_default();

        for service in union(running.to_vec(), target_services) {
            if let Err(e) = self.services.stop(&service, self.config.stop_timeout).await {
                warn!("Ignoring stop failure during rollback: {}", e);
            }
        }

        match (journal, &target_manifest) {
            (Some(journal), _) => journal.restore_all().map_err(|e| failed(e.to_string()))?,
            (None, Some(manifest)) => self
                .install_externals(target, manifest, None)
                .map_err(|e| failed(e.to_string()))?,
            (None, None) => {}
        }

        self.set_pointer(CURRENT, target)
            .map_err(|e| failed(e.to_string()))?;

        if let Some(manifest) = &target_manifest {
            for service in manifest.restart_plan() {
                self.services
                    .start(&service, self.config.start_timeout)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
            }
        }
        info!("Rollback {} complete", level);
        Ok(())
    }

    /// Copy every module into a fresh snapshot directory named `name`.
    async fn stage(&self, manifest: &Manifest, artifact_dir: &Path, name: String) -> Result<PathBuf, OtaError> {
        let manifest = manifest.clone();
        let artifact_dir = artifact_dir.to_path_buf();
        let versions_dir = self.config.versions_dir.clone();
        let install_root = self.config.install_root.clone();

        task::spawn_blocking(move || {
            stage_blocking(&manifest, &artifact_dir, &versions_dir, &install_root, &name)
        })
        .await
        .map_err(|e| OtaError::Internal(format!("staging task failed: {}", e)))?
    }

    /// Install external modules from the snapshot's `.external` directory.
    fn install_externals(
        &self,
        snapshot: &Path,
        manifest: &Manifest,
        mut journal: Option<&mut BackupJournal>,
    ) -> Result<(), OtaError> {
        for module in manifest.external_modules(&self.config.install_root) {
            let staged = snapshot.join(EXTERNAL_DIR).join(&module.name);
            if let Some(journal) = journal.as_deref_mut() {
                journal.backup_file(&module.dst)?;
            }
            if let Some(parent) = module.dst.parent() {
                fs::create_dir_all(parent)?;
            }
            replace_file(&staged, &module.dst).map_err(|e| {
                OtaError::Activation(format!(
                    "failed to install {} to {}: {}",
                    module.name,
                    module.dst.display(),
                    e
                ))
            })?;
            debug!("Installed external module {} at {:?}", module.name, module.dst);
        }
        Ok(())
    }

    fn pointer_path(&self, name: &str) -> PathBuf {
        self.config.versions_dir.join(name)
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let target = fs::read_link(self.pointer_path(name)).ok()?;
        let resolved = self.config.versions_dir.join(target.file_name()?);
        resolved.is_dir().then_some(resolved)
    }

    /// Atomically repoint `name` at `snapshot`.
    fn set_pointer(&self, name: &str, snapshot: &Path) -> Result<(), OtaError> {
        let file_name = snapshot
            .file_name()
            .ok_or_else(|| OtaError::Activation(format!("invalid snapshot path {:?}", snapshot)))?;
        let tmp = self.config.versions_dir.join(format!(
            ".{}.tmp-{}",
            name,
            std::process::id()
        ));
        remove_if_exists(&tmp)?;

        let activation = |e: std::io::Error| {
            OtaError::Activation(format!("failed to repoint {} to {:?}: {}", name, file_name, e))
        };
        symlink(file_name, &tmp).map_err(activation)?;
        fs::rename(&tmp, self.pointer_path(name)).map_err(activation)?;
        sync_dir(&tmp);
        debug!("Pointer {} -> {:?}", name, file_name);
        Ok(())
    }

    fn is_referenced(&self, snapshot: &Path) -> bool {
        [CURRENT, PREVIOUS, FACTORY]
            .iter()
            .filter_map(|p| self.resolve(p))
            .any(|p| p == snapshot)
    }

    fn current_services(&self) -> Vec<String> {
        self.current()
            .as_deref()
            .and_then(read_snapshot_manifest)
            .map(|m| m.services())
            .unwrap_or_default()
    }

    fn snapshot_name(&self, manifest: &Manifest) -> String {
        let base = format!("{}-{}", manifest.version, Utc::now().timestamp());
        let mut name = base.clone();
        let mut n = 1;
        while self.config.versions_dir.join(&name).exists() {
            name = format!("{}-{}", base, n);
            n += 1;
        }
        name
    }

    fn remove_stale_entries(&self) -> Result<(), OtaError> {
        let entries = match fs::read_dir(&self.config.versions_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if name.ends_with(PARTIAL_SUFFIX) {
                warn!("Removing half-staged snapshot {:?}", path);
                remove_snapshot(&path);
            } else if name.starts_with('.') && name.contains(".tmp-") {
                debug!("Removing stale pointer temp {:?}", path);
                remove_if_exists(&path)?;
            }
        }
        Ok(())
    }
}

fn stage_blocking(
    manifest: &Manifest,
    artifact_dir: &Path,
    versions_dir: &Path,
    install_root: &Path,
    name: &str,
) -> Result<PathBuf, OtaError> {
    let final_dir = versions_dir.join(name);
    let partial = versions_dir.join(format!("{}{}", name, PARTIAL_SUFFIX));

    let result = (|| -> Result<(), OtaError> {
        if partial.exists() {
            fs::remove_dir_all(&partial)?;
        }
        fs::create_dir_all(&partial)?;

        for module in &manifest.modules {
            let src = artifact_dir.join(&module.src);
            if fs::symlink_metadata(&src).is_err() {
                return Err(OtaError::Staging(format!(
                    "module {} source {} is missing from the artifact",
                    module.name,
                    module.src.display()
                )));
            }
            let dest = match module.placement(install_root) {
                Placement::Snapshot(rel) => partial.join(rel),
                Placement::External => {
                    if !src.is_file() {
                        return Err(OtaError::Staging(format!(
                            "external module {} must be a single file",
                            module.name
                        )));
                    }
                    partial.join(EXTERNAL_DIR).join(&module.name)
                }
            };
            copy_tree(&src, &dest)?;
            debug!("Staged module {} at {:?}", module.name, dest);
        }

        write_atomic(&partial.join(SNAPSHOT_MANIFEST), &manifest.to_json()?)?;
        fs::rename(&partial, &final_dir)?;
        sync_dir(&final_dir);
        Ok(())
    })();

    match result {
        Ok(()) => {
            info!("Staged snapshot {:?}", final_dir);
            Ok(final_dir)
        }
        Err(e) => {
            remove_snapshot(&partial);
            match e {
                OtaError::Staging(_) => Err(e),
                other => Err(OtaError::Staging(other.to_string())),
            }
        }
    }
}

/// Copy a file, symlink or directory tree.
fn copy_tree(src: &Path, dest: &Path) -> Result<(), OtaError> {
    let meta = fs::symlink_metadata(src)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    if meta.file_type().is_symlink() {
        symlink(fs::read_link(src)?, dest)?;
    } else if meta.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dest)?;
    }
    Ok(())
}

/// Strip write permission from every entry of a tree.
fn make_read_only(root: &Path) -> Result<(), OtaError> {
    let meta = fs::symlink_metadata(root)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in fs::read_dir(root)? {
            make_read_only(&entry?.path())?;
        }
    }
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() & !0o222);
    fs::set_permissions(root, perms)?;
    Ok(())
}

fn remove_snapshot(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove snapshot {:?}: {}", path, e);
        }
    }
}

/// Manifest stored alongside a snapshot. Factory snapshots provisioned by
/// hand may carry it as `manifest.json` instead.
pub(crate) fn read_snapshot_manifest(snapshot: &Path) -> Option<Manifest> {
    [SNAPSHOT_MANIFEST, MANIFEST_FILE]
        .iter()
        .find_map(|name| fs::read(snapshot.join(name)).ok())
        .and_then(|bytes| match Manifest::from_json(&bytes) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("Unreadable manifest in snapshot {:?}: {}", snapshot, e);
                None
            }
        })
}

fn union(first: Vec<String>, second: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    first
        .into_iter()
        .chain(second)
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

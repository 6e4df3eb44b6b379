//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use ota_core::{
    BackupJournal, Clock, ManualClock, MemoryStatusSink, OperationState, OtaConfig, OtaManager,
    ScriptedBackend, ServiceStatus, Stage, StateRecord,
};

pub const SERVICE: &str = "app.service";
pub const ARTIFACT: &str = "device-1.1.0.tar.gz";

/// One module of a test artifact.
pub struct Payload<'a> {
    pub name: &'a str,
    pub src: &'a str,
    pub content: &'a [u8],
    /// Absolute destination.
    pub dst: PathBuf,
    pub service: Option<&'a str>,
    pub order: Option<u32>,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn manifest_json(version: &str, payloads: &[Payload<'_>]) -> Vec<u8> {
    let modules: Vec<serde_json::Value> = payloads
        .iter()
        .map(|p| {
            let mut m = serde_json::json!({
                "name": p.name,
                "src": p.src,
                "dst": p.dst,
            });
            if let Some(service) = p.service {
                m["serviceName"] = service.into();
            }
            if let Some(order) = p.order {
                m["restartOrder"] = order.into();
            }
            m
        })
        .collect();
    serde_json::to_vec_pretty(&serde_json::json!({ "version": version, "modules": modules }))
        .unwrap()
}

/// A gzip-compressed tarball holding `manifest.json` and the payloads.
pub fn build_artifact(version: &str, payloads: &[Payload<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut append = |name: &str, data: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    };
    append("manifest.json", &manifest_json(version, payloads));
    for p in payloads {
        append(p.src, p.content);
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// The same content laid out as an unpacked directory.
pub fn write_artifact_dir(dir: &Path, version: &str, payloads: &[Payload<'_>]) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("manifest.json"), manifest_json(version, payloads)).unwrap();
    for p in payloads {
        let path = dir.join(p.src);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, p.content).unwrap();
    }
}

/// Temporary device layout with a scripted service manager and manual clock.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: OtaConfig,
    pub backend: Arc<ScriptedBackend>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<MemoryStatusSink>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        let mut config = OtaConfig::default();
        config.paths.runtime_dir = root.join("run");
        config.paths.versions_dir = root.join("versions");
        config.paths.backups_dir = root.join("backups");
        config.paths.install_root = root.join("opt/device");
        config.network.read_timeout_seconds = 5;
        config.network.max_retries = 1;
        config.network.retry_base_delay_ms = 10;
        config.network.retry_max_delay_ms = 20;
        config.deploy.stop_timeout_seconds = 1;
        config.deploy.start_timeout_seconds = 1;
        config.deploy.health_poll_interval_ms = 10;
        config.operation.settle_delay_ms = 150;

        Self {
            dir,
            config,
            backend: Arc::new(ScriptedBackend::new().with_service(SERVICE, ServiceStatus::Active)),
            clock: Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap())),
            sink: Arc::new(MemoryStatusSink::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn install_root(&self) -> PathBuf {
        self.config.paths.install_root.clone()
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.config.paths.downloads_dir()
    }

    pub fn record_path(&self) -> PathBuf {
        self.config.paths.runtime_dir.join("ota-state.json")
    }

    /// A single-binary payload installed as `bin/app` under the install root.
    pub fn app_payload<'a>(&self, content: &'a [u8]) -> Payload<'a> {
        Payload {
            name: "app",
            src: "bin/app",
            content,
            dst: self.install_root().join("bin/app"),
            service: Some(SERVICE),
            order: Some(1),
        }
    }

    pub fn manager(&self) -> OtaManager {
        OtaManager::builder(self.config.clone())
            .with_clock(self.clock.clone())
            .with_service_backend(self.backend.clone())
            .with_status_sink(self.sink.clone())
            .build()
            .unwrap()
    }

    /// Build, start, and provision a factory snapshot running `factory`.
    pub async fn started_manager(&self) -> OtaManager {
        let manager = self.manager();
        manager.start().await.unwrap();
        let dir = self.root().join("factory-src");
        write_artifact_dir(&dir, "1.0.0", &[self.app_payload(b"factory")]);
        manager.deployer().provision_factory(&dir).await.unwrap();
        manager
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// A record for [`ARTIFACT`] at version 1.1.0.
    pub fn record(
        &self,
        stage: Stage,
        bytes: u64,
        verified_at: Option<DateTime<Utc>>,
    ) -> StateRecord {
        StateRecord {
            version: "1.1.0".into(),
            source_url: format!("https://updates.example.com/{}", ARTIFACT),
            artifact_name: ARTIFACT.into(),
            declared_size: bytes,
            expected_checksum: "00".repeat(32),
            bytes_downloaded: bytes,
            last_update_timestamp: self.clock_now(),
            stage,
            verified_at_timestamp: verified_at,
        }
    }

    pub fn installed_app(&self) -> String {
        std::fs::read_to_string(self.install_root().join("bin/app")).unwrap()
    }

    /// Leave the tree as a crash right after the `current` rename of a 1.2.0
    /// deploy would: new snapshot live, journal still naming `prior`.
    pub fn interrupt_after_switch(&self, prior: &Path) -> PathBuf {
        let versions = &self.config.paths.versions_dir;
        let target = versions.join("1.2.0-1");
        write_artifact_dir(&target, "1.2.0", &[self.app_payload(b"v1.2")]);
        BackupJournal::begin(
            &self.config.paths.backups_dir,
            &target,
            Some(prior),
            vec![SERVICE.to_string()],
        )
        .unwrap();

        let current = versions.join("current");
        std::fs::remove_file(&current).unwrap();
        std::os::unix::fs::symlink("1.2.0-1", &current).unwrap();
        target
    }
}

/// Poll until the state satisfies `pred`, panicking after 10 seconds.
pub async fn wait_for<F>(manager: &OtaManager, pred: F) -> OperationState
where
    F: Fn(&OperationState) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = manager.progress();
        if pred(&state) {
            return state;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting; last state: {:?}", state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_stage(manager: &OtaManager, stage: Stage) -> OperationState {
    wait_for(manager, |s| s.stage == stage).await
}

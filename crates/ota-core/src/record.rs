//! Persisted state record.
//!
//! A durable mirror of the in-flight download/verify state so that progress
//! survives a process restart. Written atomically (temp file, fsync, rename)
//! and discarded when it cannot be parsed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::OtaError;
use crate::state::Stage;

/// File name of the record inside the runtime directory.
pub const RECORD_FILE: &str = "ota-state.json";

/// Durable description of one download/verify/install operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub version: String,
    pub source_url: String,
    pub artifact_name: String,
    pub declared_size: u64,
    pub expected_checksum: String,
    pub bytes_downloaded: u64,
    pub last_update_timestamp: DateTime<Utc>,
    pub stage: Stage,
    #[serde(default)]
    pub verified_at_timestamp: Option<DateTime<Utc>>,
}

impl StateRecord {
    /// Whether the record describes the same download target.
    pub fn same_target(&self, version: &str, source_url: &str, checksum: &str) -> bool {
        self.version == version
            && self.source_url == source_url
            && self.expected_checksum.eq_ignore_ascii_case(checksum)
    }

    /// Whether a verified package is still inside the trust window at `now`.
    ///
    /// Unverified records and verification timestamps in the future are
    /// never trusted.
    pub fn within_trust_window(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.verified_at_timestamp {
            Some(verified_at) => {
                let age = now - verified_at;
                age >= Duration::zero() && age < window
            }
            None => false,
        }
    }
}

/// Reads and writes the record file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            path: runtime_dir.join(RECORD_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record.
    ///
    /// Returns `Ok(None)` when there is no record. A record that cannot be
    /// parsed is deleted and also reported as `None`.
    pub async fn load(&self) -> Result<Option<StateRecord>, OtaError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<StateRecord>(&data) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Discarding unreadable state record {:?}: {}", self.path, e);
                self.clear().await?;
                Ok(None)
            }
        }
    }

    /// Atomically replace the record on disk.
    pub async fn save(&self, record: &StateRecord) -> Result<(), OtaError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        sync_parent(&self.path).await;

        debug!(
            stage = ?record.stage,
            bytes = record.bytes_downloaded,
            "State record saved"
        );
        Ok(())
    }

    /// Delete the record. Missing records are not an error.
    pub async fn clear(&self) -> Result<(), OtaError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                sync_parent(&self.path).await;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Best-effort fsync of a file's parent directory so a rename is durable.
pub(crate) async fn sync_parent(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    match tokio::fs::File::open(parent).await {
        Ok(dir) => {
            if let Err(e) = dir.sync_all().await {
                debug!("Directory fsync of {:?} failed: {}", parent, e);
            }
        }
        Err(e) => debug!("Cannot open {:?} for fsync: {}", parent, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record() -> StateRecord {
        StateRecord {
            version: "1.2.0".into(),
            source_url: "https://updates.example.com/1.2.0.tar.gz".into(),
            artifact_name: "1.2.0.tar.gz".into(),
            declared_size: 1000,
            expected_checksum: "ab".repeat(32),
            bytes_downloaded: 400,
            last_update_timestamp: Utc::now(),
            stage: Stage::Downloading,
            verified_at_timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());

        let rec = record();
        store.save(&rec).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(rec));
        assert!(!dir.path().join("ota-state.json.tmp").exists());

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_record_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::write(store.path(), b"{\"version\": \"1.2").unwrap();

        assert!(store.load().await.unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_camel_case_fields() {
        let json = serde_json::to_value(record()).unwrap();
        assert!(json.get("bytesDownloaded").is_some());
        assert!(json.get("verifiedAtTimestamp").is_some());
        assert_eq!(json["stage"], "downloading");
    }

    #[test]
    fn test_trust_window() {
        let now = Utc::now();
        let window = Duration::hours(24);
        let mut rec = record();
        assert!(!rec.within_trust_window(now, window));

        rec.verified_at_timestamp = Some(now - Duration::hours(23));
        assert!(rec.within_trust_window(now, window));

        rec.verified_at_timestamp = Some(now - Duration::hours(24));
        assert!(!rec.within_trust_window(now, window));

        rec.verified_at_timestamp = Some(now + Duration::hours(1));
        assert!(!rec.within_trust_window(now, window));
    }

    #[test]
    fn test_same_target() {
        let rec = record();
        let checksum = "AB".repeat(32);
        assert!(rec.same_target("1.2.0", &rec.source_url, &checksum));
        assert!(!rec.same_target("1.3.0", &rec.source_url, &checksum));
        assert!(!rec.same_target("1.2.0", "https://other", &checksum));
    }
}

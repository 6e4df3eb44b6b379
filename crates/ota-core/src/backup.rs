//! Backup journal for files replaced outside the snapshot tree.
//!
//! Before a deployment touches anything live it opens a journal recording the
//! snapshot it activates, the snapshot it supersedes and the services it
//! controls. Every external file is copied aside and the journal re-persisted
//! before the original is overwritten, so rollback (or startup recovery after
//! a crash) can put things back in reverse order.
//!
//! ```text
//! backups_dir/
//! ├── journal.json
//! └── files/
//!     ├── 0-app.conf
//!     └── 1-helper
//! ```

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::OtaError;

/// Journal file name inside the backups directory.
pub const JOURNAL_FILE: &str = "journal.json";

const FILES_DIR: &str = "files";

/// One replaced file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    /// Live path that is about to be replaced.
    pub original: PathBuf,
    /// Copy of the prior content; `None` if the path did not exist.
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalData {
    target_snapshot: PathBuf,
    prior_snapshot: Option<PathBuf>,
    services: Vec<String>,
    entries: Vec<BackupEntry>,
}

/// Persisted record of one in-flight deployment.
#[derive(Debug)]
pub struct BackupJournal {
    dir: PathBuf,
    data: JournalData,
}

impl BackupJournal {
    /// Open a fresh journal, discarding any leftover one.
    pub fn begin(
        dir: &Path,
        target_snapshot: &Path,
        prior_snapshot: Option<&Path>,
        services: Vec<String>,
    ) -> Result<Self, OtaError> {
        if dir.join(FILES_DIR).exists() {
            fs::remove_dir_all(dir.join(FILES_DIR))?;
        }
        fs::create_dir_all(dir.join(FILES_DIR))?;

        let journal = Self {
            dir: dir.to_path_buf(),
            data: JournalData {
                target_snapshot: target_snapshot.to_path_buf(),
                prior_snapshot: prior_snapshot.map(Path::to_path_buf),
                services,
                entries: Vec::new(),
            },
        };
        journal.persist()?;
        debug!("Opened backup journal in {:?}", dir);
        Ok(journal)
    }

    /// Load a leftover journal, if any.
    ///
    /// An unreadable journal is reported as an error rather than dropped: it
    /// may describe files that still need restoring.
    pub fn load(dir: &Path) -> Result<Option<Self>, OtaError> {
        let path = dir.join(JOURNAL_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data: JournalData = serde_json::from_slice(&bytes)?;
        Ok(Some(Self {
            dir: dir.to_path_buf(),
            data,
        }))
    }

    pub fn target_snapshot(&self) -> &Path {
        &self.data.target_snapshot
    }

    pub fn prior_snapshot(&self) -> Option<&Path> {
        self.data.prior_snapshot.as_deref()
    }

    pub fn services(&self) -> &[String] {
        &self.data.services
    }

    pub fn entries(&self) -> &[BackupEntry] {
        &self.data.entries
    }

    /// Copy `original` aside and record it. Must be called before `original`
    /// is modified; the journal is durable when this returns.
    pub fn backup_file(&mut self, original: &Path) -> Result<(), OtaError> {
        if self.data.entries.iter().any(|e| e.original == original) {
            return Ok(());
        }

        let backup = if original.exists() {
            let file_name = original
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let dest = self
                .dir
                .join(FILES_DIR)
                .join(format!("{}-{}", self.data.entries.len(), file_name));
            fs::copy(original, &dest)?;
            fs::File::open(&dest)?.sync_all()?;
            debug!("Backed up {:?} to {:?}", original, dest);
            Some(dest)
        } else {
            None
        };

        self.data.entries.push(BackupEntry {
            original: original.to_path_buf(),
            backup,
        });
        self.persist()
    }

    /// Put every recorded file back, newest first.
    ///
    /// Keeps going after a failure so as much as possible is restored; the
    /// first error is returned.
    pub fn restore_all(&self) -> Result<(), OtaError> {
        let mut first_error = None;
        for entry in self.data.entries.iter().rev() {
            if let Err(e) = restore_entry(entry) {
                warn!("Failed to restore {:?}: {}", entry.original, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(OtaError::Activation(format!(
                "failed to restore backed-up files: {}",
                e
            ))),
            None => {
                if !self.data.entries.is_empty() {
                    info!("Restored {} backed-up file(s)", self.data.entries.len());
                }
                Ok(())
            }
        }
    }

    /// Delete the journal and its file copies.
    pub fn clear(self) -> Result<(), OtaError> {
        remove_if_exists(&self.dir.join(JOURNAL_FILE))?;
        match fs::remove_dir_all(self.dir.join(FILES_DIR)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Cleared backup journal in {:?}", self.dir);
        Ok(())
    }

    fn persist(&self) -> Result<(), OtaError> {
        let json = serde_json::to_vec_pretty(&self.data)?;
        write_atomic(&self.dir.join(JOURNAL_FILE), &json)
    }
}

fn restore_entry(entry: &BackupEntry) -> Result<(), OtaError> {
    match &entry.backup {
        Some(backup) => {
            if let Some(parent) = entry.original.parent() {
                fs::create_dir_all(parent)?;
            }
            replace_file(backup, &entry.original)
        }
        None => remove_if_exists(&entry.original),
    }
}

/// Write `bytes` to `path` via a synced temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), OtaError> {
    let tmp = temp_sibling(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_dir(path);
    Ok(())
}

/// Replace `dst` with a copy of `src` without a window where `dst` is partial.
pub(crate) fn replace_file(src: &Path, dst: &Path) -> Result<(), OtaError> {
    let tmp = temp_sibling(dst);
    fs::copy(src, &tmp)?;
    fs::File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, dst)?;
    sync_dir(dst);
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), OtaError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Best-effort fsync of the directory containing `path`.
pub(crate) fn sync_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::File::open(parent).and_then(|d| d.sync_all()) {
            debug!("Directory fsync of {:?} failed: {}", parent, e);
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

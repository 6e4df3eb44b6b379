//! Artifact extraction.
//!
//! Artifacts are gzip-compressed tarballs with `manifest.json` at the root.
//! Every entry is checked before it is written: paths must stay inside the
//! staging directory and link targets may not point outside it.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tokio::task;
use tracing::{debug, info, warn};

use crate::error::OtaError;
use crate::manifest::{is_safe_relative, Manifest};

/// Unpacks verified artifacts into a staging directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactUnpacker;

impl ArtifactUnpacker {
    pub fn new() -> Self {
        Self
    }

    /// Extract `archive` into `dest` (replacing anything there) and return
    /// its parsed manifest.
    ///
    /// # Errors
    ///
    /// - [`OtaError::UnsafePath`] for an entry or link escaping `dest`
    /// - [`OtaError::Staging`] if the archive is unreadable
    /// - [`OtaError::InvalidManifest`] if `manifest.json` is missing or invalid
    pub async fn unpack(&self, archive: &Path, dest: &Path) -> Result<Manifest, OtaError> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        task::spawn_blocking(move || unpack_blocking(&archive, &dest))
            .await
            .map_err(|e| OtaError::Internal(format!("unpack task failed: {}", e)))?
    }
}

fn unpack_blocking(archive_path: &Path, dest: &Path) -> Result<Manifest, OtaError> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    info!("Unpacking {:?} into {:?}", archive_path, dest);
    let file = File::open(archive_path).map_err(|_| OtaError::PackageMissing(archive_path.to_path_buf()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    let staging = |e: std::io::Error| OtaError::Staging(format!("failed to read artifact: {}", e));
    let mut count = 0usize;
    for entry in archive.entries().map_err(staging)? {
        let mut entry = entry.map_err(staging)?;
        let path: PathBuf = entry.path().map_err(staging)?.into_owned();

        if path.components().all(|c| c == Component::CurDir) {
            continue;
        }
        if !is_safe_relative(&path) {
            return Err(OtaError::UnsafePath(format!(
                "archive entry {} escapes the staging directory",
                path.display()
            )));
        }

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory | EntryType::Continuous => {}
            EntryType::Symlink | EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(staging)?
                    .map(|t| t.into_owned())
                    .ok_or_else(|| {
                        OtaError::UnsafePath(format!("link {} has no target", path.display()))
                    })?;
                // Symlinks resolve from their own directory, hard links from the root.
                let base = if entry.header().entry_type() == EntryType::Symlink {
                    path.parent().unwrap_or(Path::new(""))
                } else {
                    Path::new("")
                };
                if !stays_inside(base, &target) {
                    return Err(OtaError::UnsafePath(format!(
                        "link {} -> {} escapes the staging directory",
                        path.display(),
                        target.display()
                    )));
                }
            }
            other => {
                warn!("Skipping unsupported archive entry {} ({:?})", path.display(), other);
                continue;
            }
        }

        let unpacked = entry.unpack_in(dest).map_err(staging)?;
        if !unpacked {
            return Err(OtaError::UnsafePath(format!(
                "archive entry {} was refused",
                path.display()
            )));
        }
        count += 1;
    }
    debug!("Unpacked {} entries", count);

    Manifest::load_from_dir(dest)
}

/// Whether `target`, resolved against `base` (relative to the root), stays
/// inside the root.
fn stays_inside(base: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return false;
    }
    let mut depth: i64 = base
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count() as i64;
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "version": "1.2.0",
        "modules": [{"name": "app", "src": "bin/app", "dst": "/opt/device/bin/app"}]
    }"#;

    fn build(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[tokio::test]
    async fn test_unpack_returns_manifest() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.tar.gz");
        build(&archive, &[("manifest.json", MANIFEST.as_bytes()), ("bin/app", b"binary")]);

        let dest = dir.path().join("staging");
        let manifest = ArtifactUnpacker::new().unpack(&archive, &dest).await.unwrap();
        assert_eq!(manifest.version.to_string(), "1.2.0");
        assert_eq!(fs::read(dest.join("bin/app")).unwrap(), b"binary");
    }

    #[tokio::test]
    async fn test_unpack_requires_manifest() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.tar.gz");
        build(&archive, &[("bin/app", b"binary")]);

        let err = ArtifactUnpacker::new()
            .unpack(&archive, &dir.path().join("staging"))
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::InvalidManifest(_)));
    }

    #[tokio::test]
    async fn test_unpack_garbage_is_staging_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.tar.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();

        let err = ArtifactUnpacker::new()
            .unpack(&archive, &dir.path().join("staging"))
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::Staging(_)));
    }

    #[test]
    fn test_stays_inside() {
        assert!(stays_inside(Path::new("lib"), Path::new("libfoo.so.1")));
        assert!(stays_inside(Path::new("lib/x"), Path::new("../y")));
        assert!(!stays_inside(Path::new("lib"), Path::new("../../etc/passwd")));
        assert!(!stays_inside(Path::new(""), Path::new("/etc/passwd")));
    }
}

//! Release manifest.
//!
//! Every artifact carries a `manifest.json` at its root describing the
//! version and the modules it deploys:
//!
//! ```json
//! {
//!   "version": "1.2.0",
//!   "modules": [
//!     { "name": "app", "src": "bin/app", "dst": "/opt/device/bin/app",
//!       "serviceName": "app.service", "restartOrder": 1 }
//!   ]
//! }
//! ```
//!
//! Source paths must stay inside the unpacked artifact. Destination paths are
//! absolute; a destination inside the install root is staged into the
//! version snapshot, anything else is an *external* module that is copied in
//! place at activation with a journaled backup.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::OtaError;

/// File name of the manifest inside the artifact and inside each snapshot.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: Version,
    pub modules: Vec<Module>,
}

/// One deployable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: String,
    /// Path relative to the unpacked artifact root.
    pub src: PathBuf,
    /// Absolute target path.
    pub dst: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_order: Option<u32>,
}

/// Where a module lands relative to the managed snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Inside the install root; the path is relative to it.
    Snapshot(PathBuf),
    /// Outside the install root. Replaced in place, covered only by a backup.
    External,
}

impl Manifest {
    /// Parse a manifest from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, OtaError> {
        serde_json::from_slice(data).map_err(|e| OtaError::InvalidManifest(e.to_string()))
    }

    /// Load `manifest.json` from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self, OtaError> {
        let path = dir.join(MANIFEST_FILE);
        let data = std::fs::read(&path).map_err(|e| {
            OtaError::InvalidManifest(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&data)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, OtaError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Check the manifest invariants against the install root.
    ///
    /// # Errors
    ///
    /// - [`OtaError::InvalidManifest`] for an empty module list, blank or
    ///   duplicate names
    /// - [`OtaError::UnsafePath`] for a `src` that is absolute or climbs out
    ///   of the artifact, or a `dst` that is relative or contains `..`
    pub fn validate(&self, install_root: &Path) -> Result<(), OtaError> {
        if self.modules.is_empty() {
            return Err(OtaError::InvalidManifest("module list is empty".into()));
        }

        let mut names = HashSet::new();
        let mut destinations = HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return Err(OtaError::InvalidManifest("module name is empty".into()));
            }
            if !names.insert(module.name.as_str()) {
                return Err(OtaError::InvalidManifest(format!(
                    "duplicate module name: {}",
                    module.name
                )));
            }
            if !is_safe_relative(&module.src) {
                return Err(OtaError::UnsafePath(format!(
                    "module {} src {} must be relative and stay inside the artifact",
                    module.name,
                    module.src.display()
                )));
            }
            if !is_clean_absolute(&module.dst) {
                return Err(OtaError::UnsafePath(format!(
                    "module {} dst {} must be an absolute path without '..'",
                    module.name,
                    module.dst.display()
                )));
            }
            if module.dst == install_root {
                return Err(OtaError::UnsafePath(format!(
                    "module {} dst cannot be the install root itself",
                    module.name
                )));
            }
            if !destinations.insert(module.dst.as_path()) {
                return Err(OtaError::InvalidManifest(format!(
                    "duplicate module destination: {}",
                    module.dst.display()
                )));
            }
            if let Some(service) = &module.service_name {
                if service.trim().is_empty() || service.contains('/') {
                    return Err(OtaError::InvalidManifest(format!(
                        "module {} has an invalid service name",
                        module.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Distinct service names in manifest order.
    pub fn services(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.modules
            .iter()
            .filter_map(|m| m.service_name.as_deref())
            .filter(|s| seen.insert(*s))
            .map(str::to_string)
            .collect()
    }

    /// Distinct service names in ascending `restartOrder`.
    ///
    /// Services without an order start after ordered ones, in manifest order.
    /// A service named by several modules takes its lowest order.
    pub fn restart_plan(&self) -> Vec<String> {
        let mut plan: Vec<(u32, usize, &str)> = Vec::new();
        for (idx, module) in self.modules.iter().enumerate() {
            let Some(service) = module.service_name.as_deref() else {
                continue;
            };
            let order = module.restart_order.unwrap_or(u32::MAX);
            match plan.iter_mut().find(|(_, _, s)| *s == service) {
                Some(entry) => entry.0 = entry.0.min(order),
                None => plan.push((order, idx, service)),
            }
        }
        plan.sort_by_key(|(order, idx, _)| (*order, *idx));
        plan.into_iter().map(|(_, _, s)| s.to_string()).collect()
    }

    /// Modules whose destination lies outside the install root.
    pub fn external_modules<'a>(&'a self, install_root: &'a Path) -> impl Iterator<Item = &'a Module> {
        self.modules
            .iter()
            .filter(move |m| m.placement(install_root) == Placement::External)
    }
}

impl Module {
    /// Classify the destination against the install root.
    pub fn placement(&self, install_root: &Path) -> Placement {
        match self.dst.strip_prefix(install_root) {
            Ok(rel) if !rel.as_os_str().is_empty() => Placement::Snapshot(rel.to_path_buf()),
            _ => Placement::External,
        }
    }
}

/// A relative path made only of normal components (and `.`).
pub fn is_safe_relative(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    normal > 0
}

/// An absolute path without `..` segments.
pub fn is_clean_absolute(path: &Path) -> bool {
    path.is_absolute() && !path.components().any(|c| c == Component::ParentDir)
}

/// A bare file name: one normal component, no separators.
pub fn is_plain_file_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && !name.starts_with('.')
        && path.components().count() == 1
        && matches!(path.components().next(), Some(Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, src: &str, dst: &str, service: Option<&str>, order: Option<u32>) -> Module {
        Module {
            name: name.to_string(),
            src: PathBuf::from(src),
            dst: PathBuf::from(dst),
            service_name: service.map(str::to_string),
            restart_order: order,
        }
    }

    fn manifest(modules: Vec<Module>) -> Manifest {
        Manifest {
            version: Version::new(1, 2, 0),
            modules,
        }
    }

    #[test]
    fn test_parse_camel_case_json() {
        let json = br#"{
            "version": "1.2.0",
            "modules": [
                {"name": "app", "src": "bin/app", "dst": "/opt/device/bin/app",
                 "serviceName": "app.service", "restartOrder": 2},
                {"name": "cfg", "src": "etc/app.toml", "dst": "/etc/app.toml"}
            ]
        }"#;
        let m = Manifest::from_json(json).unwrap();
        assert_eq!(m.version, Version::new(1, 2, 0));
        assert_eq!(m.modules[0].service_name.as_deref(), Some("app.service"));
        assert_eq!(m.modules[0].restart_order, Some(2));
        assert!(m.modules[1].service_name.is_none());
        assert!(m.validate(Path::new("/opt/device")).is_ok());
    }

    #[test]
    fn test_bad_version_is_manifest_error() {
        let err = Manifest::from_json(br#"{"version":"one","modules":[]}"#).unwrap_err();
        assert!(matches!(err, OtaError::InvalidManifest(_)));
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        let root = Path::new("/opt/device");
        assert!(matches!(
            manifest(vec![]).validate(root),
            Err(OtaError::InvalidManifest(_))
        ));

        let dup = manifest(vec![
            module("app", "a", "/opt/device/a", None, None),
            module("app", "b", "/opt/device/b", None, None),
        ]);
        assert!(matches!(dup.validate(root), Err(OtaError::InvalidManifest(_))));
    }

    #[test]
    fn test_validate_rejects_unsafe_paths() {
        let root = Path::new("/opt/device");
        let cases = vec![
            module("a", "../etc/passwd", "/opt/device/a", None, None),
            module("a", "/abs/src", "/opt/device/a", None, None),
            module("a", "bin/app", "relative/dst", None, None),
            module("a", "bin/app", "/opt/device/../../etc/shadow", None, None),
        ];
        for m in cases {
            let err = manifest(vec![m]).validate(root).unwrap_err();
            assert!(matches!(err, OtaError::UnsafePath(_)), "{err}");
        }
    }

    #[test]
    fn test_placement() {
        let root = Path::new("/opt/device");
        let inside = module("a", "a", "/opt/device/bin/a", None, None);
        let outside = module("b", "b", "/etc/b.conf", None, None);
        let sibling = module("c", "c", "/opt/device-other/c", None, None);

        assert_eq!(inside.placement(root), Placement::Snapshot(PathBuf::from("bin/a")));
        assert_eq!(outside.placement(root), Placement::External);
        assert_eq!(sibling.placement(root), Placement::External);
    }

    #[test]
    fn test_services_and_restart_plan() {
        let m = manifest(vec![
            module("ui", "ui", "/opt/device/ui", Some("ui.service"), Some(3)),
            module("core", "core", "/opt/device/core", Some("core.service"), Some(1)),
            module("core-data", "d", "/opt/device/data", Some("core.service"), Some(5)),
            module("misc", "m", "/opt/device/m", Some("misc.service"), None),
            module("plain", "p", "/opt/device/p", None, Some(0)),
        ]);

        assert_eq!(m.services(), vec!["ui.service", "core.service", "misc.service"]);
        assert_eq!(m.restart_plan(), vec!["core.service", "ui.service", "misc.service"]);
    }

    #[test]
    fn test_plain_file_name() {
        assert!(is_plain_file_name("update-1.2.0.tar.gz"));
        assert!(!is_plain_file_name("../x"));
        assert!(!is_plain_file_name("a/b"));
        assert!(!is_plain_file_name(".hidden"));
        assert!(!is_plain_file_name(""));
    }
}

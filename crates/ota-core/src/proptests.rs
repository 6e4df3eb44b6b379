//! Property-based tests for ota-core.
//!
//! # Properties Tested
//!
//! - Streaming and resumed hashing agree with a one-shot digest
//! - Any corrupted byte is caught by the checksum check
//! - Checkpoints fire on every crossed percent step
//! - Restart plans are ordered and duplicate-free
//! - Parent-directory segments are never accepted as module sources
//! - The trust window is half-open: `[0, window)`

#![cfg(test)]

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use semver::Version;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tempfile::TempDir;

use crate::checksum::{ChecksumVerifier, StreamingHasher};
use crate::download::CheckpointPolicy;
use crate::manifest::{is_safe_relative, Manifest, Module};
use crate::record::StateRecord;
use crate::state::{percent, Stage};

// =============================================================================
// Generators
// =============================================================================

/// Artifact content (1 byte to 16KB).
fn arb_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..16384)
}

/// Module list with optional services and restart orders.
fn arb_modules() -> impl Strategy<Value = Vec<(Option<u8>, Option<u32>)>> {
    prop::collection::vec((prop::option::of(0u8..4), prop::option::of(0u32..10)), 1..12)
}

fn one_shot(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn record(verified_at: Option<chrono::DateTime<Utc>>) -> StateRecord {
    StateRecord {
        version: "1.0.0".into(),
        source_url: "https://updates.example.com/a.tar.gz".into(),
        artifact_name: "a.tar.gz".into(),
        declared_size: 1,
        expected_checksum: "00".repeat(32),
        bytes_downloaded: 1,
        last_update_timestamp: Utc::now(),
        stage: Stage::ToInstall,
        verified_at_timestamp: verified_at,
    }
}

// =============================================================================
// Checksums
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Feeding the hasher in arbitrary chunks gives the one-shot digest.
    #[test]
    fn prop_chunked_hash_matches(content in arb_content(), chunk in 1usize..4096) {
        let mut hasher = StreamingHasher::new();
        for part in content.chunks(chunk) {
            hasher.update(part);
        }
        prop_assert_eq!(hasher.bytes(), content.len() as u64);
        prop_assert_eq!(hasher.finalize(), one_shot(&content));
    }

    /// Re-hashing a partial file and continuing with the tail gives the
    /// digest of the whole artifact.
    #[test]
    fn prop_resumed_hash_matches(content in arb_content(), split in any::<prop::sample::Index>()) {
        let at = split.index(content.len());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial");
        std::fs::write(&path, &content[..at]).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let mut hasher = rt
            .block_on(ChecksumVerifier::new().hash_prefix(&path, at as u64))
            .unwrap();
        hasher.update(&content[at..]);
        prop_assert_eq!(hasher.finalize(), one_shot(&content));
    }

    /// Flipping any byte makes the check fail.
    #[test]
    fn prop_corruption_detected(
        content in arb_content(),
        pos in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let expected = one_shot(&content);
        let mut corrupted = content.clone();
        let i = pos.index(corrupted.len());
        corrupted[i] ^= flip;

        let verifier = ChecksumVerifier::new();
        prop_assert!(verifier.check(&expected, &one_shot(&corrupted)).is_err());
        prop_assert!(verifier.check(&expected, &one_shot(&content)).is_ok());
    }
}

// =============================================================================
// Checkpoint cadence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Walking through a download, every crossed percent step is persisted.
    #[test]
    fn prop_checkpoint_on_every_step(
        total in 1u64..10_000_000,
        chunks in prop::collection::vec(1u64..65536, 1..200),
        step in 1u8..=25,
    ) {
        let policy = CheckpointPolicy { percent_step: step, byte_step: 0 };
        let mut done = 0u64;
        let mut last = 0u64;
        for chunk in chunks {
            let next = (done + chunk).min(total);
            let due = policy.due(last, next, total);
            if percent(next, total) / step > percent(last, total) / step {
                prop_assert!(due);
            }
            if due {
                last = next;
            }
            done = next;
        }
        prop_assert!(percent(last, total) / step + 1 > percent(done, total) / step);
    }

    /// Percentages stay in range and never decrease.
    #[test]
    fn prop_percent_monotonic(total in 1u64..u64::MAX, a in any::<u64>(), b in any::<u64>()) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(percent(hi, total) <= 100);
        prop_assert!(percent(lo, total) <= percent(hi, total));
    }
}

// =============================================================================
// Manifests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// The restart plan names each service once, in ascending order.
    #[test]
    fn prop_restart_plan_ordered(specs in arb_modules()) {
        let modules: Vec<Module> = specs
            .iter()
            .enumerate()
            .map(|(i, (service, order))| Module {
                name: format!("m{}", i),
                src: PathBuf::from(format!("m{}", i)),
                dst: PathBuf::from(format!("/opt/device/m{}", i)),
                service_name: service.map(|s| format!("svc{}.service", s)),
                restart_order: *order,
            })
            .collect();
        let manifest = Manifest { version: Version::new(1, 0, 0), modules };

        let plan = manifest.restart_plan();
        let services = manifest.services();
        prop_assert_eq!(plan.len(), services.len());

        let lowest = |svc: &str| {
            manifest
                .modules
                .iter()
                .filter(|m| m.service_name.as_deref() == Some(svc))
                .map(|m| m.restart_order.unwrap_or(u32::MAX))
                .min()
                .unwrap()
        };
        for pair in plan.windows(2) {
            prop_assert!(lowest(&pair[0]) <= lowest(&pair[1]));
        }
    }

    /// A source path with a `..` segment anywhere is rejected.
    #[test]
    fn prop_parent_segments_rejected(
        prefix in prop::collection::vec("[a-z]{1,8}", 0..4),
        suffix in prop::collection::vec("[a-z]{1,8}", 0..4),
    ) {
        let mut parts = prefix.clone();
        parts.push("..".to_string());
        parts.extend(suffix);
        let path = PathBuf::from(parts.join("/"));
        prop_assert!(!is_safe_relative(&path));

        if !prefix.is_empty() {
            prop_assert!(is_safe_relative(&PathBuf::from(prefix.join("/"))));
        }
    }
}

// =============================================================================
// Trust window
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// A package is installable iff it was verified less than the window ago.
    #[test]
    fn prop_trust_window(age_minutes in -600i64..3000, window_hours in 1i64..48) {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let rec = record(Some(now - Duration::minutes(age_minutes)));
        let inside = rec.within_trust_window(now, Duration::hours(window_hours));
        prop_assert_eq!(inside, age_minutes >= 0 && age_minutes < window_hours * 60);
    }
}

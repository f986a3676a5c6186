//! Retention passes over the scratch directory.
//!
//! A pass runs three phases in order:
//! 1. Orphan sweep: temp files older than the grace window are removed
//!    without a tombstone.
//! 2. TTL sweep: artifacts older than the TTL of their class are removed
//!    and tombstoned.
//! 3. LRU sweep: while the scratch total exceeds the cap and more than
//!    `min_keep` artifacts remain, the oldest write goes first (ties by name).
//!
//! Only the scratch directory is scanned. Pinned copies live elsewhere and
//! are never touched.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifact::{is_temp_name, ArtifactId, ArtifactName};
use crate::config::FewwordConfig;
use crate::error::Result;
use crate::manifest::ManifestStore;

/// TTL class of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionClass {
    Success,
    Failure,
}

/// Class assumed for artifacts that carry no exit code.
pub const LEGACY_CLASS: RetentionClass = RetentionClass::Success;

impl RetentionClass {
    pub fn of(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => RetentionClass::Success,
            Some(_) => RetentionClass::Failure,
            None => LEGACY_CLASS,
        }
    }
}

/// Immutable input to one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub success_ttl: Duration,
    pub failure_ttl: Duration,
    pub max_bytes: u64,
    pub min_keep: usize,
    pub orphan_grace: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &FewwordConfig) -> Self {
        Self {
            success_ttl: config.success_ttl(),
            failure_ttl: config.failure_ttl(),
            max_bytes: config.scratch_max_bytes(),
            min_keep: config.retention.min_keep,
            orphan_grace: Duration::from_secs(config.retention.orphan_grace_min.saturating_mul(60)),
        }
    }

    pub fn ttl_for(&self, class: RetentionClass) -> Duration {
        match class {
            RetentionClass::Success => self.success_ttl,
            RetentionClass::Failure => self.failure_ttl,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// File names of removed temp files.
    pub orphans_removed: Vec<String>,
    pub ttl_removed: Vec<ArtifactId>,
    pub lru_removed: Vec<ArtifactId>,
    /// File names whose deletion failed.
    pub failed: Vec<String>,
    pub bytes_freed: u64,
    pub remaining_files: usize,
    pub remaining_bytes: u64,
}

impl SweepReport {
    pub fn removed_count(&self) -> usize {
        self.orphans_removed.len() + self.ttl_removed.len() + self.lru_removed.len()
    }
}

#[derive(Debug, Clone)]
struct TempFile {
    path: PathBuf,
    file_name: String,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
struct ScratchFile {
    path: PathBuf,
    file_name: String,
    name: ArtifactName,
    size: u64,
    modified: SystemTime,
    /// A delete was already attempted and failed during this pass.
    undeletable: bool,
}

/// Runs retention passes for one scratch directory.
pub struct RetentionManager<'a> {
    scratch_dir: PathBuf,
    manifest: &'a ManifestStore,
    policy: RetentionPolicy,
}

impl<'a> RetentionManager<'a> {
    pub fn new(scratch_dir: impl Into<PathBuf>, manifest: &'a ManifestStore, policy: RetentionPolicy) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            manifest,
            policy,
        }
    }

    /// Run one pass as of `now`.
    pub fn sweep(&self, now: SystemTime) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let (temps, artifacts) = match self.scan() {
            Ok(found) => found,
            Err(e) if is_not_found(&e) => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        for temp in temps {
            if age(now, temp.modified) <= self.policy.orphan_grace {
                continue;
            }
            match fs::remove_file(&temp.path) {
                Ok(()) => report.orphans_removed.push(temp.file_name),
                Err(e) => {
                    warn!(file = %temp.file_name, error = %e, "failed to remove orphaned temp file");
                    report.failed.push(temp.file_name);
                }
            }
        }

        // Files whose TTL delete failed stay in the working set: they still
        // occupy disk and count against the cap.
        let mut survivors = Vec::with_capacity(artifacts.len());
        for mut file in artifacts {
            let ttl = self.policy.ttl_for(RetentionClass::of(file.name.exit_code));
            if age(now, file.modified) > ttl {
                if self.remove(&file, "ttl", now, &mut report) {
                    report.ttl_removed.push(file.name.id.clone());
                    continue;
                }
                file.undeletable = true;
            }
            survivors.push(file);
        }

        survivors.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        let mut total: u64 = survivors.iter().map(|f| f.size).sum();
        let mut remaining = survivors.len();
        let mut kept = Vec::with_capacity(survivors.len());
        for file in survivors {
            if !file.undeletable
                && total > self.policy.max_bytes
                && remaining > self.policy.min_keep
                && self.remove(&file, "lru", now, &mut report)
            {
                total -= file.size;
                remaining -= 1;
                report.lru_removed.push(file.name.id.clone());
            } else {
                kept.push(file);
            }
        }

        report.remaining_files = kept.len();
        report.remaining_bytes = kept.iter().map(|f| f.size).sum();
        debug!(
            orphans = report.orphans_removed.len(),
            ttl = report.ttl_removed.len(),
            lru = report.lru_removed.len(),
            failed = report.failed.len(),
            "retention pass complete"
        );
        Ok(report)
    }

    /// Delete one artifact, then tombstone it. False if the delete failed.
    fn remove(&self, file: &ScratchFile, reason: &str, now: SystemTime, report: &mut SweepReport) -> bool {
        if let Err(e) = fs::remove_file(&file.path) {
            warn!(file = %file.file_name, error = %e, "failed to delete artifact");
            report.failed.push(file.file_name.clone());
            return false;
        }
        report.bytes_freed += file.size;
        let deleted_at: DateTime<Utc> = now.into();
        if let Err(e) = self.manifest.tombstone(&file.name.id, reason, deleted_at) {
            warn!(id = %file.name.id, error = %e, "artifact deleted but tombstone append failed");
        }
        true
    }

    fn scan(&self) -> io::Result<(Vec<TempFile>, Vec<ScratchFile>)> {
        let mut temps = Vec::new();
        let mut artifacts = Vec::new();
        for dirent in fs::read_dir(&self.scratch_dir)? {
            let Ok(dirent) = dirent else { continue };
            let Ok(meta) = dirent.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let file_name = dirent.file_name().to_string_lossy().into_owned();
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if is_temp_name(&file_name) {
                temps.push(TempFile {
                    path: dirent.path(),
                    file_name,
                    modified,
                });
            } else if let Some(name) = ArtifactName::parse(&file_name) {
                artifacts.push(ScratchFile {
                    path: dirent.path(),
                    file_name,
                    name,
                    size: meta.len(),
                    modified,
                    undeletable: false,
                });
            }
        }
        Ok((temps, artifacts))
    }
}

fn age(now: SystemTime, modified: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}

fn is_not_found(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Layout;
    use crate::config::ManifestConfig;
    use crate::manifest::ManifestEntry;
    use std::fs::File;
    use std::path::Path;
    use std::process::{Command, Stdio};

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: Layout,
        manifest: ManifestStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        fs::create_dir_all(layout.scratch_dir()).unwrap();
        let manifest = ManifestStore::new(&layout, &ManifestConfig::default());
        Fixture {
            _dir: dir,
            layout,
            manifest,
        }
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy::from_config(&FewwordConfig::default())
    }

    fn put(f: &Fixture, name: &str, size: usize, modified: SystemTime) -> PathBuf {
        let path = f.layout.scratch_dir().join(name);
        fs::write(&path, vec![b'x'; size]).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        path
    }

    fn tombstones(f: &Fixture) -> Vec<String> {
        f.manifest
            .read_all(100)
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                ManifestEntry::Tombstone(t) => Some(t.id.to_string()),
                _ => None,
            })
            .collect()
    }

    fn on_disk(f: &Fixture) -> u64 {
        fs::read_dir(f.layout.scratch_dir())
            .unwrap()
            .map(|d| d.unwrap().metadata().unwrap().len())
            .sum()
    }

    fn name_of(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    /// Holds one file immutable (`chattr +i`) until dropped.
    struct Immutable(PathBuf);

    impl Immutable {
        /// `None` when this user or filesystem cannot set the flag.
        fn set(path: &Path) -> Option<Self> {
            let ok = Command::new("chattr")
                .arg("+i")
                .arg(path)
                .stderr(Stdio::null())
                .status()
                .is_ok_and(|s| s.success());
            ok.then(|| Self(path.to_path_buf()))
        }
    }

    impl Drop for Immutable {
        fn drop(&mut self) {
            let _ = Command::new("chattr").arg("-i").arg(&self.0).status();
        }
    }

    /// Makes a directory read-only until dropped.
    #[cfg(unix)]
    struct ReadOnlyDir(PathBuf);

    #[cfg(unix)]
    impl ReadOnlyDir {
        /// `None` when directory permissions do not bind this user.
        fn set(dir: &Path) -> Option<Self> {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o555)).ok()?;
            let guard = Self(dir.to_path_buf());
            let check = dir.join("write_check");
            if fs::write(&check, b"").is_ok() {
                let _ = fs::remove_file(&check);
                return None;
            }
            Some(guard)
        }
    }

    #[cfg(unix)]
    impl Drop for ReadOnlyDir {
        fn drop(&mut self) {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.0, fs::Permissions::from_mode(0o755));
        }
    }

    #[test]
    fn test_class_of_exit_code() {
        assert_eq!(RetentionClass::of(Some(0)), RetentionClass::Success);
        assert_eq!(RetentionClass::of(Some(2)), RetentionClass::Failure);
        assert_eq!(RetentionClass::of(None), LEGACY_CLASS);
        assert_eq!(LEGACY_CLASS, RetentionClass::Success);
    }

    #[test]
    fn test_missing_scratch_dir_is_empty_pass() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let manifest = ManifestStore::new(&layout, &ManifestConfig::default());
        let report = RetentionManager::new(layout.scratch_dir(), &manifest, policy())
            .sweep(SystemTime::now())
            .unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn test_ttl_by_class() {
        let f = fixture();
        let base = SystemTime::now();
        put(&f, "ok_20260101_000000_00000001_exit0.txt", 10, base);
        put(&f, "bad_20260101_000000_00000002_exit1.txt", 10, base);
        put(&f, "old_20260101_000000_00000003.txt", 10, base);

        let mgr = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, policy());

        // 25h: past the success TTL (24h), inside the failure TTL (48h).
        let report = mgr.sweep(base + 25 * HOUR).unwrap();
        let mut removed: Vec<String> = report.ttl_removed.iter().map(|i| i.to_string()).collect();
        removed.sort();
        assert_eq!(removed, vec!["00000001", "00000003"]);
        assert_eq!(report.remaining_files, 1);
        assert_eq!(report.bytes_freed, 20);

        let mut stones = tombstones(&f);
        stones.sort();
        assert_eq!(stones, vec!["00000001", "00000003"]);

        let report = mgr.sweep(base + 49 * HOUR).unwrap();
        assert_eq!(report.ttl_removed.len(), 1);
        assert_eq!(tombstones(&f).len(), 3);
    }

    #[test]
    fn test_orphans_removed_after_grace_without_tombstone() {
        let f = fixture();
        let base = SystemTime::now();
        let young = put(&f, ".a.txt.AAAAAA.tmp", 5, base);
        let old = put(&f, ".b.txt.BBBBBB.tmp", 5, base - Duration::from_secs(600));

        let mgr = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, policy());
        let report = mgr.sweep(base).unwrap();
        assert_eq!(report.orphans_removed, vec![".b.txt.BBBBBB.tmp".to_string()]);
        assert!(young.exists());
        assert!(!old.exists());
        assert!(tombstones(&f).is_empty());
    }

    #[test]
    fn test_lru_oldest_first_honours_min_keep() {
        let f = fixture();
        let base = SystemTime::now();
        for i in 0..4u64 {
            put(
                &f,
                &format!("t_20260101_000000_0000000{i}_exit0.txt"),
                400 * 1024,
                base - Duration::from_secs(100 - i * 10),
            );
        }
        let mut p = policy();
        p.max_bytes = 1024 * 1024;
        let mgr = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, p);
        let report = mgr.sweep(base).unwrap();

        let removed: Vec<String> = report.lru_removed.iter().map(|i| i.to_string()).collect();
        assert_eq!(removed, vec!["00000000", "00000001"]);
        assert_eq!(report.remaining_files, 2);
        assert!(report.remaining_bytes <= 1024 * 1024);

        let mut p = policy();
        p.max_bytes = 1;
        p.min_keep = 1;
        let mgr = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, p);
        let report = mgr.sweep(base).unwrap();
        assert_eq!(report.lru_removed.len(), 1);
        assert_eq!(report.remaining_files, 1);
    }

    #[test]
    fn test_lru_ties_broken_by_name() {
        let f = fixture();
        let t = SystemTime::now() - HOUR;
        put(&f, "b_20260101_000000_0000000b_exit0.txt", 100, t);
        put(&f, "a_20260101_000000_0000000a_exit0.txt", 100, t);
        let mut p = policy();
        p.max_bytes = 150;
        let report = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, p)
            .sweep(SystemTime::now())
            .unwrap();
        assert_eq!(report.lru_removed[0].as_str(), "0000000a");
    }

    #[test]
    fn test_non_artifact_files_are_ignored() {
        let f = fixture();
        let base = SystemTime::now();
        let notes = put(&f, "notes.md", 10, base - 1000 * HOUR);
        let report = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, policy())
            .sweep(base)
            .unwrap();
        assert_eq!(report.removed_count(), 0);
        assert!(notes.exists());
    }

    #[test]
    fn test_failed_ttl_delete_still_counts_against_cap() {
        let f = fixture();
        let base = SystemTime::now();
        let stuck = put(&f, "a_20260101_000000_0000000a_exit0.txt", 600, base - 25 * HOUR);
        put(&f, "b_20260101_000000_0000000b_exit0.txt", 300, base - Duration::from_secs(60));
        put(&f, "c_20260101_000000_0000000c_exit0.txt", 300, base - Duration::from_secs(30));
        let Some(_lock) = Immutable::set(&stuck) else {
            eprintln!("chattr unavailable, skipping");
            return;
        };

        let mut p = policy();
        p.max_bytes = 700;
        let report = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, p)
            .sweep(base)
            .unwrap();

        assert_eq!(report.failed, vec![name_of(&stuck)]);
        assert!(report.ttl_removed.is_empty());
        let lru: Vec<&str> = report.lru_removed.iter().map(|i| i.as_str()).collect();
        assert_eq!(lru, vec!["0000000b", "0000000c"]);
        assert_eq!(report.remaining_files, 1);
        assert_eq!(report.remaining_bytes, 600);
        assert!(on_disk(&f) <= 700, "scratch over cap: {}", on_disk(&f));
        assert!(stuck.exists());

        let mut stones = tombstones(&f);
        stones.sort();
        assert_eq!(stones, vec!["0000000b", "0000000c"]);
    }

    #[test]
    fn test_failed_orphan_delete_is_reported() {
        let f = fixture();
        let base = SystemTime::now();
        let old = base - Duration::from_secs(600);
        let stuck = put(&f, ".a.txt.AAAAAA.tmp", 5, old);
        put(&f, ".b.txt.BBBBBB.tmp", 5, old);
        let Some(_lock) = Immutable::set(&stuck) else {
            eprintln!("chattr unavailable, skipping");
            return;
        };

        let report = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, policy())
            .sweep(base)
            .unwrap();
        assert_eq!(report.failed, vec![".a.txt.AAAAAA.tmp".to_string()]);
        assert_eq!(report.orphans_removed, vec![".b.txt.BBBBBB.tmp".to_string()]);
        assert!(tombstones(&f).is_empty());
    }

    #[test]
    fn test_failed_lru_delete_moves_on_to_next_oldest() {
        let f = fixture();
        let base = SystemTime::now();
        let mut paths = Vec::new();
        for i in 0..3u64 {
            paths.push(put(
                &f,
                &format!("t_20260101_000000_0000000{i}_exit0.txt"),
                400 * 1024,
                base - Duration::from_secs(100 - i * 10),
            ));
        }
        let Some(_lock) = Immutable::set(&paths[0]) else {
            eprintln!("chattr unavailable, skipping");
            return;
        };

        let mut p = policy();
        p.max_bytes = 1024 * 1024;
        let report = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, p)
            .sweep(base)
            .unwrap();

        assert_eq!(report.failed, vec![name_of(&paths[0])]);
        let lru: Vec<&str> = report.lru_removed.iter().map(|i| i.as_str()).collect();
        assert_eq!(lru, vec!["00000001"]);
        assert_eq!(report.remaining_files, 2);
        assert!(on_disk(&f) <= 1024 * 1024);
        assert_eq!(tombstones(&f), vec!["00000001"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_scratch_fails_every_delete_without_tombstones() {
        let f = fixture();
        let base = SystemTime::now();
        put(&f, ".x.txt.AAAAAA.tmp", 5, base - Duration::from_secs(600));
        let expired = put(&f, "a_20260101_000000_0000000a_exit0.txt", 600, base - 25 * HOUR);
        let b = put(&f, "b_20260101_000000_0000000b_exit0.txt", 300, base - Duration::from_secs(60));
        let c = put(&f, "c_20260101_000000_0000000c_exit0.txt", 300, base - Duration::from_secs(30));
        let Some(_lock) = ReadOnlyDir::set(&f.layout.scratch_dir()) else {
            eprintln!("permissions do not apply to this user, skipping");
            return;
        };

        let mut p = policy();
        p.max_bytes = 700;
        let report = RetentionManager::new(f.layout.scratch_dir(), &f.manifest, p)
            .sweep(base)
            .unwrap();

        assert_eq!(
            report.failed,
            vec![
                ".x.txt.AAAAAA.tmp".to_string(),
                name_of(&expired),
                name_of(&b),
                name_of(&c),
            ]
        );
        assert_eq!(report.removed_count(), 0);
        assert_eq!(report.bytes_freed, 0);
        assert_eq!(report.remaining_files, 3);
        assert_eq!(report.remaining_bytes, 1200);
        assert!(tombstones(&f).is_empty());
    }
}

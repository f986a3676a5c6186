//! On-disk manifest: an active JSONL file plus rotated monthly segments.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, warn};

use super::{ManifestEntry, TombstoneEntry};
use crate::artifact::{ArtifactId, Layout, MANIFEST_FILE};
use crate::config::ManifestConfig;
use crate::error::Result;

const SEGMENT_PREFIX: &str = "tool_outputs_";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// How an append was serialized against other writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// We held the exclusive advisory lock for the write.
    Exclusive,
    /// Another process held the lock; the line was written anyway.
    Contended,
    /// The platform or filesystem refused to lock; the line was written anyway.
    Unsupported,
}

/// Result of a newest-first read.
#[derive(Debug, Default)]
pub struct ReadReport {
    pub entries: Vec<ManifestEntry>,
    /// Lines skipped as blank, malformed or of an unknown type.
    pub skipped: usize,
    /// Files that could not be read at all.
    pub unreadable: Vec<PathBuf>,
}

/// What a rotation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub rotated_to: PathBuf,
    pub rotated_bytes: u64,
    pub pruned: Vec<PathBuf>,
}

/// Rotated segment ordering key: `(YYYY-MM, counter)`.
fn segment_key(file_name: &str) -> Option<(String, u32)> {
    let rest = file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    let (date, counter) = match rest.split_once('_') {
        Some((date, n)) => (date, n.parse::<u32>().ok()?),
        None => (rest, 0),
    };
    let valid = date.len() == 7
        && date.as_bytes()[4] == b'-'
        && date
            .bytes()
            .enumerate()
            .all(|(i, b)| i == 4 || b.is_ascii_digit());
    valid.then(|| (date.to_string(), counter))
}

/// The manifest of one workspace.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    index_dir: PathBuf,
    active: PathBuf,
    max_bytes: u64,
    keep_rotated: usize,
}

impl ManifestStore {
    pub fn new(layout: &Layout, config: &ManifestConfig) -> Self {
        let index_dir = layout.index_dir();
        Self {
            active: index_dir.join(MANIFEST_FILE),
            index_dir,
            max_bytes: config.max_bytes(),
            keep_rotated: config.keep_rotated,
        }
    }

    pub fn active_path(&self) -> &Path {
        &self.active
    }

    /// Append one record as a single line.
    ///
    /// The line is written with one `write_all` on an append-mode handle
    /// whether or not the advisory lock was obtained.
    pub fn append(&self, entry: &ManifestEntry) -> Result<LockOutcome> {
        fs::create_dir_all(&self.index_dir)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active)?;

        let outcome = match file.try_lock_exclusive() {
            Ok(()) => LockOutcome::Exclusive,
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => LockOutcome::Contended,
            Err(e) => {
                debug!(error = %e, "manifest lock unsupported");
                LockOutcome::Unsupported
            }
        };
        if outcome == LockOutcome::Contended {
            debug!(id = %entry.id(), "manifest lock contended, appending unlocked");
        }

        file.write_all(line.as_bytes())?;
        // Closing the handle releases the lock.
        Ok(outcome)
    }

    /// Append a tombstone for `id`.
    pub fn tombstone(&self, id: &ArtifactId, reason: &str, now: DateTime<Utc>) -> Result<LockOutcome> {
        self.append(&ManifestEntry::Tombstone(TombstoneEntry {
            id: id.clone(),
            deleted_at: now,
            reason: reason.to_string(),
        }))
    }

    /// Rotated segments, newest first.
    pub fn segments(&self) -> Result<Vec<PathBuf>> {
        let read = match fs::read_dir(&self.index_dir) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keyed = Vec::new();
        for dirent in read {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if let Some(key) = segment_key(&name) {
                keyed.push((key, dirent.path()));
            }
        }
        keyed.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(keyed.into_iter().map(|(_, p)| p).collect())
    }

    /// Up to `limit` records, newest first: the active file, then segments.
    pub fn read_all(&self, limit: usize) -> Result<Vec<ManifestEntry>> {
        Ok(self.scan(limit)?.entries)
    }

    /// Like [`ManifestStore::read_all`], also reporting what was skipped.
    pub fn scan(&self, limit: usize) -> Result<ReadReport> {
        let mut report = ReadReport::default();
        let mut files = vec![self.active.clone()];
        files.extend(self.segments()?);

        for path in files {
            if report.entries.len() >= limit {
                break;
            }
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "manifest file unreadable, skipped");
                    report.unreadable.push(path);
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&bytes);
            for line in text.lines().rev() {
                if report.entries.len() >= limit {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                match ManifestEntry::parse_line(line) {
                    Some(entry) => report.entries.push(entry),
                    None => report.skipped += 1,
                }
            }
        }

        if report.skipped > 0 {
            debug!(skipped = report.skipped, "manifest lines skipped");
        }
        Ok(report)
    }

    /// Rotate when the active file has grown past the size cap.
    pub fn rotate_if_oversized(&self, now: DateTime<Utc>) -> Result<Option<RotationReport>> {
        let size = match fs::metadata(&self.active) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if size <= self.max_bytes {
            return Ok(None);
        }
        self.rotate(now)
    }

    /// Rotate the active file now, if it holds anything.
    pub fn rotate(&self, now: DateTime<Utc>) -> Result<Option<RotationReport>> {
        let size = match fs::metadata(&self.active) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if size == 0 {
            return Ok(None);
        }

        let month = now.format("%Y-%m").to_string();
        let mut target = self
            .index_dir
            .join(format!("{SEGMENT_PREFIX}{month}{SEGMENT_SUFFIX}"));
        let mut counter = 1;
        while target.exists() {
            target = self
                .index_dir
                .join(format!("{SEGMENT_PREFIX}{month}_{counter}{SEGMENT_SUFFIX}"));
            counter += 1;
        }

        fs::rename(&self.active, &target)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active)?;

        let mut pruned = Vec::new();
        for old in self.segments()?.into_iter().skip(self.keep_rotated) {
            match fs::remove_file(&old) {
                Ok(()) => pruned.push(old),
                Err(e) => warn!(path = %old.display(), error = %e, "failed to prune manifest segment"),
            }
        }

        Ok(Some(RotationReport {
            rotated_to: target,
            rotated_bytes: size,
            pruned,
        }))
    }

    /// Number of auto-pin records across the whole manifest history.
    pub fn count_auto_pins(&self) -> Result<usize> {
        Ok(self
            .read_all(usize::MAX)?
            .iter()
            .filter(|e| matches!(e, ManifestEntry::Pin(p) if p.auto_pinned))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PinEntry;
    use chrono::TimeZone;

    fn store(dir: &Path, max_mb: u64, keep: usize) -> ManifestStore {
        let config = ManifestConfig {
            max_mb,
            keep_rotated: keep,
        };
        ManifestStore::new(&Layout::new(dir), &config)
    }

    fn at(month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, month, 15, 12, 0, 0).unwrap()
    }

    fn id(n: u32) -> ArtifactId {
        ArtifactId::parse(&format!("{n:08x}")).unwrap()
    }

    fn pin(n: u32, auto: bool) -> ManifestEntry {
        ManifestEntry::Pin(PinEntry {
            id: id(n),
            pinned_at: at(1),
            pinned_path: format!("p{n}"),
            auto_pinned: auto,
            reason: String::new(),
        })
    }

    #[test]
    fn test_segment_key_parsing() {
        assert_eq!(segment_key("tool_outputs_2026-03.jsonl"), Some(("2026-03".to_string(), 0)));
        assert_eq!(segment_key("tool_outputs_2026-03_2.jsonl"), Some(("2026-03".to_string(), 2)));
        assert_eq!(segment_key("tool_outputs.jsonl"), None);
        assert_eq!(segment_key("tool_outputs_2026-3.jsonl"), None);
        assert_eq!(segment_key("tool_outputs_2026-03_x.jsonl"), None);
    }

    #[test]
    fn test_append_and_read_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50, 5);
        for n in 1..=3 {
            let outcome = s.append(&pin(n, false)).unwrap();
            assert_ne!(outcome, LockOutcome::Contended);
        }
        let ids: Vec<_> = s.read_all(10).unwrap().iter().map(|e| e.id().clone()).collect();
        assert_eq!(ids, vec![id(3), id(2), id(1)]);
        assert_eq!(s.read_all(2).unwrap().len(), 2);
    }

    #[test]
    fn test_read_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50, 5);
        s.append(&pin(1, false)).unwrap();
        let mut f = OpenOptions::new().append(true).open(s.active_path()).unwrap();
        f.write_all(b"{\"type\":\"pin\",\"id\":\"trunc\n\n{\"type\":\"alien\"}\n").unwrap();
        drop(f);
        s.append(&pin(2, false)).unwrap();

        let report = s.scan(100).unwrap();
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn test_missing_manifest_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50, 5);
        assert!(s.read_all(10).unwrap().is_empty());
        assert!(s.rotate_if_oversized(at(1)).unwrap().is_none());
    }

    #[test]
    fn test_rotation_names_collisions_and_reads_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50, 5);

        s.append(&pin(1, false)).unwrap();
        let r1 = s.rotate(at(3)).unwrap().unwrap();
        assert!(r1.rotated_to.ends_with("tool_outputs_2026-03.jsonl"));

        s.append(&pin(2, false)).unwrap();
        let r2 = s.rotate(at(3)).unwrap().unwrap();
        assert!(r2.rotated_to.ends_with("tool_outputs_2026-03_1.jsonl"));

        s.append(&pin(3, false)).unwrap();
        assert!(fs::metadata(s.active_path()).unwrap().len() > 0);

        let ids: Vec<_> = s.read_all(10).unwrap().iter().map(|e| e.id().clone()).collect();
        assert_eq!(ids, vec![id(3), id(2), id(1)]);
    }

    #[test]
    fn test_rotation_skips_empty_and_prunes_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50, 2);
        assert!(s.rotate(at(1)).unwrap().is_none());

        for month in 1..=4 {
            s.append(&pin(month, false)).unwrap();
            s.rotate(at(month)).unwrap().unwrap();
        }
        let segments = s.segments().unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments[0].ends_with("tool_outputs_2026-04.jsonl"));
        assert!(segments[1].ends_with("tool_outputs_2026-03.jsonl"));
        assert_eq!(s.read_all(10).unwrap().len(), 2);
    }

    #[test]
    fn test_rotate_if_oversized_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 1, 5);
        s.append(&pin(1, false)).unwrap();
        assert!(s.rotate_if_oversized(at(1)).unwrap().is_none());

        // Exactly at the cap: not yet oversized.
        let f = OpenOptions::new().write(true).open(s.active_path()).unwrap();
        f.set_len(1024 * 1024).unwrap();
        drop(f);
        assert!(s.rotate_if_oversized(at(1)).unwrap().is_none());

        s.append(&pin(2, false)).unwrap();
        let report = s.rotate_if_oversized(at(1)).unwrap().unwrap();
        assert!(report.rotated_bytes > 1024 * 1024);
        assert_eq!(fs::metadata(s.active_path()).unwrap().len(), 0);
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        const WRITERS: u32 = 8;
        const PER_WRITER: u32 = 200;

        let dir = tempfile::tempdir().unwrap();
        std::thread::scope(|scope| {
            for w in 0..WRITERS {
                let root = dir.path();
                scope.spawn(move || {
                    let s = store(root, 50, 5);
                    for n in 0..PER_WRITER {
                        s.append(&pin(w * PER_WRITER + n, false)).unwrap();
                    }
                });
            }
        });

        let report = store(dir.path(), 50, 5).scan(usize::MAX).unwrap();
        assert_eq!(report.skipped, 0);
        assert_eq!(report.entries.len(), (WRITERS * PER_WRITER) as usize);

        let mut ids: Vec<_> = report.entries.iter().map(|e| e.id().clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), (WRITERS * PER_WRITER) as usize);
    }

    #[test]
    fn test_count_auto_pins() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50, 5);
        s.append(&pin(1, true)).unwrap();
        s.append(&pin(2, false)).unwrap();
        s.rotate(at(1)).unwrap();
        s.append(&pin(3, true)).unwrap();
        assert_eq!(s.count_auto_pins().unwrap(), 2);
    }

    #[test]
    fn test_tombstone_append() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), 50, 5);
        s.tombstone(&id(7), "ttl", at(2)).unwrap();
        let entries = s.read_all(1).unwrap();
        assert!(matches!(&entries[0], ManifestEntry::Tombstone(t) if t.reason == "ttl" && t.id == id(7)));
    }
}

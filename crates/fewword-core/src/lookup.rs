//! Recent-artifact listing and selector resolution.
//!
//! Both work on a bounded window of the newest manifest records. Tombstones
//! and pins are always newer than the record they refer to, so folding the
//! window gives the same state for every record inside it as folding the
//! whole history.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::artifact::{resolve_path, ArtifactId, Layout};
use crate::error::{FewwordError, Result};
use crate::manifest::{fold_entries, ArtifactState, ManifestEntry, ManifestStore};

/// A content record whose content can still be read.
#[derive(Debug, Clone, Serialize)]
pub struct RecentItem {
    /// 1-based position, newest first. Usable as a selector.
    pub number: usize,
    /// `42s`, `5m`, `3h`, `2d`.
    pub age: String,
    /// Scratch file gone, only the pinned copy remains.
    pub pinned_only: bool,
    pub pinned: bool,
    pub entry: ManifestEntry,
}

/// Compact age label.
pub fn human_age(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

fn is_content_record(entry: &ManifestEntry) -> bool {
    matches!(
        entry,
        ManifestEntry::Offload(_) | ManifestEntry::Manual(_) | ManifestEntry::Export(_)
    )
}

struct Window {
    /// Newest first.
    entries: Vec<ManifestEntry>,
    states: BTreeMap<ArtifactId, ArtifactState>,
}

/// Read-only queries over the newest manifest records.
pub struct Lookup<'a> {
    layout: &'a Layout,
    manifest: &'a ManifestStore,
    scan_cap: usize,
}

impl<'a> Lookup<'a> {
    pub fn new(layout: &'a Layout, manifest: &'a ManifestStore, scan_cap: usize) -> Self {
        Self {
            layout,
            manifest,
            scan_cap,
        }
    }

    fn window(&self) -> Result<Window> {
        let entries = self.manifest.read_all(self.scan_cap)?;
        let states = fold_entries(entries.iter().rev().cloned());
        Ok(Window { entries, states })
    }

    /// Where the content of `entry` can be read now: the scratch file when
    /// live, else the pinned copy.
    fn locate(&self, window: &Window, entry: &ManifestEntry) -> Option<(PathBuf, bool)> {
        let state = window.states.get(entry.id())?;
        if state.is_live(self.layout) {
            let path = resolve_path(&self.layout.absolute(entry.content_path()?))?;
            return Some((path, false));
        }
        state.live_pin_path(self.layout).map(|p| (p, true))
    }

    fn available<'w>(&self, window: &'w Window) -> Vec<&'w ManifestEntry> {
        window
            .entries
            .iter()
            .filter(|e| is_content_record(e) && self.locate(window, e).is_some())
            .collect()
    }

    /// Readable content records, newest first.
    pub fn recent(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<RecentItem>> {
        let window = self.window()?;
        let mut items = Vec::new();
        for entry in window.entries.iter().filter(|e| is_content_record(e)) {
            if items.len() >= limit {
                break;
            }
            let Some((_, pinned_only)) = self.locate(&window, entry) else {
                continue;
            };
            let pinned = window
                .states
                .get(entry.id())
                .is_some_and(ArtifactState::is_pinned);
            items.push(RecentItem {
                number: items.len() + 1,
                age: human_age((now - entry.timestamp()).num_seconds()),
                pinned_only,
                pinned,
                entry: entry.clone(),
            });
        }
        Ok(items)
    }

    /// Resolve a selector to a content record.
    ///
    /// Tried in order: an 8-hex id, a 1-based recent number, a command token
    /// (latest readable offload), a title (latest readable manual or export,
    /// case-insensitive).
    pub fn resolve(&self, selector: &str) -> Result<ManifestEntry> {
        let selector = selector.trim();
        let not_found = || FewwordError::EntryNotFound(selector.to_string());
        if selector.is_empty() {
            return Err(not_found());
        }

        if let Ok(id) = ArtifactId::parse(selector) {
            if let Some(entry) = self.find_by_id(&id)? {
                return Ok(entry);
            }
        }

        let window = self.window()?;
        let available = self.available(&window);
        if let Ok(n) = selector.parse::<usize>() {
            return n
                .checked_sub(1)
                .and_then(|i| available.get(i))
                .map(|e| (*e).clone())
                .ok_or_else(not_found);
        }

        let by_token = available
            .iter()
            .find(|e| matches!(e, ManifestEntry::Offload(o) if o.cmd == selector));
        if let Some(entry) = by_token {
            return Ok((*entry).clone());
        }

        let wanted = selector.to_lowercase();
        available
            .iter()
            .find(|e| match e {
                ManifestEntry::Manual(m) => m.title.to_lowercase() == wanted,
                ManifestEntry::Export(x) => x.title.to_lowercase() == wanted,
                _ => false,
            })
            .map(|e| (*e).clone())
            .ok_or_else(not_found)
    }

    /// Latest content record for `id` across the whole history.
    pub fn find_by_id(&self, id: &ArtifactId) -> Result<Option<ManifestEntry>> {
        Ok(self
            .manifest
            .read_all(usize::MAX)?
            .into_iter()
            .find(|e| is_content_record(e) && e.id() == id))
    }

    /// Path of the readable content for `entry`.
    pub fn content_path(&self, entry: &ManifestEntry) -> Result<PathBuf> {
        let window = self.window()?;
        match self.locate(&window, entry) {
            Some((path, _)) => Ok(path),
            None => self.locate_outside_window(entry),
        }
    }

    fn locate_outside_window(&self, entry: &ManifestEntry) -> Result<PathBuf> {
        let states = fold_entries(self.manifest.read_all(usize::MAX)?.into_iter().rev());
        let state = states
            .get(entry.id())
            .ok_or_else(|| FewwordError::ArtifactNotFound(entry.id().to_string()))?;
        if state.is_live(self.layout) {
            if let Some(path) = entry
                .content_path()
                .and_then(|p| resolve_path(&self.layout.absolute(p)))
            {
                return Ok(path);
            }
        }
        state
            .live_pin_path(self.layout)
            .ok_or_else(|| FewwordError::ArtifactNotFound(entry.id().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::write_atomic;
    use crate::config::ManifestConfig;
    use crate::manifest::{ManualEntry, OffloadEntry, PinEntry};

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: Layout,
        manifest: ManifestStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let manifest = ManifestStore::new(&layout, &ManifestConfig::default());
        Fixture {
            _dir: dir,
            layout,
            manifest,
        }
    }

    fn offload(f: &Fixture, id: &str, cmd: &str, minute: u32) -> ArtifactId {
        let id = ArtifactId::parse(id).unwrap();
        let path = write_atomic(
            &f.layout.scratch_dir(),
            &format!("{cmd}_20260101_0000{minute:02}_{id}_exit0.txt"),
            b"output\n",
        )
        .unwrap();
        f.manifest
            .append(&ManifestEntry::Offload(OffloadEntry {
                id: id.clone(),
                session_id: "s".to_string(),
                created_at: format!("2026-01-01T00:{minute:02}:00Z").parse().unwrap(),
                cmd: cmd.to_string(),
                cmd_group: cmd.to_string(),
                exit_code: Some(0),
                bytes: 7,
                lines: 1,
                path: f.layout.relative(&path),
                summary: String::new(),
                failure_sig: None,
            }))
            .unwrap();
        id
    }

    #[test]
    fn test_human_age() {
        assert_eq!(human_age(-5), "0s");
        assert_eq!(human_age(42), "42s");
        assert_eq!(human_age(300), "5m");
        assert_eq!(human_age(3 * 3600 + 10), "3h");
        assert_eq!(human_age(2 * 86_400), "2d");
    }

    #[test]
    fn test_recent_lists_newest_first_and_skips_missing() {
        let f = fixture();
        let a = offload(&f, "aaaa0001", "cargo", 1);
        let b = offload(&f, "bbbb0002", "pytest", 2);
        let c = offload(&f, "cccc0003", "npm", 3);
        std::fs::remove_file(f.layout.scratch_dir().join(format!("npm_20260101_000003_{c}_exit0.txt")))
            .unwrap();

        let lookup = Lookup::new(&f.layout, &f.manifest, 100);
        let now = "2026-01-01T00:10:00Z".parse().unwrap();
        let items = lookup.recent(10, now).unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.entry.id().clone()).collect();
        assert_eq!(ids, vec![b, a]);
        assert_eq!(items[0].number, 1);
        assert_eq!(items[0].age, "8m");
    }

    #[test]
    fn test_resolve_selectors() {
        let f = fixture();
        let a = offload(&f, "aaaa0001", "cargo", 1);
        let b = offload(&f, "bbbb0002", "pytest", 2);
        let lookup = Lookup::new(&f.layout, &f.manifest, 100);

        assert_eq!(lookup.resolve("1").unwrap().id(), &b);
        assert_eq!(lookup.resolve("2").unwrap().id(), &a);
        assert!(lookup.resolve("3").is_err());
        assert!(lookup.resolve("0").is_err());
        assert_eq!(lookup.resolve("AAAA0001").unwrap().id(), &a);
        assert_eq!(lookup.resolve("cargo").unwrap().id(), &a);
        assert!(matches!(
            lookup.resolve("make"),
            Err(FewwordError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_title_case_insensitive() {
        let f = fixture();
        let id = ArtifactId::parse("dddd0004").unwrap();
        let path = write_atomic(&f.layout.scratch_dir(), "manual_20260101_000000_dddd0004.txt", b"notes").unwrap();
        f.manifest
            .append(&ManifestEntry::Manual(ManualEntry {
                id: id.clone(),
                session_id: "s".to_string(),
                created_at: Utc::now(),
                title: "Build Notes".to_string(),
                source: "user".to_string(),
                bytes: 5,
                lines: 0,
                path: f.layout.relative(&path),
            }))
            .unwrap();
        let lookup = Lookup::new(&f.layout, &f.manifest, 100);
        assert_eq!(lookup.resolve("build notes").unwrap().id(), &id);
    }

    #[test]
    fn test_content_falls_back_to_pin() {
        let f = fixture();
        let a = offload(&f, "aaaa0001", "cargo", 1);
        let pinned = write_atomic(&f.layout.pinned_dir(), "cargo_pin.txt", b"output\n").unwrap();
        f.manifest
            .append(&ManifestEntry::Pin(PinEntry {
                id: a.clone(),
                pinned_at: Utc::now(),
                pinned_path: f.layout.relative(&pinned),
                auto_pinned: false,
                reason: "manual".to_string(),
            }))
            .unwrap();
        f.manifest.tombstone(&a, "ttl", Utc::now()).unwrap();

        let lookup = Lookup::new(&f.layout, &f.manifest, 100);
        let entry = lookup.resolve("aaaa0001").unwrap();
        assert_eq!(lookup.content_path(&entry).unwrap(), pinned);

        let items = lookup.recent(5, Utc::now()).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].pinned_only);
    }
}

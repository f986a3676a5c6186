//! Folding manifest records into per-artifact state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{ManifestEntry, PinEntry};
use crate::artifact::{resolve_path, ArtifactId, Layout};

/// Current state of one artifact id.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactState {
    pub id: ArtifactId,
    /// The offload, manual or export record that created the artifact.
    pub record: Option<ManifestEntry>,
    /// Set by the first tombstone.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Latest pin wins.
    pub pin: Option<PinEntry>,
}

impl ArtifactState {
    fn new(id: ArtifactId) -> Self {
        Self {
            id,
            record: None,
            deleted_at: None,
            pin: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }

    /// Not tombstoned and the scratch file is still on disk.
    ///
    /// The manifest is only an index; a file removed behind its back is not live.
    pub fn is_live(&self, layout: &Layout) -> bool {
        if self.is_deleted() {
            return false;
        }
        self.record
            .as_ref()
            .and_then(ManifestEntry::content_path)
            .is_some_and(|p| resolve_path(&layout.absolute(p)).is_some())
    }

    /// The pinned copy, if one is recorded and present on disk.
    pub fn live_pin_path(&self, layout: &Layout) -> Option<std::path::PathBuf> {
        self.pin
            .as_ref()
            .and_then(|p| resolve_path(&layout.absolute(&p.pinned_path)))
    }
}

/// Fold records given in append order (oldest first).
pub fn fold_entries<I>(entries: I) -> BTreeMap<ArtifactId, ArtifactState>
where
    I: IntoIterator<Item = ManifestEntry>,
{
    let mut states: BTreeMap<ArtifactId, ArtifactState> = BTreeMap::new();
    for entry in entries {
        let state = states
            .entry(entry.id().clone())
            .or_insert_with(|| ArtifactState::new(entry.id().clone()));
        match entry {
            ManifestEntry::Offload(_) | ManifestEntry::Manual(_) | ManifestEntry::Export(_) => {
                if state.record.is_none() {
                    state.record = Some(entry);
                }
            }
            ManifestEntry::Pin(pin) => state.pin = Some(pin),
            ManifestEntry::Tombstone(t) => {
                if state.deleted_at.is_none() {
                    state.deleted_at = Some(t.deleted_at);
                }
            }
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{OffloadEntry, TombstoneEntry};

    fn id() -> ArtifactId {
        ArtifactId::parse("a1b2c3d4").unwrap()
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn offload(path: &str) -> ManifestEntry {
        ManifestEntry::Offload(OffloadEntry {
            id: id(),
            session_id: String::new(),
            created_at: ts("2026-01-01T00:00:00Z"),
            cmd: "pytest".to_string(),
            cmd_group: "pytest".to_string(),
            exit_code: Some(1),
            bytes: 3,
            lines: 1,
            path: path.to_string(),
            summary: String::new(),
            failure_sig: None,
        })
    }

    fn pin(path: &str, at: &str) -> ManifestEntry {
        ManifestEntry::Pin(PinEntry {
            id: id(),
            pinned_at: ts(at),
            pinned_path: path.to_string(),
            auto_pinned: false,
            reason: String::new(),
        })
    }

    fn tombstone() -> ManifestEntry {
        ManifestEntry::Tombstone(TombstoneEntry {
            id: id(),
            deleted_at: ts("2026-01-03T00:00:00Z"),
            reason: "ttl".to_string(),
        })
    }

    #[test]
    fn test_pin_then_tombstone_is_deleted_and_pinned() {
        let states = fold_entries(vec![
            offload("s.txt"),
            pin("p1.txt", "2026-01-02T00:00:00Z"),
            tombstone(),
        ]);
        let s = &states[&id()];
        assert!(s.is_deleted());
        assert!(s.is_pinned());
        assert!(s.record.is_some());
    }

    #[test]
    fn test_latest_pin_wins() {
        let states = fold_entries(vec![
            offload("s.txt"),
            pin("p1.txt", "2026-01-02T00:00:00Z"),
            pin("p2.txt", "2026-01-04T00:00:00Z"),
        ]);
        assert_eq!(states[&id()].pin.as_ref().unwrap().pinned_path, "p2.txt");
    }

    #[test]
    fn test_is_live_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::write(dir.path().join("s.txt"), "abc").unwrap();

        let states = fold_entries(vec![offload("s.txt")]);
        assert!(states[&id()].is_live(&layout));

        std::fs::remove_file(dir.path().join("s.txt")).unwrap();
        assert!(!states[&id()].is_live(&layout));
    }

    #[test]
    fn test_tombstoned_is_not_live_even_if_file_remains() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::write(dir.path().join("s.txt"), "abc").unwrap();
        let states = fold_entries(vec![offload("s.txt"), tombstone()]);
        assert!(!states[&id()].is_live(&layout));
    }

    #[test]
    fn test_orphan_pin_without_record() {
        let states = fold_entries(vec![pin("p.txt", "2026-01-02T00:00:00Z")]);
        let s = &states[&id()];
        assert!(s.record.is_none());
        assert!(s.is_pinned());
    }
}

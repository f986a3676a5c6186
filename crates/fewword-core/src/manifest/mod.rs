//! Append-only manifest of artifact lifecycle records.
//!
//! One JSON object per line, tagged by `"type"`. The state of an artifact is
//! the fold of every record carrying its id, in append order
//! (see [`fold`]). Records are never rewritten; deletion appends a
//! tombstone and rotation only ever drops whole segments.

pub mod fold;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactId;
use crate::signature::FailureSignature;

pub use fold::{fold_entries, ArtifactState};
pub use store::{LockOutcome, ManifestStore, ReadReport, RotationReport};

/// A captured command output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadEntry {
    pub id: ArtifactId,
    #[serde(default)]
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// Command token only. Never the full command line.
    pub cmd: String,
    #[serde(default)]
    pub cmd_group: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub bytes: u64,
    #[serde(default)]
    pub lines: u64,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_sig: Option<FailureSignature>,
}

impl OffloadEntry {
    /// Group used for correlation; falls back to the token for old records.
    pub fn group(&self) -> &str {
        if self.cmd_group.is_empty() {
            &self.cmd
        } else {
            &self.cmd_group
        }
    }

    pub fn is_failure(&self) -> bool {
        crate::tiering::is_failure(self.exit_code)
    }
}

/// Content saved explicitly under a title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub id: ArtifactId,
    #[serde(default)]
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    #[serde(default)]
    pub source: String,
    pub bytes: u64,
    #[serde(default)]
    pub lines: u64,
    pub path: String,
}

/// Content written to the exports directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub id: ArtifactId,
    #[serde(default)]
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub bytes: u64,
    #[serde(default)]
    pub lines: u64,
    pub path: String,
}

/// A durable copy of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinEntry {
    pub id: ArtifactId,
    pub pinned_at: DateTime<Utc>,
    pub pinned_path: String,
    #[serde(default)]
    pub auto_pinned: bool,
    #[serde(default)]
    pub reason: String,
}

/// Marks the scratch copy of an artifact deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneEntry {
    pub id: ArtifactId,
    pub deleted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManifestEntry {
    Offload(OffloadEntry),
    Manual(ManualEntry),
    Export(ExportEntry),
    Pin(PinEntry),
    Tombstone(TombstoneEntry),
}

impl ManifestEntry {
    pub fn id(&self) -> &ArtifactId {
        match self {
            ManifestEntry::Offload(e) => &e.id,
            ManifestEntry::Manual(e) => &e.id,
            ManifestEntry::Export(e) => &e.id,
            ManifestEntry::Pin(e) => &e.id,
            ManifestEntry::Tombstone(e) => &e.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ManifestEntry::Offload(_) => "offload",
            ManifestEntry::Manual(_) => "manual",
            ManifestEntry::Export(_) => "export",
            ManifestEntry::Pin(_) => "pin",
            ManifestEntry::Tombstone(_) => "tombstone",
        }
    }

    /// When the record was written.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ManifestEntry::Offload(e) => e.created_at,
            ManifestEntry::Manual(e) => e.created_at,
            ManifestEntry::Export(e) => e.created_at,
            ManifestEntry::Pin(e) => e.pinned_at,
            ManifestEntry::Tombstone(e) => e.deleted_at,
        }
    }

    /// Content path for records that describe content.
    pub fn content_path(&self) -> Option<&str> {
        match self {
            ManifestEntry::Offload(e) => Some(&e.path),
            ManifestEntry::Manual(e) => Some(&e.path),
            ManifestEntry::Export(e) => Some(&e.path),
            ManifestEntry::Pin(e) => Some(&e.pinned_path),
            ManifestEntry::Tombstone(_) => None,
        }
    }

    /// Short label for listings: command token or title.
    pub fn label(&self) -> &str {
        match self {
            ManifestEntry::Offload(e) => &e.cmd,
            ManifestEntry::Manual(e) => &e.title,
            ManifestEntry::Export(e) => &e.title,
            ManifestEntry::Pin(e) => &e.reason,
            ManifestEntry::Tombstone(e) => &e.reason,
        }
    }

    /// Parse one line. `None` for blank, malformed or unknown-type lines.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    pub fn as_offload(&self) -> Option<&OffloadEntry> {
        match self {
            ManifestEntry::Offload(e) => Some(e),
            _ => None,
        }
    }
}

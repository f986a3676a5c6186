//! Pinning: durable copies outside the scratch directory.
//!
//! Auto-pin rules are checked once per persisted artifact, in a fixed order:
//! `on_fail`, `exit_codes`, `cmds`, `size_min`, `match`. The first rule that
//! fires names the pin reason. Once the manifest holds `max_files` auto-pin
//! records, no further auto-pins happen.

use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;

use crate::artifact::{read_artifact, write_atomic, ArtifactId, Layout, COMPRESSED_SUFFIX};
use crate::config::AutoPinConfig;
use crate::error::{FewwordError, Result};
use crate::manifest::{ManifestEntry, ManifestStore, PinEntry};
use crate::tiering::is_failure;

/// Only this much content is searched by the `match` rule.
pub const MATCH_SCAN_BYTES: usize = 100 * 1024;

/// Facts about a freshly persisted artifact.
#[derive(Debug, Clone)]
pub struct PinCandidate<'a> {
    pub id: &'a ArtifactId,
    pub token: &'a str,
    pub group: &'a str,
    pub exit_code: Option<i32>,
    pub bytes: u64,
    /// Redacted content as persisted.
    pub content: &'a str,
}

/// Compiled auto-pin rules.
#[derive(Debug)]
pub struct AutoPinRules {
    config: AutoPinConfig,
    matcher: Option<Regex>,
    diagnostics: Vec<String>,
}

impl AutoPinRules {
    pub fn new(config: &AutoPinConfig) -> Self {
        let mut diagnostics = Vec::new();
        let matcher = if config.match_pattern.is_empty() {
            None
        } else {
            match Regex::new(&config.match_pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    let err = FewwordError::invalid_pattern("auto_pin.match", &e);
                    warn!(error = %err, "auto_pin.match rule disabled");
                    diagnostics.push(format!("{err}, rule disabled"));
                    None
                }
            }
        };
        Self {
            config: config.clone(),
            matcher,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn max_files(&self) -> usize {
        self.config.max_files
    }

    pub fn any_rule(&self) -> bool {
        self.config.any_rule()
    }

    /// The reason of the first rule that fires, if any.
    pub fn evaluate(&self, candidate: &PinCandidate<'_>) -> Option<String> {
        let c = &self.config;
        if c.on_fail && is_failure(candidate.exit_code) {
            return Some("auto_pin.on_fail".to_string());
        }
        if let Some(code) = candidate.exit_code.filter(|code| c.exit_codes.contains(code)) {
            return Some(format!("auto_pin.exit_codes ({code})"));
        }
        if c.cmds.iter().any(|cmd| cmd == candidate.token || cmd == candidate.group) {
            return Some(format!("auto_pin.cmds ({})", candidate.token));
        }
        if c.size_min > 0 && candidate.bytes >= c.size_min {
            return Some(format!("auto_pin.size_min ({} >= {})", candidate.bytes, c.size_min));
        }
        if let Some(re) = &self.matcher {
            if re.is_match(prefix(candidate.content, MATCH_SCAN_BYTES)) {
                return Some("auto_pin.match".to_string());
            }
        }
        None
    }
}

/// Longest prefix of at most `max` bytes ending on a char boundary.
fn prefix(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Copy an artifact into the pinned directory and record the pin.
///
/// Compressed artifacts are pinned as plain text.
pub fn pin_artifact(
    layout: &Layout,
    manifest: &ManifestStore,
    id: &ArtifactId,
    source: &Path,
    reason: &str,
    auto_pinned: bool,
    now: DateTime<Utc>,
) -> Result<PinEntry> {
    let content = read_artifact(source)?;
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| FewwordError::ArtifactNotFound(source.display().to_string()))?;
    let stem = file_name
        .trim_end_matches(COMPRESSED_SUFFIX)
        .trim_end_matches(".txt");

    let dest = write_atomic(&layout.pinned_dir(), &format!("{stem}_{id}.txt"), content.as_bytes())?;
    let entry = PinEntry {
        id: id.clone(),
        pinned_at: now,
        pinned_path: layout.relative(&dest),
        auto_pinned,
        reason: reason.to_string(),
    };
    manifest.append(&ManifestEntry::Pin(entry.clone()))?;
    Ok(entry)
}

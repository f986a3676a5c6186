//! The capture engine: the single entry point callers drive.
//!
//! [`Engine::capture`] runs one completed command output through redaction,
//! tiering, persistence, indexing, auto-pin, compression and retention.
//! Every engine operation degrades instead of failing: storage errors are
//! logged through [`crate::obs`] and surface as a "not stored" outcome, an
//! empty listing or a `None`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::artifact::{
    compress_file, read_artifact, resolve_path, write_atomic, ArtifactId, ArtifactName, Layout,
    COMPRESSED_SUFFIX,
};
use crate::autopin::{pin_artifact, AutoPinRules, PinCandidate};
use crate::command::{command_token, resolve_group};
use crate::config::FewwordConfig;
use crate::correlation::{correlation_summary, Correlation, Correlator, FailureCluster};
use crate::error::{FewwordError, Result};
use crate::lookup::{Lookup, RecentItem};
use crate::manifest::{
    ExportEntry, ManifestEntry, ManifestStore, ManualEntry, OffloadEntry, PinEntry, RotationReport,
};
use crate::obs::{
    emit_artifact_persisted, emit_auto_pinned, emit_capture_decided, emit_manifest_rotated,
    emit_storage_error, emit_sweep_finished, CaptureSpan,
};
use crate::redact::{RedactionMatch, RedactionResult, Redactor};
use crate::retention::{RetentionManager, RetentionPolicy, SweepReport};
use crate::signature::SignatureExtractor;
use crate::summary::SummaryExtractor;
use crate::tiering::{
    human_size, is_failure, line_count, plan, render_pointer, render_preview, tail_lines, DenyPolicy,
    Plan, PointerInfo, Tier,
};

/// Records scanned by listing and selector queries.
const LOOKUP_SCAN_CAP: usize = 5000;

/// One completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub output: String,
    /// `None` when the caller does not know it.
    pub exit_code: Option<i32>,
    /// Full command line. Only its token and group reach disk.
    pub command: String,
    pub session_id: String,
}

/// What the caller shows in place of the raw output.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// Small enough to show as is (redacted).
    Inline { text: String },
    /// Persisted; show the pointer and, for failures, a bounded preview.
    Pointer {
        id: ArtifactId,
        tier: Tier,
        pointer: String,
        preview: Option<String>,
        /// Similar past failures, when hints are enabled.
        hint: Option<String>,
    },
    /// Nothing was persisted.
    NotStored {
        notice: String,
        preview: Option<String>,
    },
}

impl CaptureOutcome {
    /// Text to show the caller.
    pub fn render(&self) -> String {
        match self {
            CaptureOutcome::Inline { text } => text.clone(),
            CaptureOutcome::Pointer {
                pointer,
                preview,
                hint,
                ..
            } => {
                let mut out = pointer.clone();
                for extra in [preview, hint].into_iter().flatten() {
                    out.push('\n');
                    out.push_str(extra);
                }
                out
            }
            CaptureOutcome::NotStored { notice, preview } => match preview {
                Some(p) => format!("{notice}\n{p}"),
                None => notice.clone(),
            },
        }
    }

    pub fn id(&self) -> Option<&ArtifactId> {
        match self {
            CaptureOutcome::Pointer { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Result of a manual save or export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoreOutcome {
    Stored { id: ArtifactId, path: String },
    NotStored { notice: String },
}

/// Disk usage across the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub manifest_bytes: u64,
    pub manifest_segments: usize,
    pub scratch_files: usize,
    pub scratch_bytes: u64,
    pub compressed_files: usize,
    pub plain_files: usize,
    pub pinned_files: usize,
    pub pinned_bytes: u64,
    pub export_files: usize,
}

/// Everything needed to act on one workspace.
pub struct Engine {
    layout: Layout,
    config: FewwordConfig,
    manifest: ManifestStore,
    redactor: Redactor,
    deny: DenyPolicy,
    auto_pin: AutoPinRules,
    signatures: SignatureExtractor,
    summaries: SummaryExtractor,
}

impl Engine {
    /// Compile every policy table once. Invalid patterns become diagnostics.
    pub fn new(root: impl Into<PathBuf>, config: FewwordConfig) -> Self {
        let config = config.sanitized();
        let layout = Layout::new(root);
        Self {
            manifest: ManifestStore::new(&layout, &config.manifest),
            redactor: Redactor::new(&config.redaction),
            deny: DenyPolicy::new(&config.deny),
            auto_pin: AutoPinRules::new(&config.auto_pin),
            signatures: SignatureExtractor::new(),
            summaries: SummaryExtractor::new(&config.summary),
            layout,
            config,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &FewwordConfig {
        &self.config
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    /// Problems found while compiling configured patterns.
    pub fn diagnostics(&self) -> Vec<String> {
        self.redactor
            .diagnostics()
            .iter()
            .chain(self.deny.diagnostics())
            .chain(self.auto_pin.diagnostics())
            .cloned()
            .collect()
    }

    pub fn redact_text(&self, text: &str) -> RedactionResult {
        self.redactor.redact(text)
    }

    /// Rules that would fire on `text`, with secret lengths only.
    pub fn redaction_matches(&self, text: &str) -> Vec<RedactionMatch> {
        self.redactor.scan(text)
    }

    /// Handle one completed command.
    ///
    /// Writes at most one artifact file and one offload record, plus one pin
    /// record when an auto-pin rule fires.
    pub fn capture(&self, request: &CaptureRequest) -> CaptureOutcome {
        let token = command_token(&request.command);
        let _span = CaptureSpan::enter(&token, &request.session_id);
        let group = resolve_group(&token, &request.command, &self.config.aliases);

        let redacted = self.redactor.redact(&request.output);
        let size = redacted.text.len() as u64;
        let decided = plan(
            size,
            &self.config.thresholds,
            &self.deny,
            &token,
            &group,
            &request.command,
        );

        match decided {
            Plan::Inline => {
                emit_capture_decided(&token, "inline", size, "inline");
                CaptureOutcome::Inline {
                    text: redacted.text,
                }
            }
            Plan::Deny { tier, reason } => {
                emit_capture_decided(&token, &tier.to_string(), size, "denied");
                CaptureOutcome::NotStored {
                    notice: format!(
                        "[fw] {token} e={} {}: not stored, {reason}",
                        exit_label(request.exit_code),
                        human_size(size),
                    ),
                    preview: None,
                }
            }
            Plan::Persist { tier } => {
                emit_capture_decided(&token, &tier.to_string(), size, "persist");
                match self.persist(request, &token, &group, tier, &redacted) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        emit_storage_error("capture", &e);
                        let lines = tail_lines(
                            &redacted.text,
                            self.config.thresholds.preview_lines,
                            self.config.thresholds.preview_line_max,
                        );
                        CaptureOutcome::NotStored {
                            notice: format!(
                                "[fw] {token} e={} {}: not stored, write failed",
                                exit_label(request.exit_code),
                                human_size(size),
                            ),
                            preview: (!lines.is_empty()).then(|| lines.join("\n")),
                        }
                    }
                }
            }
        }
    }

    fn persist(
        &self,
        request: &CaptureRequest,
        token: &str,
        group: &str,
        tier: Tier,
        redacted: &RedactionResult,
    ) -> Result<CaptureOutcome> {
        let now = Utc::now();
        let text = &redacted.text;
        let size = text.len() as u64;
        let id = ArtifactId::generate();
        let name = ArtifactName::new(token, now, id.clone(), request.exit_code);
        let path = write_atomic(&self.layout.scratch_dir(), &name.file_name(), text.as_bytes())?;
        let rel_path = self.layout.relative(&path);
        emit_artifact_persisted(id.as_str(), token, size, redacted.redactions_applied);

        let failed = is_failure(request.exit_code);
        let failure_sig = if failed && self.config.correlation.signature_at_capture {
            Some(self.signatures.extract(text)).filter(|s| !s.is_empty())
        } else {
            None
        };
        let entry = OffloadEntry {
            id: id.clone(),
            session_id: request.session_id.clone(),
            created_at: now,
            cmd: token.to_string(),
            cmd_group: group.to_string(),
            exit_code: request.exit_code,
            bytes: size,
            lines: line_count(text),
            path: rel_path.clone(),
            summary: self.summaries.extract(text, token, group),
            failure_sig,
        };

        self.rotate_if_oversized(now);
        if let Err(e) = self.manifest.append(&ManifestEntry::Offload(entry.clone())) {
            // The file is written and the pointer still resolves by path.
            emit_storage_error("manifest append", &e);
        }

        self.auto_pin(
            &PinCandidate {
                id: &id,
                token,
                group,
                exit_code: request.exit_code,
                bytes: size,
                content: text,
            },
            &path,
            now,
        );

        let compression = &self.config.compression;
        if compression.enabled && size >= compression.min_bytes {
            if let Err(e) = compress_file(&path, compression.level) {
                emit_storage_error("compress", &e);
            }
        }

        if self.config.retention.sweep_after_capture {
            self.sweep();
        }

        let hint = if failed && self.config.correlation.hint_on_capture {
            match self.correlator().find_correlations(&entry) {
                Ok(found) => Some(correlation_summary(&found)).filter(|s| !s.is_empty()),
                Err(e) => {
                    debug!(error = %e, "correlation hint skipped");
                    None
                }
            }
        } else {
            None
        };

        let pointer = render_pointer(
            &PointerInfo {
                id: id.as_str(),
                token,
                exit_code: request.exit_code,
                size,
                lines: entry.lines,
                rel_path: &rel_path,
            },
            &self.config.pointer,
        );
        let preview = render_preview(
            text,
            tier,
            request.exit_code,
            &self.config.thresholds,
            &self.config.pointer,
        );

        Ok(CaptureOutcome::Pointer {
            id,
            tier,
            pointer,
            preview,
            hint,
        })
    }

    fn auto_pin(&self, candidate: &PinCandidate<'_>, source: &Path, now: DateTime<Utc>) {
        if !self.auto_pin.any_rule() {
            return;
        }
        let Some(reason) = self.auto_pin.evaluate(candidate) else {
            return;
        };
        match self.manifest.count_auto_pins() {
            Ok(n) if n >= self.auto_pin.max_files() => {
                debug!(count = n, "auto-pin cap reached");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                emit_storage_error("auto-pin count", &e);
                return;
            }
        }
        let pinned = pin_artifact(
            &self.layout,
            &self.manifest,
            candidate.id,
            source,
            &reason,
            true,
            now,
        );
        match pinned {
            Ok(_) => emit_auto_pinned(candidate.id.as_str(), &reason),
            Err(e) => emit_storage_error("auto-pin", &e),
        }
    }

    fn rotate_if_oversized(&self, now: DateTime<Utc>) {
        match self.manifest.rotate_if_oversized(now) {
            Ok(Some(report)) => report_rotation(&report),
            Ok(None) => {}
            Err(e) => emit_storage_error("manifest rotate", &e),
        }
    }

    /// Rotate the active manifest now, if it holds anything.
    pub fn rotate(&self) -> Option<RotationReport> {
        match self.manifest.rotate(Utc::now()) {
            Ok(report) => {
                if let Some(r) = &report {
                    report_rotation(r);
                }
                report
            }
            Err(e) => {
                emit_storage_error("manifest rotate", &e);
                None
            }
        }
    }

    /// One retention pass as of now.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    /// One retention pass as of `now`.
    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let manager = RetentionManager::new(
            self.layout.scratch_dir(),
            &self.manifest,
            RetentionPolicy::from_config(&self.config),
        );
        match manager.sweep(now) {
            Ok(report) => {
                emit_sweep_finished(
                    report.orphans_removed.len(),
                    report.ttl_removed.len(),
                    report.lru_removed.len(),
                    report.failed.len(),
                    report.bytes_freed,
                );
                report
            }
            Err(e) => {
                emit_storage_error("retention sweep", &e);
                SweepReport::default()
            }
        }
    }

    /// Save text the user wants to keep around as a scratch artifact.
    pub fn save_manual(
        &self,
        title: &str,
        content: &str,
        source: &str,
        session_id: &str,
    ) -> StoreOutcome {
        let dir = self.layout.scratch_dir();
        let result = self.store_content("manual", &dir, content, |id, now, path, bytes, lines| {
            ManifestEntry::Manual(ManualEntry {
                id,
                session_id: session_id.to_string(),
                created_at: now,
                title: title.to_string(),
                source: source.to_string(),
                bytes,
                lines,
                path,
            })
        });
        store_outcome("save", result)
    }

    /// Write text to the exports directory, which retention never touches.
    pub fn export(&self, title: &str, content: &str, session_id: &str) -> StoreOutcome {
        let dir = self.layout.exports_dir();
        let result = self.store_content("export", &dir, content, |id, now, path, bytes, lines| {
            ManifestEntry::Export(ExportEntry {
                id,
                session_id: session_id.to_string(),
                created_at: now,
                title: title.to_string(),
                bytes,
                lines,
                path,
            })
        });
        store_outcome("export", result)
    }

    fn store_content<F>(
        &self,
        prefix: &str,
        dir: &Path,
        content: &str,
        record: F,
    ) -> Result<(ArtifactId, String)>
    where
        F: FnOnce(ArtifactId, DateTime<Utc>, String, u64, u64) -> ManifestEntry,
    {
        let now = Utc::now();
        let text = self.redactor.redact(content).text;
        let id = ArtifactId::generate();
        let name = ArtifactName::new(prefix, now, id.clone(), None);
        let path = write_atomic(dir, &name.file_name(), text.as_bytes())?;
        let rel_path = self.layout.relative(&path);
        self.rotate_if_oversized(now);
        let entry = record(id.clone(), now, rel_path.clone(), text.len() as u64, line_count(&text));
        self.manifest.append(&entry)?;
        Ok((id, rel_path))
    }

    fn lookup(&self) -> Lookup<'_> {
        Lookup::new(&self.layout, &self.manifest, LOOKUP_SCAN_CAP)
    }

    fn correlator(&self) -> Correlator<'_> {
        Correlator::new(
            &self.layout,
            &self.manifest,
            &self.signatures,
            &self.config.correlation,
        )
    }

    /// Resolve a selector: recent number, id, command token or title.
    pub fn resolve_selector(&self, selector: &str) -> Option<ManifestEntry> {
        match self.lookup().resolve(selector) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "selector not resolved");
                None
            }
        }
    }

    /// Content of a record, from scratch or from its pinned copy.
    pub fn read_content(&self, entry: &ManifestEntry) -> Option<String> {
        let lookup = self.lookup();
        match lookup.content_path(entry).and_then(|p| read_artifact(&p)) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!(id = %entry.id(), error = %e, "content unavailable");
                None
            }
        }
    }

    /// Readable records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RecentItem> {
        self.lookup().recent(limit, Utc::now()).unwrap_or_else(|e| {
            emit_storage_error("recent", &e);
            Vec::new()
        })
    }

    /// Pin the artifact named by `selector`.
    pub fn pin(&self, selector: &str, reason: &str) -> Option<PinEntry> {
        let entry = self.resolve_selector(selector)?;
        let result = self.lookup().content_path(&entry).and_then(|source| {
            pin_artifact(
                &self.layout,
                &self.manifest,
                entry.id(),
                &source,
                reason,
                false,
                Utc::now(),
            )
        });
        match result {
            Ok(pin) => Some(pin),
            Err(e) => {
                emit_storage_error("pin", &e);
                None
            }
        }
    }

    /// Delete the scratch or export file named by `selector` and tombstone it.
    ///
    /// Pinned copies are left alone.
    pub fn remove(&self, selector: &str) -> Option<ArtifactId> {
        let entry = self.resolve_selector(selector)?;
        let result = self.remove_entry(&entry);
        match result {
            Ok(()) => Some(entry.id().clone()),
            Err(e) => {
                emit_storage_error("remove", &e);
                None
            }
        }
    }

    fn remove_entry(&self, entry: &ManifestEntry) -> Result<()> {
        let rel = entry
            .content_path()
            .ok_or_else(|| FewwordError::ArtifactNotFound(entry.id().to_string()))?;
        let path = resolve_path(&self.layout.absolute(rel))
            .ok_or_else(|| FewwordError::ArtifactNotFound(entry.id().to_string()))?;
        fs::remove_file(&path)?;
        if let Err(e) = self.manifest.tombstone(entry.id(), "manual", Utc::now()) {
            warn!(id = %entry.id(), error = %e, "artifact deleted but tombstone append failed");
        }
        Ok(())
    }

    /// Past failures similar to the one named by `selector`.
    pub fn correlate(&self, selector: &str) -> Vec<Correlation> {
        let Some(ManifestEntry::Offload(target)) = self.resolve_selector(selector) else {
            return Vec::new();
        };
        self.correlator().find_correlations(&target).unwrap_or_else(|e| {
            emit_storage_error("correlate", &e);
            Vec::new()
        })
    }

    /// Repeating failures among the most recent ones.
    pub fn clusters(&self) -> Vec<FailureCluster> {
        self.correlator()
            .cluster_failures(self.config.correlation.cluster_limit)
            .unwrap_or_else(|e| {
                emit_storage_error("cluster", &e);
                Vec::new()
            })
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            manifest_bytes: fs::metadata(self.manifest.active_path())
                .map(|m| m.len())
                .unwrap_or(0),
            manifest_segments: self.manifest.segments().map(|s| s.len()).unwrap_or(0),
            ..Stats::default()
        };
        for (name, len) in dir_files(&self.layout.scratch_dir()) {
            if ArtifactName::parse(&name).is_none() {
                continue;
            }
            stats.scratch_files += 1;
            stats.scratch_bytes += len;
            if name.ends_with(COMPRESSED_SUFFIX) {
                stats.compressed_files += 1;
            } else {
                stats.plain_files += 1;
            }
        }
        for (_, len) in dir_files(&self.layout.pinned_dir()) {
            stats.pinned_files += 1;
            stats.pinned_bytes += len;
        }
        stats.export_files = dir_files(&self.layout.exports_dir()).len();
        stats
    }
}

fn exit_label(exit_code: Option<i32>) -> String {
    exit_code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string())
}

fn report_rotation(report: &RotationReport) {
    let segment = report
        .rotated_to
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    emit_manifest_rotated(&segment, report.rotated_bytes, report.pruned.len());
}

fn store_outcome(operation: &str, result: Result<(ArtifactId, String)>) -> StoreOutcome {
    match result {
        Ok((id, path)) => StoreOutcome::Stored { id, path },
        Err(e) => {
            emit_storage_error(operation, &e);
            StoreOutcome::NotStored {
                notice: format!("[fw] {operation} failed, nothing stored"),
            }
        }
    }
}

/// Regular files directly under `dir` with their sizes.
fn dir_files(dir: &Path) -> Vec<(String, u64)> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };
    read.filter_map(|d| d.ok())
        .filter_map(|d| {
            let meta = d.metadata().ok()?;
            meta.is_file()
                .then(|| (d.file_name().to_string_lossy().into_owned(), meta.len()))
        })
        .collect()
}

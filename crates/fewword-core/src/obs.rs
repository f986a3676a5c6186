//! Structured observability hooks for the artifact lifecycle.
//!
//! This module provides:
//! - Capture-scoped tracing spans via the [`CaptureSpan`] RAII guard
//! - Emission functions for capture decisions, persistence, rotation,
//!   retention passes, auto-pins and storage errors
//!
//! Events never carry artifact content or full command lines.

use tracing::{info, warn};

/// RAII guard that enters a capture-scoped span.
///
/// ```ignore
/// let _span = CaptureSpan::enter("pytest", "session-1");
/// // every event below is tagged with cmd = "pytest"
/// ```
pub struct CaptureSpan {
    _span: tracing::span::EnteredSpan,
}

impl CaptureSpan {
    pub fn enter(cmd: &str, session_id: &str) -> Self {
        let span = tracing::info_span!("fewword.capture", cmd = %cmd, session_id = %session_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: tiering decided what happens to an output.
pub fn emit_capture_decided(cmd: &str, tier: &str, bytes: u64, decision: &str) {
    info!(
        event = "capture.decided",
        cmd = %cmd,
        tier = %tier,
        bytes = bytes,
        decision = %decision,
    );
}

/// Emit event: an artifact reached its final name on disk.
pub fn emit_artifact_persisted(id: &str, cmd: &str, bytes: u64, redactions: usize) {
    info!(
        event = "artifact.persisted",
        id = %id,
        cmd = %cmd,
        bytes = bytes,
        redactions = redactions,
    );
}

/// Emit event: a retention pass finished.
pub fn emit_sweep_finished(orphans: usize, ttl: usize, lru: usize, failed: usize, bytes_freed: u64) {
    info!(
        event = "retention.swept",
        orphans = orphans,
        ttl = ttl,
        lru = lru,
        failed = failed,
        bytes_freed = bytes_freed,
    );
}

/// Emit event: the active manifest was rotated into a segment.
pub fn emit_manifest_rotated(segment: &str, bytes: u64, pruned: usize) {
    info!(event = "manifest.rotated", segment = %segment, bytes = bytes, pruned = pruned);
}

/// Emit event: an artifact was pinned by a rule.
pub fn emit_auto_pinned(id: &str, reason: &str) {
    info!(event = "artifact.auto_pinned", id = %id, reason = %reason);
}

/// Emit event: a storage operation was abandoned (warning level).
pub fn emit_storage_error(operation: &str, error: &dyn std::fmt::Display) {
    warn!(event = "storage.error", operation = %operation, error = %error);
}

//! FewWord Core Library
//!
//! Lifecycle engine for command-output artifacts: redaction, tiering, the
//! append-only manifest, retention, pinning and failure correlation.

pub mod artifact;
pub mod autopin;
pub mod capture;
pub mod command;
pub mod config;
pub mod correlation;
pub mod error;
pub mod lookup;
pub mod manifest;
pub mod obs;
pub mod redact;
pub mod retention;
pub mod signature;
pub mod summary;
pub mod telemetry;
pub mod tiering;

pub use artifact::{
    read_artifact, resolve_path, write_atomic, ArtifactId, ArtifactName, Layout, COMPRESSED_SUFFIX,
};
pub use autopin::{pin_artifact, AutoPinRules, PinCandidate};
pub use capture::{CaptureOutcome, CaptureRequest, Engine, Stats, StoreOutcome};
pub use command::{command_token, resolve_group};
pub use config::{
    AutoPinConfig, CompressionConfig, CorrelationConfig, DenyConfig, FewwordConfig, ManifestConfig,
    PointerConfig, RedactionConfig, RetentionConfig, SummaryConfig, Thresholds,
};
pub use correlation::{
    correlation_summary, explain, similarity, Correlation, Correlator, FailureCluster,
};
pub use error::{FewwordError, Result};
pub use lookup::{human_age, Lookup, RecentItem};
pub use manifest::{
    fold_entries, ArtifactState, ExportEntry, LockOutcome, ManifestEntry, ManifestStore,
    ManualEntry, OffloadEntry, PinEntry, ReadReport, RotationReport, TombstoneEntry,
};
pub use redact::{RedactionMatch, RedactionResult, Redactor};
pub use retention::{RetentionClass, RetentionManager, RetentionPolicy, SweepReport, LEGACY_CLASS};
pub use signature::{FailureSignature, SignatureExtractor};
pub use summary::SummaryExtractor;
pub use tiering::{plan, DenyPolicy, DenyReason, Plan, Tier};

pub use obs::{
    emit_artifact_persisted, emit_auto_pinned, emit_capture_decided, emit_manifest_rotated,
    emit_storage_error, emit_sweep_finished, CaptureSpan,
};
pub use telemetry::init_tracing;

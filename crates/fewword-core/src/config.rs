//! Engine configuration.
//!
//! [`FewwordConfig`] is the merged policy object the engine consumes. It is
//! built once by the caller and passed by reference into every operation;
//! nothing in the crate caches it. Every section carries `#[serde(default)]`
//! so a partial TOML file only overrides the keys it names.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FewwordError, Result};

const MIB: u64 = 1024 * 1024;

/// Size thresholds that drive tiering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Outputs strictly smaller than this are shown inline.
    pub inline_max: u64,
    /// Outputs at or above this size get a failure preview.
    pub preview_min: u64,
    /// Trailing lines shown in a tier-3 failure preview.
    pub preview_lines: usize,
    /// Per-line character cap in previews.
    pub preview_line_max: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            inline_max: 512,
            preview_min: 4096,
            preview_lines: 5,
            preview_line_max: 200,
        }
    }
}

/// Pointer rendering options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointerConfig {
    /// Retrieval command advertised in the pointer.
    pub open_cmd: String,
    /// Append the relative artifact path to the pointer.
    pub show_path: bool,
    /// Show a few trailing lines under tier-2 pointers for failures.
    pub peek_on_pointer: bool,
    /// Lines shown when `peek_on_pointer` is set.
    pub peek_lines: usize,
}

impl Default for PointerConfig {
    fn default() -> Self {
        Self {
            open_cmd: "/open".to_string(),
            show_path: false,
            peek_on_pointer: false,
            peek_lines: 2,
        }
    }
}

/// Retention budgets, in minutes and MiB as written in config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub success_min: u64,
    pub fail_min: u64,
    pub scratch_max_mb: u64,
    pub min_keep: usize,
    pub orphan_grace_min: u64,
    /// Run a reconciliation pass after every persisted capture.
    pub sweep_after_capture: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            success_min: 1440,
            fail_min: 2880,
            scratch_max_mb: 250,
            min_keep: 1,
            orphan_grace_min: 5,
            sweep_after_capture: true,
        }
    }
}

/// Commands whose output must never reach disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenyConfig {
    /// Matched against the command token and its group.
    pub cmds: Vec<String>,
    /// Regexes matched against the full command line.
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub enabled: bool,
    pub patterns: Vec<String>,
    pub replacement: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
            replacement: "[REDACTED]".to_string(),
        }
    }
}

/// Auto-pin rules. Each is independent; the first that fires wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPinConfig {
    pub on_fail: bool,
    #[serde(rename = "match")]
    pub match_pattern: String,
    pub cmds: Vec<String>,
    pub exit_codes: Vec<i32>,
    pub size_min: u64,
    pub max_files: usize,
}

impl Default for AutoPinConfig {
    fn default() -> Self {
        Self {
            on_fail: false,
            match_pattern: String::new(),
            cmds: Vec::new(),
            exit_codes: Vec::new(),
            size_min: 0,
            max_files: 50,
        }
    }
}

impl AutoPinConfig {
    /// True when at least one rule is configured.
    pub fn any_rule(&self) -> bool {
        self.on_fail
            || !self.match_pattern.is_empty()
            || !self.cmds.is_empty()
            || !self.exit_codes.is_empty()
            || self.size_min > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub min_bytes: u64,
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_bytes: MIB,
            level: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Rotate the active manifest once it grows past this size.
    pub max_mb: u64,
    /// Rotated segments kept on disk.
    pub keep_rotated: usize,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            max_mb: 50,
            keep_rotated: 5,
        }
    }
}

impl ManifestConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_mb.saturating_mul(MIB)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Embed a failure signature in offload entries at capture time.
    pub signature_at_capture: bool,
    /// Append a "Similar to ..." line to failing pointers.
    pub hint_on_capture: bool,
    pub threshold: f64,
    pub max_candidates: usize,
    pub max_results: usize,
    /// Hard cap on manifest records scanned per query.
    pub scan_cap: usize,
    pub cluster_limit: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            signature_at_capture: true,
            hint_on_capture: false,
            threshold: 0.3,
            max_candidates: 50,
            max_results: 5,
            scan_cap: 2000,
            cluster_limit: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub enabled: bool,
    pub max_chars: usize,
    /// Extra patterns keyed by command token or group; tried before built-ins.
    pub extractors: BTreeMap<String, Vec<String>>,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chars: 120,
            extractors: BTreeMap::new(),
        }
    }
}

/// Built-in command alias table: canonical group -> aliases.
pub fn default_aliases() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 5] = [
        ("pytest", &["py.test", "python -m pytest", "python3 -m pytest"]),
        ("npm", &["pnpm", "yarn", "bun"]),
        ("cargo", &["cargo test", "cargo build", "cargo run"]),
        ("git", &["gh"]),
        ("make", &["gmake", "cmake --build"]),
    ];
    table
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect()
}

/// The merged engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FewwordConfig {
    pub thresholds: Thresholds,
    pub pointer: PointerConfig,
    pub retention: RetentionConfig,
    pub deny: DenyConfig,
    pub redaction: RedactionConfig,
    pub auto_pin: AutoPinConfig,
    #[serde(default = "default_aliases")]
    pub aliases: BTreeMap<String, Vec<String>>,
    pub compression: CompressionConfig,
    pub manifest: ManifestConfig,
    pub correlation: CorrelationConfig,
    pub summary: SummaryConfig,
}

impl Default for FewwordConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            pointer: PointerConfig::default(),
            retention: RetentionConfig::default(),
            deny: DenyConfig::default(),
            redaction: RedactionConfig::default(),
            auto_pin: AutoPinConfig::default(),
            aliases: default_aliases(),
            compression: CompressionConfig::default(),
            manifest: ManifestConfig::default(),
            correlation: CorrelationConfig::default(),
            summary: SummaryConfig::default(),
        }
    }
}

impl FewwordConfig {
    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| FewwordError::Config(e.to_string()))?;
        Ok(config.sanitized())
    }

    /// Load a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Replace misconfigured values with built-in defaults.
    ///
    /// Inverted or zero thresholds, zero TTLs and zero caps are never
    /// honoured; the engine keeps operating on safe values instead.
    pub fn sanitized(mut self) -> Self {
        let t = Thresholds::default();
        if self.thresholds.inline_max == 0
            || self.thresholds.inline_max >= self.thresholds.preview_min
        {
            warn!(
                inline_max = self.thresholds.inline_max,
                preview_min = self.thresholds.preview_min,
                "invalid tier thresholds, using defaults"
            );
            self.thresholds.inline_max = t.inline_max;
            self.thresholds.preview_min = t.preview_min;
        }
        if self.thresholds.preview_lines == 0 {
            self.thresholds.preview_lines = t.preview_lines;
        }
        if self.thresholds.preview_line_max == 0 {
            self.thresholds.preview_line_max = t.preview_line_max;
        }
        if self.pointer.peek_lines == 0 {
            self.pointer.peek_lines = PointerConfig::default().peek_lines;
        }

        let r = RetentionConfig::default();
        if self.retention.success_min == 0 {
            warn!("retention.success_min is zero, using default");
            self.retention.success_min = r.success_min;
        }
        if self.retention.fail_min == 0 {
            warn!("retention.fail_min is zero, using default");
            self.retention.fail_min = r.fail_min;
        }
        if self.retention.scratch_max_mb == 0 {
            warn!("retention.scratch_max_mb is zero, using default");
            self.retention.scratch_max_mb = r.scratch_max_mb;
        }
        if self.retention.orphan_grace_min == 0 {
            self.retention.orphan_grace_min = r.orphan_grace_min;
        }

        if self.auto_pin.max_files == 0 {
            self.auto_pin.max_files = AutoPinConfig::default().max_files;
        }

        let m = ManifestConfig::default();
        if self.manifest.max_mb == 0 {
            self.manifest.max_mb = m.max_mb;
        }
        if self.manifest.keep_rotated == 0 {
            self.manifest.keep_rotated = m.keep_rotated;
        }

        if !(1..=22).contains(&self.compression.level) {
            self.compression.level = CompressionConfig::default().level;
        }

        let c = CorrelationConfig::default();
        if !(self.correlation.threshold > 0.0 && self.correlation.threshold <= 1.0) {
            self.correlation.threshold = c.threshold;
        }
        if self.correlation.max_candidates == 0 {
            self.correlation.max_candidates = c.max_candidates;
        }
        if self.correlation.max_results == 0 {
            self.correlation.max_results = c.max_results;
        }
        if self.correlation.scan_cap == 0 {
            self.correlation.scan_cap = c.scan_cap;
        }
        if self.correlation.cluster_limit == 0 {
            self.correlation.cluster_limit = c.cluster_limit;
        }

        if self.summary.max_chars < 8 {
            self.summary.max_chars = SummaryConfig::default().max_chars;
        }
        self
    }

    /// Success-class TTL.
    pub fn success_ttl(&self) -> Duration {
        Duration::from_secs(self.retention.success_min.saturating_mul(60))
    }

    /// Failure-class TTL.
    pub fn failure_ttl(&self) -> Duration {
        Duration::from_secs(self.retention.fail_min.saturating_mul(60))
    }

    /// Global scratch size cap in bytes.
    pub fn scratch_max_bytes(&self) -> u64 {
        self.retention.scratch_max_mb.saturating_mul(MIB)
    }
}

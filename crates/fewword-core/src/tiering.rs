//! Tiering decision: inline, compact pointer, or pointer plus preview.
//!
//! Everything here is pure. [`plan`] decides what to do with a redacted
//! output and the capture engine carries it out.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{DenyConfig, PointerConfig, Thresholds};
use crate::error::FewwordError;

/// Disclosure level of a captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Inline,
    Compact,
    Preview,
}

impl Tier {
    pub fn classify(size: u64, thresholds: &Thresholds) -> Self {
        if size < thresholds.inline_max {
            Tier::Inline
        } else if size < thresholds.preview_min {
            Tier::Compact
        } else {
            Tier::Preview
        }
    }

    pub fn is_persisted(self) -> bool {
        self != Tier::Inline
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Inline => write!(f, "inline"),
            Tier::Compact => write!(f, "compact"),
            Tier::Preview => write!(f, "preview"),
        }
    }
}

/// Why an output was not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The command token or its group is on the deny list.
    Command(String),
    /// The command line matched deny pattern number `n` (0-based).
    Pattern(usize),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Command(name) => write!(f, "command '{name}' is on the deny list"),
            DenyReason::Pattern(n) => write!(f, "command matches deny pattern #{n}"),
        }
    }
}

/// Compiled deny rules.
#[derive(Debug, Default)]
pub struct DenyPolicy {
    cmds: Vec<String>,
    patterns: Vec<(usize, Regex)>,
    diagnostics: Vec<String>,
}

impl DenyPolicy {
    pub fn new(config: &DenyConfig) -> Self {
        let mut patterns = Vec::new();
        let mut diagnostics = Vec::new();
        for (i, p) in config.patterns.iter().enumerate() {
            match Regex::new(p) {
                Ok(re) => patterns.push((i, re)),
                Err(e) => {
                    let err = FewwordError::invalid_pattern(format!("deny pattern #{i}"), &e);
                    warn!(error = %err, "deny pattern skipped");
                    diagnostics.push(format!("{err}, skipped"));
                }
            }
        }
        Self {
            cmds: config.cmds.clone(),
            patterns,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// The first deny rule that applies, if any.
    pub fn check(&self, token: &str, group: &str, command: &str) -> Option<DenyReason> {
        if let Some(name) = self.cmds.iter().find(|c| *c == token || *c == group) {
            return Some(DenyReason::Command(name.clone()));
        }
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(command))
            .map(|(i, _)| DenyReason::Pattern(*i))
    }
}

/// What the capture engine should do with an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Return the content as is. Nothing touches disk.
    Inline,
    /// Persist and render a pointer at `tier`.
    Persist { tier: Tier },
    /// Would have been persisted at `tier`, but a deny rule applies.
    Deny { tier: Tier, reason: DenyReason },
}

/// Decide the plan for a redacted output of `size` bytes.
///
/// Deny only affects persisted tiers; inline output never reaches disk anyway.
pub fn plan(
    size: u64,
    thresholds: &Thresholds,
    deny: &DenyPolicy,
    token: &str,
    group: &str,
    command: &str,
) -> Plan {
    let tier = Tier::classify(size, thresholds);
    if !tier.is_persisted() {
        return Plan::Inline;
    }
    match deny.check(token, group, command) {
        Some(reason) => Plan::Deny { tier, reason },
        None => Plan::Persist { tier },
    }
}

/// True for a present, non-zero exit code.
pub fn is_failure(exit_code: Option<i32>) -> bool {
    exit_code.is_some_and(|c| c != 0)
}

/// Number of `\n` characters.
pub fn line_count(text: &str) -> u64 {
    text.bytes().filter(|b| *b == b'\n').count() as u64
}

/// Compact size label: `812B`, `4K`, `2M`.
pub fn human_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes >= MIB {
        format!("{}M", (bytes + MIB / 2) / MIB)
    } else if bytes >= KIB {
        format!("{}K", (bytes + KIB / 2) / KIB)
    } else {
        format!("{bytes}B")
    }
}

/// Inputs for rendering a pointer line.
#[derive(Debug, Clone)]
pub struct PointerInfo<'a> {
    pub id: &'a str,
    pub token: &'a str,
    pub exit_code: Option<i32>,
    pub size: u64,
    pub lines: u64,
    pub rel_path: &'a str,
}

/// `[fw {id}] {cmd} e={exit} {size} {lines}L | {open_cmd} {id}`
pub fn render_pointer(info: &PointerInfo<'_>, pointer: &PointerConfig) -> String {
    let exit = info
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "?".to_string());
    let mut line = format!(
        "[fw {id}] {cmd} e={exit} {size} {lines}L | {open} {id}",
        id = info.id,
        cmd = info.token,
        size = human_size(info.size),
        lines = info.lines,
        open = pointer.open_cmd,
    );
    if pointer.show_path {
        line.push_str(" | ");
        line.push_str(info.rel_path);
    }
    line
}

/// Trailing lines shown under a pointer, if the tier calls for any.
///
/// Only failing outputs get a preview. Compact pointers show a peek only when
/// `peek_on_pointer` is enabled.
pub fn render_preview(
    text: &str,
    tier: Tier,
    exit_code: Option<i32>,
    thresholds: &Thresholds,
    pointer: &PointerConfig,
) -> Option<String> {
    if !is_failure(exit_code) {
        return None;
    }
    let count = match tier {
        Tier::Inline => return None,
        Tier::Compact if pointer.peek_on_pointer => pointer.peek_lines,
        Tier::Compact => return None,
        Tier::Preview => thresholds.preview_lines,
    };
    let lines = tail_lines(text, count, thresholds.preview_line_max);
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Last `count` non-empty lines, each capped at `line_max` characters.
pub fn tail_lines(text: &str, count: usize, line_max: usize) -> Vec<String> {
    let mut lines: Vec<String> = text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(count)
        .map(|l| l.chars().take(line_max).collect())
        .collect();
    lines.reverse();
    lines
}

//! One-line summaries of tool output, extracted with per-tool regex tables.
//!
//! Patterns run against the last 50 lines only. Lookup order is custom
//! patterns for the token and group, built-ins for the token and group, then
//! the fallback table, then the last non-comment line.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::warn;

use crate::config::SummaryConfig;

const TAIL_LINES: usize = 50;

type Table = &'static [(&'static str, &'static [&'static str])];

const BUILTIN: Table = &[
    (
        "pytest",
        &[
            r"(\d+\s+(?:passed|failed|skipped|error|warning).*)",
            r"(PASSED|FAILED|ERROR)",
            r"(=+ .+ =+)",
        ],
    ),
    ("jest", &[r"(Tests:\s+\d+.*)", r"(Test Suites:\s+\d+.*)"]),
    ("mocha", &[r"(\d+\s+passing)", r"(\d+\s+failing)"]),
    (
        "cargo",
        &[
            r"(test result:.*)",
            r"(error\[E\d+\]:.*)",
            r"(Finished\s+.*)",
            r"(Compiling\s+\S+)",
        ],
    ),
    ("go", &[r"(--- FAIL:.*)", r"(ok\s+\S+\s+[\d.]+s)", r"(PASS|FAIL)"]),
    ("rspec", &[r"(\d+\s+examples?,\s+\d+\s+failures?)"]),
    (
        "npm",
        &[
            r"(npm ERR!.*)",
            r"(added\s+\d+\s+packages?.*)",
            r"(up to date.*)",
            r"(npm WARN.*)",
        ],
    ),
    ("pnpm", &[r"(Packages:\s+\+\d+)", r"(Done in.*)"]),
    ("yarn", &[r"(Done in.*)", r"(success\s+.*)", r"(error\s+.*)"]),
    ("pip", &[r"(Successfully installed.*)", r"(Requirement already satisfied.*)"]),
    (
        "make",
        &[r"(make\[\d+\]:.*Error\s+\d+)", r"(make:.*Error\s+\d+)", r"(warning:.*)"],
    ),
    ("cmake", &[r"(CMake Error.*)", r"(-- Build files have been written.*)"]),
    ("tsc", &[r"(Found\s+\d+\s+errors?)", r"(error\s+TS\d+:.*)"]),
    (
        "git",
        &[
            r"(CONFLICT.*)",
            r"(\d+\s+files?\s+changed.*)",
            r"(Your branch is.*)",
            r"(Already up to date.*)",
            r"(Fast-forward)",
        ],
    ),
    ("rg", &[r"(\d+\s+matches?)"]),
    (
        "docker",
        &[
            r"(ERROR.*)",
            r"(Successfully built\s+\S+)",
            r"(Successfully tagged.*)",
            r"(Step\s+\d+/\d+.*)",
        ],
    ),
    (
        "terraform",
        &[r"(Error:.*)", r"(Plan:\s+\d+\s+to\s+add.*)", r"(Apply complete!.*)"],
    ),
    (
        "eslint",
        &[r"(\d+\s+problems?\s+\(\d+\s+errors?,\s+\d+\s+warnings?\))"],
    ),
    ("mypy", &[r"(Found\s+\d+\s+errors?.*)", r"(Success:.*)"]),
    (
        "python",
        &[r"(\w+Error:.*)", r"(\w+Exception:.*)", r"(Traceback.*)"],
    ),
    ("rustc", &[r"(error\[E\d+\]:.*)", r"(warning:.*)"]),
];

const FALLBACK: &[&str] = &[r"(error:.*)", r"(failed.*)", r"(success.*)", r"(warning:.*)"];

/// Compiled summary tables.
pub struct SummaryExtractor {
    enabled: bool,
    max_chars: usize,
    custom: BTreeMap<String, Vec<Regex>>,
    builtin: BTreeMap<&'static str, Vec<Regex>>,
    fallback: Vec<Regex>,
}

/// All patterns match case-insensitively with `^`/`$` per line.
fn compile(patterns: impl IntoIterator<Item = impl AsRef<str>>, origin: &str) -> Vec<Regex> {
    patterns
        .into_iter()
        .filter_map(|p| {
            let p = p.as_ref();
            match Regex::new(&format!("(?im){p}")) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(origin = %origin, error = %e, "summary pattern skipped");
                    None
                }
            }
        })
        .collect()
}

impl SummaryExtractor {
    pub fn new(config: &SummaryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_chars: config.max_chars,
            custom: config
                .extractors
                .iter()
                .map(|(k, v)| (k.clone(), compile(v, k)))
                .collect(),
            builtin: BUILTIN
                .iter()
                .map(|(k, v)| (*k, compile(v.iter(), k)))
                .collect(),
            fallback: compile(FALLBACK.iter(), "fallback"),
        }
    }

    /// Summary line for `output`, or an empty string.
    pub fn extract(&self, output: &str, token: &str, group: &str) -> String {
        if !self.enabled || output.trim().is_empty() {
            return String::new();
        }

        let lines: Vec<&str> = output.trim().lines().collect();
        let tail = &lines[lines.len().saturating_sub(TAIL_LINES)..];
        let tail_text = tail.join("\n");

        let keys = if group == token { vec![token] } else { vec![token, group] };
        let custom = keys.iter().filter_map(|k| self.custom.get(*k)).flatten();
        let builtin = keys.iter().filter_map(|k| self.builtin.get(*k)).flatten();

        for re in custom.chain(builtin).chain(self.fallback.iter()) {
            if let Some(caps) = re.captures(&tail_text) {
                if let Some(m) = caps.get(1).or_else(|| caps.get(0)) {
                    let found = m.as_str().trim();
                    if !found.is_empty() {
                        return truncate(found, self.max_chars);
                    }
                }
            }
        }

        tail.iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| truncate(l, self.max_chars))
            .unwrap_or_default()
    }
}

/// Cap to `max` characters, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

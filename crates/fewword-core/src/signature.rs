//! Failure signatures: a compact, privacy-safe fingerprint of failing output.
//!
//! Only class names, test-file basenames and a hash of the normalized tail
//! are kept. Full error messages never leave the artifact.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

const MAX_ERROR_TYPES: usize = 3;
const MAX_TEST_FILES: usize = 5;
const TAIL_LINES: usize = 10;

/// Error-class patterns. Group 1 is the value when present, else the match.
const ERROR_PATTERNS: &[&str] = &[
    r"(\w+Error):",
    r"(\w+Exception):",
    r"(\w+Warning):",
    r"error\[(E\d+)\]",
    r"panicked at",
    r"panic:",
    r"fatal error:",
    r"FAILED\s+(\S+)",
    r"FATAL",
    r"CRITICAL",
    r"Traceback",
];

const TEST_FILE_PATTERNS: &[&str] = &[
    r"(test_\w+\.py)",
    r"(\w+_test\.py)",
    r"(tests/\S+\.py)",
    r"(\w+\.test\.[jt]sx?)",
    r"(\w+\.spec\.[jt]sx?)",
    r"(__tests__/[A-Za-z0-9_.-]+\.[jt]sx?)",
    r"(\w+_test\.go)",
    r"(tests/\S+\.rs)",
    r"(test\S+\.\w+)",
];

/// Fingerprint stored inline in offload entries under compact keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignature {
    #[serde(rename = "err", default, skip_serializing_if = "Vec::is_empty")]
    pub error_types: Vec<String>,
    #[serde(rename = "tst", default, skip_serializing_if = "Vec::is_empty")]
    pub test_files: Vec<String>,
    #[serde(rename = "th", default)]
    pub tail_hash: String,
}

impl FailureSignature {
    pub fn is_empty(&self) -> bool {
        self.error_types.is_empty() && self.test_files.is_empty() && self.tail_hash.is_empty()
    }
}

/// Compiled signature pattern tables.
pub struct SignatureExtractor {
    error_patterns: Vec<Regex>,
    test_patterns: Vec<Regex>,
    normalizers: Vec<(Regex, &'static str)>,
}

fn compile_table(table: &[&str]) -> Vec<Regex> {
    table
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, error = %e, "signature pattern failed to compile");
                None
            }
        })
        .collect()
}

/// Tail normalization steps, applied in order: ANSI codes, digit runs, whitespace.
const NORMALIZERS: &[(&str, &str)] = &[(r"\x1b\[[0-9;]*m", ""), (r"\d+", "N"), (r"\s+", " ")];

impl Default for SignatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureExtractor {
    pub fn new() -> Self {
        Self {
            error_patterns: compile_table(ERROR_PATTERNS),
            test_patterns: compile_table(TEST_FILE_PATTERNS),
            normalizers: NORMALIZERS
                .iter()
                .filter_map(|(p, with)| compile_table(&[*p]).pop().map(|re| (re, *with)))
                .collect(),
        }
    }

    /// Extract the signature of `content`. Empty content yields an empty signature.
    pub fn extract(&self, content: &str) -> FailureSignature {
        if content.trim().is_empty() {
            return FailureSignature::default();
        }
        FailureSignature {
            error_types: collect_unique(&self.error_patterns, content, MAX_ERROR_TYPES, false),
            test_files: collect_unique(&self.test_patterns, content, MAX_TEST_FILES, true),
            tail_hash: self.tail_hash(content),
        }
    }

    /// 8-hex SHA-256 prefix of the normalized last ten non-empty lines.
    pub fn tail_hash(&self, content: &str) -> String {
        let mut tail: Vec<&str> = content
            .lines()
            .rev()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(TAIL_LINES)
            .collect();
        tail.reverse();

        let normalized: Vec<String> = tail
            .into_iter()
            .map(|line| {
                self.normalizers
                    .iter()
                    .fold(line.to_string(), |acc, (re, with)| re.replace_all(&acc, *with).into_owned())
            })
            .collect();

        let digest = Sha256::digest(normalized.join("\n").as_bytes());
        hex::encode(digest)[..8].to_string()
    }
}

/// Unique values in discovery order, capped, then sorted.
fn collect_unique(patterns: &[Regex], content: &str, cap: usize, basename: bool) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    'outer: for re in patterns {
        for caps in re.captures_iter(content) {
            let Some(m) = caps.get(1).or_else(|| caps.get(0)) else {
                continue;
            };
            let mut value = m.as_str().trim();
            if basename {
                value = value.rsplit('/').next().unwrap_or(value);
            }
            if value.is_empty() || found.iter().any(|f| f == value) {
                continue;
            }
            found.push(value.to_string());
            if found.len() >= cap {
                break 'outer;
            }
        }
    }
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_compile() {
        let ex = SignatureExtractor::new();
        assert_eq!(ex.error_patterns.len(), ERROR_PATTERNS.len());
        assert_eq!(ex.test_patterns.len(), TEST_FILE_PATTERNS.len());
        assert_eq!(ex.normalizers.len(), NORMALIZERS.len());
    }

    #[test]
    fn test_python_failure_signature() {
        let output = "\
tests/test_auth.py::test_login
E   KeyError: 'user'
E   AssertionError: expected 200
FAILED tests/test_auth.py::test_login - AssertionError
";
        let sig = SignatureExtractor::new().extract(output);
        assert_eq!(sig.error_types, vec!["AssertionError", "KeyError", "tests/test_auth.py::test_login"]);
        assert_eq!(sig.test_files, vec!["test_auth.py"]);
        assert_eq!(sig.tail_hash.len(), 8);
    }

    #[test]
    fn test_error_types_capped_at_three() {
        let output = "AError: x\nBError: y\nCError: z\nDError: w\n";
        let sig = SignatureExtractor::new().extract(output);
        assert_eq!(sig.error_types, vec!["AError", "BError", "CError"]);
    }

    #[test]
    fn test_rust_error_code() {
        let sig = SignatureExtractor::new().extract("error[E0308]: mismatched types\n");
        assert_eq!(sig.error_types, vec!["E0308"]);
    }

    #[test]
    fn test_tail_hash_ignores_digits_ansi_and_spacing() {
        let ex = SignatureExtractor::new();
        let a = ex.tail_hash("run 1 took 35ms\n\x1b[31mFAILED\x1b[0m   at line 10\n");
        let b = ex.tail_hash("run 2 took 41ms\nFAILED at line 99\n\n");
        assert_eq!(a, b);
        assert_ne!(a, ex.tail_hash("something else entirely"));
    }

    #[test]
    fn test_tail_hash_uses_last_ten_lines() {
        let ex = SignatureExtractor::new();
        let tail: String = (0..10).map(|i| format!("line {i}\n")).collect();
        let a = ex.tail_hash(&format!("head one\n{tail}"));
        let b = ex.tail_hash(&format!("completely different head\n{tail}"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_content_gives_empty_signature() {
        let sig = SignatureExtractor::new().extract("  \n\n");
        assert!(sig.is_empty());
    }

    #[test]
    fn test_compact_serde_keys() {
        let sig = FailureSignature {
            error_types: vec!["KeyError".to_string()],
            test_files: vec![],
            tail_hash: "abcd1234".to_string(),
        };
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, r#"{"err":["KeyError"],"th":"abcd1234"}"#);
        let back: FailureSignature = serde_json::from_str(r#"{"th":"abcd1234","extra":1}"#).unwrap();
        assert_eq!(back.tail_hash, "abcd1234");
        assert!(back.error_types.is_empty());
    }
}

//! Command identity: the token recorded for an artifact and its alias group.
//!
//! Only the first meaningful word of a command is ever stored. The full
//! command line may carry secrets and is used solely for deny matching.

use std::collections::BTreeMap;

/// Wrappers skipped when looking for the real command word.
const PREFIX_WORDS: &[&str] = &["sudo", "env", "nohup", "nice", "time", "strace", "ltrace"];

const MAX_TOKEN_LEN: usize = 20;

/// Words of `command` after dropping wrappers and `VAR=value` assignments.
fn effective_words(command: &str) -> Vec<&str> {
    let mut words = command.split_whitespace().peekable();
    while let Some(word) = words.peek() {
        let is_assignment = word.contains('=') && !word.starts_with('-');
        if is_assignment || PREFIX_WORDS.contains(word) {
            words.next();
        } else {
            break;
        }
    }
    words.collect()
}

/// Extract the command token: basename of the first real command word,
/// restricted to `[A-Za-z0-9_-]` and capped at 20 characters.
///
/// Returns `"unknown"` when nothing usable remains.
pub fn command_token(command: &str) -> String {
    let Some(first) = effective_words(command).into_iter().next() else {
        return "unknown".to_string();
    };
    let base = first.rsplit('/').next().unwrap_or(first);
    let token: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOKEN_LEN)
        .collect();
    if token.is_empty() {
        "unknown".to_string()
    } else {
        token
    }
}

/// Resolve the canonical group for `token`.
///
/// Single-word aliases match the token; multi-word aliases
/// (`python -m pytest`) match the start of the effective command line.
/// A token with no alias is its own group.
pub fn resolve_group(token: &str, command: &str, aliases: &BTreeMap<String, Vec<String>>) -> String {
    if aliases.contains_key(token) {
        return token.to_string();
    }

    let effective = effective_words(command).join(" ");
    for (canonical, names) in aliases {
        for alias in names {
            let matched = if alias.contains(' ') {
                starts_with_words(&effective, alias)
            } else {
                alias == token
            };
            if matched {
                return canonical.clone();
            }
        }
    }
    token.to_string()
}

fn starts_with_words(line: &str, prefix: &str) -> bool {
    let mut line_words = line.split_whitespace();
    prefix
        .split_whitespace()
        .all(|p| line_words.next().is_some_and(|w| w.rsplit('/').next() == Some(p)))
}

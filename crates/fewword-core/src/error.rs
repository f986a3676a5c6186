//! Error taxonomy for the artifact engine.
//!
//! Lower-level modules return [`Result`]; the [`crate::Engine`] boundary
//! converts every error into a logged, degraded outcome.

/// FewWord errors.
#[derive(Debug, thiserror::Error)]
pub enum FewwordError {
    #[error("invalid artifact id: {0}")]
    InvalidArtifactId(String),

    #[error("invalid pattern '{name}': {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("manifest entry not found: {0}")]
    EntryNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FewwordError {
    /// A pattern that failed to compile, keeping only the regex engine's
    /// final message line.
    pub fn invalid_pattern(name: impl Into<String>, err: &regex::Error) -> Self {
        let reason = err.to_string();
        let reason = reason.lines().last().unwrap_or("invalid").trim().to_string();
        Self::InvalidPattern {
            name: name.into(),
            reason,
        }
    }
}

/// Result type for FewWord operations.
pub type Result<T> = std::result::Result<T, FewwordError>;

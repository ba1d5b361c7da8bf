use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = EmberError> = std::result::Result<T, E>;

/// Every failure the engine distinguishes. Display strings carry an
/// actionable hint where one exists; the shell maps variants to exit codes
/// (user error vs internal failure).
#[derive(Debug, Error)]
pub enum EmberError {
    #[error("no index at {}/.ember; run `ember init` first", root.display())]
    NotInitialized { root: PathBuf },

    #[error("repository has no commits; commit first or index the worktree instead")]
    NoCommits,

    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("invalid config value `{key}`: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    #[error("invalid path filter {pattern:?}: {reason}")]
    InvalidPathFilter { pattern: String, reason: String },

    #[error(
        "embedding for chunk {chunk} has dimension {got}, index expects {expected}; \
         the model and the index disagree, run `ember index --force-reindex`"
    )]
    DimensionMismatch {
        chunk: String,
        got: usize,
        expected: usize,
    },

    #[error(
        "index was built with model fingerprint {indexed}, current embedder is {current}; \
         existing vectors are incompatible, run `ember index --force-reindex`"
    )]
    FingerprintMismatch { indexed: String, current: String },

    #[error("embedder failure: {0}")]
    EmbedderFailure(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("`git {command}` failed with exit code {code}: {stderr}")]
    VcsFailure {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl EmberError {
    /// User errors are misuses the caller can correct (exit code 2 in the
    /// shell); everything else is an internal failure (exit code 1).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            EmberError::NotInitialized { .. }
                | EmberError::NoCommits
                | EmberError::InvalidQuery { .. }
                | EmberError::InvalidConfig { .. }
                | EmberError::InvalidPathFilter { .. }
                | EmberError::FingerprintMismatch { .. }
        )
    }
}

impl From<rusqlite::Error> for EmberError {
    fn from(e: rusqlite::Error) -> Self {
        EmberError::StorageFailure(e.to_string())
    }
}

impl From<r2d2::Error> for EmberError {
    fn from(e: r2d2::Error) -> Self {
        EmberError::StorageFailure(e.to_string())
    }
}

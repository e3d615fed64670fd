//! Error types for local git operations.

use gitstream_core::SyncError;

/// Errors that can occur when working with a local mirror.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// A git subprocess exited non-zero for a reason other than a missing
    /// object. The message has the access token redacted.
    #[error("git {op} exited with status {code}: {message}")]
    Subprocess {
        op: &'static str,
        code: i32,
        message: String,
    },

    /// The requested object is not present in the mirror. Callers fall back
    /// to the remote path.
    #[error("object not present locally: {0}")]
    MissingObject(String),

    /// The diff parser hit a line it cannot classify.
    #[error("unexpected diff line: {0:?}")]
    DiffParse(String),

    /// `git log` output did not match the requested format.
    #[error("malformed log record: {0}")]
    LogParse(String),

    /// An I/O error occurred (spawning git, touching the working dir).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking mirror task panicked or was cancelled.
    #[error("mirror task failed: {0}")]
    Task(String),
}

impl GitError {
    /// Creates a subprocess error.
    pub fn subprocess(op: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self::Subprocess {
            op,
            code,
            message: message.into(),
        }
    }
}

impl From<GitError> for SyncError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::DiffParse(line) => SyncError::DiffParse(line),
            other => SyncError::git(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_parse_maps_to_sync_error() {
        let err: SyncError = GitError::DiffParse("?line".to_string()).into();
        assert!(matches!(err, SyncError::DiffParse(_)));

        let err: SyncError = GitError::subprocess("clone", 128, "boom").into();
        assert!(matches!(err, SyncError::Git(_)));
    }
}

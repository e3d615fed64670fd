//! Error taxonomy for a sync run.

/// Errors that can occur while replicating a repository.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The credentials were rejected outright.
    #[error("invalid credentials: {0}")]
    Credentials(String),

    /// The token lacks permission for a resource. Fatal for the stream that
    /// hit it; discretionary streams downgrade this to a logged skip.
    #[error("permission denied for {resource}: {reason}")]
    Permission { resource: String, reason: String },

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The API asked us to back off. Never fatal on its own.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// A 5xx that persisted through the retry budget.
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// A transport-level failure (connect, timeout, TLS).
    #[error("transient network error: {0}")]
    Transient(String),

    /// Any other unexpected API response.
    #[error("API error {status} for {url}: {body}")]
    Api { status: u16, url: String, body: String },

    /// The endpoint is disabled for this repository (410).
    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    /// An API payload was missing fields the connector depends on.
    #[error("malformed API payload: {0}")]
    Payload(String),

    /// Commit ancestors never materialized after exhausting pagination.
    #[error("commit parents never found: {0}")]
    GraphConsistency(String),

    /// The diff parser hit a line it cannot classify.
    #[error("diff parse error: {0}")]
    DiffParse(String),

    /// A local git operation failed.
    #[error("git error: {0}")]
    Git(String),

    /// The persisted state document is unusable.
    #[error("invalid state document: {0}")]
    State(String),

    /// Invalid connector configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a new credentials error.
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Creates a new permission error.
    pub fn permission(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a new git error.
    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    /// Creates a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Returns true if this error might succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Server { .. } | Self::RateLimited { .. }
        )
    }

    /// Returns true if a discretionary stream may swallow this error and
    /// continue with the rest of the run.
    pub fn is_skippable_for_stream(&self) -> bool {
        matches!(self, Self::Permission { .. } | Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::credentials("token rejected");
        assert_eq!(err.to_string(), "invalid credentials: token rejected");

        let err = SyncError::permission("acme/widgets teams", "admin rights required");
        assert_eq!(
            err.to_string(),
            "permission denied for acme/widgets teams: admin rights required"
        );

        let err = SyncError::GraphConsistency("deadbeef".to_string());
        assert_eq!(err.to_string(), "commit parents never found: deadbeef");
    }

    #[test]
    fn test_is_transient() {
        assert!(SyncError::Transient("reset by peer".to_string()).is_transient());
        assert!(
            SyncError::Server {
                status: 502,
                body: String::new()
            }
            .is_transient()
        );
        assert!(SyncError::RateLimited { retry_after_secs: 60 }.is_transient());
        assert!(!SyncError::credentials("nope").is_transient());
        assert!(!SyncError::DiffParse("?".to_string()).is_transient());
    }

    #[test]
    fn test_is_skippable_for_stream() {
        assert!(SyncError::permission("collaborators", "push access required").is_skippable_for_stream());
        assert!(SyncError::not_found("repo gone").is_skippable_for_stream());
        assert!(!SyncError::credentials("bad token").is_skippable_for_stream());
    }
}

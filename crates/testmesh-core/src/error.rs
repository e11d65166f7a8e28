//! Error types for TestMesh.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("action failed: {0}")]
    Handler(String),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("plugin error [{code}]: {message}")]
    Plugin { code: String, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the retry policy applies to this failure.
    ///
    /// Only action-level failures retry; config, assertion, cancellation and
    /// resolution failures surface on the first attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Handler(_) | Error::Plugin { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_action_failures_are_retryable() {
        assert!(Error::Handler("connection refused".into()).is_retryable());
        assert!(
            Error::Plugin {
                code: "E_REMOTE".into(),
                message: "backend down".into()
            }
            .is_retryable()
        );

        assert!(!Error::InvalidConfig("missing url".into()).is_retryable());
        assert!(!Error::UnknownAction("nope".into()).is_retryable());
        assert!(!Error::Assertion("status == 200".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::Timeout("deadline".into()).is_retryable());
    }
}

use thiserror::Error;

/// Every expected failure in the generate/validate/persist pipeline.
///
/// Collaborators return these instead of panicking; only a broken invariant
/// inside the crate itself is allowed to interrupt control flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PleaseError {
    #[error("task description must not be empty")]
    EmptyTask,

    #[error("invalid script response: {0}")]
    InvalidResponse(&'static str),

    #[error("could not reach provider {provider}: {message}")]
    Connectivity { provider: String, message: String },

    #[error("generation exceeded time budget of {seconds}s ({provider})")]
    Timeout { provider: String, seconds: u64 },

    #[error("response did not contain expected script field ({provider}): {message}")]
    Protocol { provider: String, message: String },

    #[error("{provider} returned status {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Context(String),

    #[error("{0}")]
    Storage(String),

    #[error("Failed to save script: {0}")]
    SaveFailed(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl PleaseError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PleaseError::Cancelled)
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        PleaseError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for PleaseError {
    fn from(err: rusqlite::Error) -> Self {
        PleaseError::storage(err)
    }
}

pub type Result<T> = std::result::Result<T, PleaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_failure_is_prefixed() {
        let err = PleaseError::SaveFailed("disk full".to_string());
        assert_eq!(err.to_string(), "Failed to save script: disk full");
    }

    #[test]
    fn context_and_storage_messages_are_verbatim() {
        assert_eq!(
            PleaseError::Context("no cwd".into()).to_string(),
            "no cwd"
        );
        assert_eq!(
            PleaseError::Storage("locked".into()).to_string(),
            "locked"
        );
    }

    #[test]
    fn only_cancelled_reports_cancellation() {
        assert!(PleaseError::Cancelled.is_cancelled());
        assert!(!PleaseError::EmptyTask.is_cancelled());
    }
}

use thiserror::Error;

use crate::{
    application::repos::RepoError, domain::error::DomainError, infra::error::InfraError,
    purge::PurgeError, queue::QueueError,
};

/// Top-level error surfaced by the binary's commands.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Purge(#[from] PurgeError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code for the error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Validation(_) | AppError::Domain(_) => 2,
            AppError::Purge(PurgeError::NotConfigured(_))
            | AppError::Infra(InfraError::Configuration { .. }) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_failures_use_dedicated_exit_code() {
        let err = AppError::from(PurgeError::NotConfigured("no driver".to_string()));
        assert_eq!(err.exit_code(), 3);

        let err = AppError::validation("bad id");
        assert_eq!(err.exit_code(), 2);

        let err = AppError::unexpected("boom");
        assert_eq!(err.exit_code(), 1);
    }
}

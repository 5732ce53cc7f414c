//! Error types for client construction

use thiserror::Error;

/// Errors building a [`crate::GitHubClient`]
#[derive(Debug, Error)]
pub enum GitHubError {
    /// The token cannot be sent as a header value
    #[error("invalid GitHub token: {message}")]
    InvalidToken {
        /// Error message
        message: String,
    },

    /// The HTTP client could not be built
    #[error("failed to build HTTP client: {message}")]
    ClientBuild {
        /// Error message
        message: String,
    },
}

//! Error types for the runner operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the runner it concerns where one is known, so that
//! `error_policy` logs stay attributable.

use std::time::Duration;

use thiserror::Error;

use crate::kube_utils::{api_error_code, is_conflict};
use crate::registration::RegistrationError;

/// Main error type for runner operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a Runner spec
    #[error("validation error for {runner}: {message}")]
    Validation {
        /// Name of the runner with invalid configuration
        runner: String,
        /// Description of what's invalid
        message: String,
    },

    /// Registration service call failed
    #[error("registration service error for {runner}: {source}")]
    Registration {
        /// Name of the runner the call was made for
        runner: String,
        /// The classified registration service error
        #[source]
        source: RegistrationError,
    },

    /// The runner is executing a job and cannot be removed from the registration service
    #[error("runner {runner} is busy")]
    RunnerBusy {
        /// Name of the busy runner
        runner: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "pod-builder", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with runner context
    pub fn validation_for(runner: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            runner: runner.into(),
            message: msg.into(),
        }
    }

    /// Wrap a registration service error with runner context
    pub fn registration(runner: impl Into<String>, source: RegistrationError) -> Self {
        Self::Registration {
            runner: runner.into(),
            source,
        }
    }

    /// Create a busy-runner error
    pub fn runner_busy(runner: impl Into<String>) -> Self {
        Self::RunnerBusy {
            runner: runner.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec fix. Kubernetes 4xx
    /// errors are permanent except stale-write conflicts and throttling (429).
    /// A busy runner is retried until it goes idle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } if is_conflict(source) => true,
            Error::Kube { source } => match api_error_code(source) {
                Some(429) => true,
                Some(code) => !(400..500).contains(&code),
                None => true,
            },
            Error::Validation { .. } => false,
            Error::Registration { .. } => true,
            Error::RunnerBusy { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Retry hint when this error came from a registration service rate limit
    pub fn rate_limit_retry_after(&self) -> Option<Option<Duration>> {
        match self {
            Error::Registration {
                source: RegistrationError::RateLimit { retry_after, .. },
                ..
            } => Some(*retry_after),
            _ => None,
        }
    }

    /// Get the runner name if this error is associated with a specific runner
    pub fn runner(&self) -> Option<&str> {
        match self {
            Error::Validation { runner, .. }
            | Error::Registration { runner, .. }
            | Error::RunnerBusy { runner } => Some(runner),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("{reason} happened"),
                reason: reason.to_string(),
                code,
            }),
        }
    }

    #[test]
    fn validation_errors_are_permanent() {
        let err = Error::validation_for("r1", "needs enterprise, organization or repository");
        assert!(!err.is_retryable());
        assert_eq!(err.runner(), Some("r1"));
        assert!(err.to_string().contains("r1"));
    }

    #[test]
    fn conflicts_and_throttling_are_retried() {
        assert!(api_error(409, "Conflict").is_retryable());
        assert!(api_error(429, "TooManyRequests").is_retryable());
        assert!(api_error(503, "ServiceUnavailable").is_retryable());
    }

    #[test]
    fn other_client_errors_are_permanent() {
        assert!(!api_error(403, "Forbidden").is_retryable());
        assert!(!api_error(422, "Invalid").is_retryable());
    }

    #[test]
    fn already_exists_is_not_a_stale_write() {
        assert!(!api_error(409, "AlreadyExists").is_retryable());
    }

    #[test]
    fn busy_runner_is_retried_with_backoff() {
        let err = Error::runner_busy("r1");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "runner r1 is busy");
        assert!(err.rate_limit_retry_after().is_none());
    }

    #[test]
    fn rate_limit_hint_is_exposed() {
        let err = Error::registration(
            "r1",
            RegistrationError::RateLimit {
                retry_after: Some(Duration::from_secs(42)),
                message: "API rate limit exceeded".to_string(),
            },
        );
        assert_eq!(
            err.rate_limit_retry_after(),
            Some(Some(Duration::from_secs(42)))
        );

        let not_rate_limited = Error::registration(
            "r1",
            RegistrationError::Api {
                status: 500,
                message: "boom".to_string(),
            },
        );
        assert!(not_rate_limited.rate_limit_retry_after().is_none());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let e = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: Error = e.into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }
}

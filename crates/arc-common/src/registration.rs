//! Registration service contract
//!
//! The registration service (a CI platform such as GitHub Actions) tracks
//! which self-hosted runners exist and whether they are idle, busy, or
//! offline. The controller only talks to it through [`RegistrationClient`],
//! so transport and authentication stay in the implementing crate.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Status string the registration service reports for a disconnected runner
pub const RUNNER_STATUS_OFFLINE: &str = "offline";

/// The scope a runner registers under: exactly one field is expected to be set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunnerTarget {
    /// Enterprise slug
    pub enterprise: String,
    /// Organization login
    pub organization: String,
    /// Repository in `owner/name` form
    pub repository: String,
}

impl RunnerTarget {
    /// Target an enterprise
    pub fn enterprise(name: impl Into<String>) -> Self {
        Self {
            enterprise: name.into(),
            ..Default::default()
        }
    }

    /// Target an organization
    pub fn organization(name: impl Into<String>) -> Self {
        Self {
            organization: name.into(),
            ..Default::default()
        }
    }

    /// Target a repository (`owner/name`)
    pub fn repository(name: impl Into<String>) -> Self {
        Self {
            repository: name.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for RunnerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.enterprise.is_empty() {
            write!(f, "enterprise/{}", self.enterprise)
        } else if !self.organization.is_empty() {
            write!(f, "organization/{}", self.organization)
        } else if !self.repository.is_empty() {
            write!(f, "repository/{}", self.repository)
        } else {
            write!(f, "<none>")
        }
    }
}

/// A runner as recorded by the registration service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredRunner {
    /// Numeric runner id assigned by the service
    pub id: i64,
    /// Runner name (matches the Runner resource name)
    pub name: String,
    /// Connection status, e.g. "online" or "offline"
    pub status: String,
    /// Whether the runner is executing a job
    pub busy: bool,
    /// Labels the runner registered with
    pub labels: Vec<String>,
}

impl RegisteredRunner {
    /// Whether the service reports the runner as disconnected
    pub fn is_offline(&self) -> bool {
        self.status.eq_ignore_ascii_case(RUNNER_STATUS_OFFLINE)
    }
}

/// A short-lived token the runner agent uses to register itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationToken {
    /// Opaque token value
    pub token: String,
    /// When the token stops being accepted for registration
    pub expires_at: DateTime<Utc>,
}

/// Errors returned by a [`RegistrationClient`]
///
/// The set is closed so the reconciler can match it exhaustively.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// No runner with this name is registered
    #[error("runner {name} not found")]
    NotFound {
        /// Runner name that was looked up
        name: String,
    },

    /// The runner is registered but disconnected
    #[error("runner {name} is offline")]
    Offline {
        /// Runner name that was looked up
        name: String,
    },

    /// The service is throttling this client
    #[error("rate limited: {message}")]
    RateLimit {
        /// How long the service asked us to wait, when it said
        retry_after: Option<Duration>,
        /// Message returned by the service
        message: String,
    },

    /// The service returned a non-success response
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Message returned by the service
        message: String,
    },

    /// The request never produced a response
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure
        message: String,
    },

    /// The response body could not be decoded
    #[error("decode error: {message}")]
    Decode {
        /// Description of the failure
        message: String,
    },

    /// The target names no enterprise, organization or repository
    #[error("invalid target: {message}")]
    InvalidTarget {
        /// Description of the problem
        message: String,
    },
}

impl RegistrationError {
    /// Whether this is a rate-limit rejection
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, RegistrationError::RateLimit { .. })
    }

    /// Retry hint carried by a rate-limit rejection
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RegistrationError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Client for the registration service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    /// Base URL of the service, handed to runner agents and folded into the pod hash
    fn base_url(&self) -> String;

    /// List every runner registered under the target
    async fn list_runners(
        &self,
        target: &RunnerTarget,
    ) -> Result<Vec<RegisteredRunner>, RegistrationError>;

    /// Report whether the named runner is busy
    ///
    /// Fails with `NotFound` when the runner is not registered and `Offline`
    /// when it is registered but disconnected.
    async fn is_runner_busy(
        &self,
        target: &RunnerTarget,
        name: &str,
    ) -> Result<bool, RegistrationError> {
        let runners = self.list_runners(target).await?;
        runner_busy_state(&runners, name)
    }

    /// Mint a registration token for the named runner
    async fn registration_token(
        &self,
        target: &RunnerTarget,
        name: &str,
    ) -> Result<RegistrationToken, RegistrationError>;

    /// Remove a runner by id
    async fn remove_runner(&self, target: &RunnerTarget, id: i64)
        -> Result<(), RegistrationError>;
}

/// Classify a runner by name within a listing
pub fn runner_busy_state(
    runners: &[RegisteredRunner],
    name: &str,
) -> Result<bool, RegistrationError> {
    let runner = runners
        .iter()
        .find(|r| r.name == name)
        .ok_or_else(|| RegistrationError::NotFound {
            name: name.to_string(),
        })?;

    if runner.is_offline() {
        return Err(RegistrationError::Offline {
            name: name.to_string(),
        });
    }

    Ok(runner.busy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(id: i64, name: &str, status: &str, busy: bool) -> RegisteredRunner {
        RegisteredRunner {
            id,
            name: name.to_string(),
            status: status.to_string(),
            busy,
            labels: vec![],
        }
    }

    #[test]
    fn target_display_uses_the_set_scope() {
        assert_eq!(
            RunnerTarget::repository("acme/app").to_string(),
            "repository/acme/app"
        );
        assert_eq!(
            RunnerTarget::organization("acme").to_string(),
            "organization/acme"
        );
        assert_eq!(RunnerTarget::enterprise("corp").to_string(), "enterprise/corp");
        assert_eq!(RunnerTarget::default().to_string(), "<none>");
    }

    #[test]
    fn busy_state_reports_busy_flag_for_online_runner() {
        let runners = vec![
            registered(1, "r1", "online", true),
            registered(2, "r2", "online", false),
        ];
        assert_eq!(runner_busy_state(&runners, "r1"), Ok(true));
        assert_eq!(runner_busy_state(&runners, "r2"), Ok(false));
    }

    #[test]
    fn busy_state_distinguishes_missing_and_offline() {
        let runners = vec![registered(1, "r1", "offline", false)];
        assert_eq!(
            runner_busy_state(&runners, "r1"),
            Err(RegistrationError::Offline {
                name: "r1".to_string()
            })
        );
        assert_eq!(
            runner_busy_state(&runners, "r9"),
            Err(RegistrationError::NotFound {
                name: "r9".to_string()
            })
        );
    }

    #[tokio::test]
    async fn mock_client_is_usable_as_trait_object() {
        let mut client = MockRegistrationClient::new();
        client
            .expect_list_runners()
            .times(1)
            .returning(|_| Ok(vec![registered(7, "r1", "online", true)]));
        client
            .expect_base_url()
            .return_const("https://github.com/".to_string());

        let client: std::sync::Arc<dyn RegistrationClient> = std::sync::Arc::new(client);
        let runners = client
            .list_runners(&RunnerTarget::repository("acme/app"))
            .await
            .unwrap();
        assert_eq!(runner_busy_state(&runners, "r1"), Ok(true));
        assert_eq!(client.base_url(), "https://github.com/");
    }

    #[test]
    fn rate_limit_helpers() {
        let err = RegistrationError::RateLimit {
            retry_after: Some(Duration::from_secs(30)),
            message: "slow down".to_string(),
        };
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert!(!RegistrationError::NotFound {
            name: "r1".to_string()
        }
        .is_rate_limit());
    }
}

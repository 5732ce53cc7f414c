//! GitHub Actions self-hosted runner API client
//!
//! Implements [`RegistrationClient`] over the REST endpoints under
//! `{enterprises,orgs,repos}/…/actions/runners`.

use std::time::Duration;

use arc_common::registration::{
    RegisteredRunner, RegistrationClient, RegistrationError, RegistrationToken, RunnerTarget,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::GitHubConfig;
use crate::error::GitHubError;

const HEADER_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RATELIMIT_RESET: &str = "x-ratelimit-reset";
const GITHUB_MEDIA_TYPE: &str = "application/vnd.github+json";
const CLIENT_USER_AGENT: &str = "actions-runner-controller";

/// One page of `GET …/actions/runners`
#[derive(Debug, Deserialize)]
struct RunnersPage {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    runners: Vec<RunnerRecord>,
}

#[derive(Debug, Deserialize)]
struct RunnerRecord {
    id: i64,
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    labels: Vec<RunnerLabel>,
}

#[derive(Debug, Deserialize)]
struct RunnerLabel {
    name: String,
}

impl From<RunnerRecord> for RegisteredRunner {
    fn from(r: RunnerRecord) -> Self {
        RegisteredRunner {
            id: r.id,
            name: r.name,
            status: r.status,
            busy: r.busy,
            labels: r.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

/// Response of `POST …/actions/runners/registration-token`
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// GitHub REST client
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
    api_url: String,
    per_page: u32,
}

impl GitHubClient {
    /// Build a client from configuration
    pub fn new(config: GitHubConfig) -> Result<Self, GitHubError> {
        let (base_url, api_url) = config.resolved_urls();

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token)).map_err(|e| {
            GitHubError::InvalidToken {
                message: e.to_string(),
            }
        })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_MEDIA_TYPE));
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| GitHubError::ClientBuild {
                message: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url,
            api_url,
            per_page: config.per_page.max(1),
        })
    }

    /// REST API URL this client talks to
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, RegistrationError> {
        let url = format!("{}{}", self.api_url, path);
        debug!(%method, %url, "calling GitHub API");

        let response = self
            .http
            .request(method, &url)
            .query(query)
            .send()
            .await
            .map_err(|e| RegistrationError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let err = classify_error(status, &headers, &body, Utc::now());
        if err.is_rate_limit() {
            warn!(%url, retry_after = ?err.retry_after(), "GitHub API rate limit hit");
        }
        Err(err)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RegistrationError> {
        let response = self.send(method, path, query).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RegistrationError::Decode {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl RegistrationClient for GitHubClient {
    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    async fn list_runners(
        &self,
        target: &RunnerTarget,
    ) -> Result<Vec<RegisteredRunner>, RegistrationError> {
        let path = runners_path(target)?;
        let mut runners = Vec::new();
        let mut page = 1u32;

        loop {
            let query = [
                ("per_page", self.per_page.to_string()),
                ("page", page.to_string()),
            ];
            let body: RunnersPage = self.send_json(Method::GET, &path, &query).await?;
            let received = body.runners.len();
            runners.extend(body.runners.into_iter().map(RegisteredRunner::from));

            if received == 0 || runners.len() >= body.total_count {
                break;
            }
            page += 1;
        }

        debug!(%target, count = runners.len(), "listed registered runners");
        Ok(runners)
    }

    async fn registration_token(
        &self,
        target: &RunnerTarget,
        name: &str,
    ) -> Result<RegistrationToken, RegistrationError> {
        let path = format!("{}/registration-token", runners_path(target)?);
        let body: TokenResponse = self.send_json(Method::POST, &path, &[]).await?;
        debug!(%target, runner = name, expires_at = %body.expires_at, "minted registration token");
        Ok(RegistrationToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }

    async fn remove_runner(&self, target: &RunnerTarget, id: i64) -> Result<(), RegistrationError> {
        let path = format!("{}/{}", runners_path(target)?, id);
        self.send(Method::DELETE, &path, &[]).await?;
        Ok(())
    }
}

/// API path of the runner collection for a target
pub fn runners_path(target: &RunnerTarget) -> Result<String, RegistrationError> {
    if !target.enterprise.is_empty() {
        return Ok(format!("enterprises/{}/actions/runners", target.enterprise));
    }
    if !target.organization.is_empty() {
        return Ok(format!("orgs/{}/actions/runners", target.organization));
    }
    if let Some((owner, repo)) = target.repository.split_once('/') {
        if !owner.is_empty() && !repo.is_empty() {
            return Ok(format!("repos/{owner}/{repo}/actions/runners"));
        }
    }
    Err(RegistrationError::InvalidTarget {
        message: format!("cannot address runners for target {target}"),
    })
}

/// Map a non-success response to a [`RegistrationError`]
///
/// 429, and 403 with an exhausted quota or a `retry-after` header, are rate
/// limits. Everything else is an API error carrying GitHub's message.
pub fn classify_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
) -> RegistrationError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());

    let quota_exhausted = header_str(headers, HEADER_RATELIMIT_REMAINING) == Some("0");
    let has_retry_after = headers.contains_key(RETRY_AFTER);

    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && (quota_exhausted || has_retry_after));

    if rate_limited {
        return RegistrationError::RateLimit {
            retry_after: retry_hint(headers, now),
            message,
        };
    }

    RegistrationError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Retry hint from `retry-after` (seconds) or `x-ratelimit-reset` (epoch seconds)
pub fn retry_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(secs) = header_str(headers, RETRY_AFTER.as_str()).and_then(|v| v.parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    header_str(headers, HEADER_RATELIMIT_RESET)
        .and_then(|v| v.parse::<i64>().ok())
        .map(|reset| Duration::from_secs(reset.saturating_sub(now.timestamp()).max(0) as u64))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn at(epoch: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(epoch, 0).unwrap()
    }

    // =========================================================================
    // Paths
    // =========================================================================

    #[test]
    fn paths_per_scope() {
        assert_eq!(
            runners_path(&RunnerTarget::enterprise("corp")).unwrap(),
            "enterprises/corp/actions/runners"
        );
        assert_eq!(
            runners_path(&RunnerTarget::organization("acme")).unwrap(),
            "orgs/acme/actions/runners"
        );
        assert_eq!(
            runners_path(&RunnerTarget::repository("acme/app")).unwrap(),
            "repos/acme/app/actions/runners"
        );
    }

    #[test]
    fn unscoped_or_malformed_target_is_rejected() {
        assert!(matches!(
            runners_path(&RunnerTarget::default()),
            Err(RegistrationError::InvalidTarget { .. })
        ));
        assert!(matches!(
            runners_path(&RunnerTarget::repository("app")),
            Err(RegistrationError::InvalidTarget { .. })
        ));
    }

    // =========================================================================
    // Error classification
    // =========================================================================

    #[test]
    fn too_many_requests_is_rate_limit_with_retry_after() {
        let err = classify_error(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after", "42")]),
            r#"{"message":"slow down"}"#,
            at(1_000),
        );
        assert_eq!(
            err,
            RegistrationError::RateLimit {
                retry_after: Some(Duration::from_secs(42)),
                message: "slow down".to_string(),
            }
        );
    }

    #[test]
    fn forbidden_with_exhausted_quota_uses_reset_time() {
        let err = classify_error(
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1060")]),
            r#"{"message":"API rate limit exceeded"}"#,
            at(1_000),
        );
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn reset_in_the_past_clamps_to_zero() {
        let hint = retry_hint(&headers(&[("x-ratelimit-reset", "900")]), at(1_000));
        assert_eq!(hint, Some(Duration::ZERO));
    }

    #[test]
    fn plain_forbidden_is_api_error() {
        let err = classify_error(
            StatusCode::FORBIDDEN,
            &headers(&[("x-ratelimit-remaining", "4999")]),
            r#"{"message":"Resource not accessible by integration"}"#,
            at(1_000),
        );
        assert_eq!(
            err,
            RegistrationError::Api {
                status: 403,
                message: "Resource not accessible by integration".to_string(),
            }
        );
    }

    #[test]
    fn non_json_body_is_kept_verbatim() {
        let err = classify_error(
            StatusCode::BAD_GATEWAY,
            &HeaderMap::new(),
            "  upstream down \n",
            at(1_000),
        );
        assert_eq!(
            err,
            RegistrationError::Api {
                status: 502,
                message: "upstream down".to_string(),
            }
        );
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    #[test]
    fn decodes_runner_page() {
        let body = r#"{
            "total_count": 2,
            "runners": [
                {"id": 1, "name": "r1", "os": "linux", "status": "online", "busy": true,
                 "labels": [{"id": 1, "name": "self-hosted", "type": "read-only"}]},
                {"id": 2, "name": "r2", "os": "linux", "status": "offline", "busy": false,
                 "labels": []}
            ]
        }"#;
        let page: RunnersPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.total_count, 2);
        let runners: Vec<RegisteredRunner> =
            page.runners.into_iter().map(RegisteredRunner::from).collect();
        assert!(runners[0].busy);
        assert_eq!(runners[0].labels, vec!["self-hosted".to_string()]);
        assert!(runners[1].is_offline());
    }

    #[test]
    fn decodes_token_with_offset() {
        let body = r#"{"token":"AABF3JGZDX3P5PMEXLND6TS6FCWO6","expires_at":"2020-01-22T12:13:35.123-08:00"}"#;
        let token: TokenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(token.token, "AABF3JGZDX3P5PMEXLND6TS6FCWO6");
        assert_eq!(token.expires_at.timestamp(), at(1_579_724_015).timestamp());
    }

    #[test]
    fn client_exposes_resolved_urls() {
        let client =
            GitHubClient::new(GitHubConfig::new("t").with_enterprise_url("https://ghe.local"))
                .unwrap();
        assert_eq!(client.base_url(), "https://ghe.local/");
        assert_eq!(client.api_url(), "https://ghe.local/api/v3/");
    }

    #[test]
    fn token_with_newline_is_rejected() {
        assert!(matches!(
            GitHubClient::new(GitHubConfig::new("bad\ntoken")),
            Err(GitHubError::InvalidToken { .. })
        ));
    }

    // =========================================================================
    // Calls against unaddressable targets
    // =========================================================================

    fn unreachable_client() -> GitHubClient {
        let mut config = GitHubConfig::new("t");
        config.api_url = "http://127.0.0.1:9/".to_string();
        GitHubClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn malformed_repository_fails_before_any_request() {
        let client = unreachable_client();
        let target = RunnerTarget::repository("no-slash");

        assert!(matches!(
            client.list_runners(&target).await,
            Err(RegistrationError::InvalidTarget { .. })
        ));
        assert!(matches!(
            client.registration_token(&target, "r1").await,
            Err(RegistrationError::InvalidTarget { .. })
        ));
        assert!(matches!(
            client.remove_runner(&target, 7).await,
            Err(RegistrationError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn busy_check_surfaces_invalid_target() {
        let client = unreachable_client();
        assert!(matches!(
            client.is_runner_busy(&RunnerTarget::default(), "r1").await,
            Err(RegistrationError::InvalidTarget { .. })
        ));
    }
}

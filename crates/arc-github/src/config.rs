//! GitHub endpoint and credential configuration

use std::time::Duration;

/// Public GitHub web URL, handed to runner agents
pub const DEFAULT_BASE_URL: &str = "https://github.com/";

/// Public GitHub REST API URL
pub const DEFAULT_API_URL: &str = "https://api.github.com/";

/// Page size for runner listings (the API maximum)
pub const DEFAULT_PER_PAGE: u32 = 100;

/// Request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`crate::GitHubClient`]
#[derive(Clone)]
pub struct GitHubConfig {
    /// Personal access token or installation token
    pub token: String,
    /// Web URL runner agents register against
    pub base_url: String,
    /// REST API URL
    pub api_url: String,
    /// GitHub Enterprise Server URL; overrides both URLs when set
    pub enterprise_url: Option<String>,
    /// Page size for listings
    pub per_page: u32,
    /// Per-request timeout
    pub timeout: Duration,
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("api_url", &self.api_url)
            .field("enterprise_url", &self.enterprise_url)
            .field("per_page", &self.per_page)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GitHubConfig {
    /// Configuration for github.com with the given token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            enterprise_url: None,
            per_page: DEFAULT_PER_PAGE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Point at a GitHub Enterprise Server instance
    pub fn with_enterprise_url(mut self, url: impl Into<String>) -> Self {
        self.enterprise_url = Some(url.into());
        self
    }

    /// Web and API URLs after applying the enterprise override, each with a trailing slash
    pub fn resolved_urls(&self) -> (String, String) {
        match self.enterprise_url.as_deref().filter(|u| !u.is_empty()) {
            Some(enterprise) => {
                let base = with_trailing_slash(enterprise);
                let api = if base.ends_with("/api/v3/") {
                    base.clone()
                } else {
                    format!("{base}api/v3/")
                };
                (base, api)
            }
            None => (
                with_trailing_slash(&self.base_url),
                with_trailing_slash(&self.api_url),
            ),
        }
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

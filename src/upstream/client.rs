//! Upstream media server client
//!
//! A thin pass-through: the gateway does not model upstream object shapes,
//! it relays JSON bodies and lets clients interpret them. What it does own
//! is error classification, because the rest of the crate depends on it:
//!
//! - network failures, timeouts, and upstream 5xx become `Upstream`
//!   (retryable, never cached)
//! - upstream 401 becomes `CredentialInvalid` (the stored token is dead,
//!   the user must re-link their account)
//! - everything else, 404s included, is a valid response worth relaying

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

use crate::credentials::UpstreamCredential;
use crate::types::{Result, UsherError};

/// Header carrying the per-user upstream token.
const UPSTREAM_TOKEN_HEADER: &str = "X-Media-Token";

/// Response relayed from upstream, uninterpreted.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

/// Account info returned by the upstream account endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpstreamAccount {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub subscription: bool,
}

/// HTTP client for one family of upstream media servers.
#[derive(Clone)]
pub struct MediaServerClient {
    http: reqwest::Client,
}

impl MediaServerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UsherError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// GET a resource with the user's credential.
    ///
    /// The raw query string passes through verbatim; normalization is the
    /// cache's concern, not the wire's.
    pub async fn fetch(
        &self,
        credential: &UpstreamCredential,
        path: &str,
        query: Option<&str>,
    ) -> Result<UpstreamResponse> {
        let url = match query {
            Some(q) if !q.is_empty() => format!("{}?{}", join_url(&credential.server_url, path), q),
            _ => join_url(&credential.server_url, path),
        };

        debug!(path = path, "Fetching from upstream");

        let response = self
            .http
            .get(&url)
            .header(UPSTREAM_TOKEN_HEADER, &credential.token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| classify_request_error(path, e))?;

        let status = response.status();
        if status.is_server_error() {
            warn!(path = path, status = %status, "Upstream server error");
            return Err(UsherError::Upstream(format!(
                "Upstream returned {} for {}",
                status, path
            )));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(UsherError::CredentialInvalid(
                "Upstream rejected the stored token".to_string(),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| UsherError::Upstream(format!("Body read from {} failed: {}", path, e)))?;

        Ok(UpstreamResponse {
            status: status.as_u16(),
            content_type,
            body,
        })
    }

    /// Validate a credential against the upstream account endpoint and
    /// return the account it belongs to.
    pub async fn validate(&self, credential: &UpstreamCredential) -> Result<UpstreamAccount> {
        let url = join_url(&credential.server_url, "/accounts/me");

        let response = self
            .http
            .get(&url)
            .header(UPSTREAM_TOKEN_HEADER, &credential.token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| classify_request_error("/accounts/me", e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UsherError::CredentialInvalid(
                "Upstream rejected the token during validation".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(UsherError::Upstream(format!(
                "Account validation returned {}",
                status
            )));
        }

        response
            .json::<UpstreamAccount>()
            .await
            .map_err(|e| UsherError::Upstream(format!("Account response unreadable: {}", e)))
    }

    /// Flip an item's watched state (mutating call, never cached).
    pub async fn set_watched(
        &self,
        credential: &UpstreamCredential,
        item_key: &str,
        watched: bool,
    ) -> Result<()> {
        let action = if watched { "watched" } else { "unwatched" };
        let url = join_url(
            &credential.server_url,
            &format!("/library/items/{}/{}", item_key, action),
        );

        let response = self
            .http
            .post(&url)
            .header(UPSTREAM_TOKEN_HEADER, &credential.token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| classify_request_error(item_key, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(UsherError::CredentialInvalid(
                "Upstream rejected the stored token".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(UsherError::Upstream(format!(
                "Watched update for {} returned {}",
                item_key, status
            )));
        }

        Ok(())
    }
}

fn classify_request_error(path: &str, e: reqwest::Error) -> UsherError {
    if e.is_timeout() {
        UsherError::Upstream(format!("Upstream timed out on {}", path))
    } else {
        UsherError::Upstream(format!("Request to {} failed: {}", path, e))
    }
}

/// Join a base URL and a path without doubling or dropping slashes.
fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

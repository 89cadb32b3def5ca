//! Client of a Mastodon compatible social API.
use async_trait::async_trait;
use log::info;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use feedsink_core::config::SocialFeedConfig;
use feedsink_core::error::FeedError;

/// Remote side of the poll ingestor.
#[async_trait]
pub trait SocialClient: Send + Sync {
    /// Resolve an account handle to its id.
    async fn lookup_account(&self, account: &str) -> Result<String, FeedError>;

    /// Up to `limit` items of `account_id` newer than `min_id`.
    async fn fetch_page(
        &self,
        account_id: &str,
        min_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>, FeedError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct Account {
    id: String,
}

/// `SocialClient` over HTTP, with a bearer token.
#[derive(Debug, Clone)]
pub struct MastodonClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl MastodonClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Build a client from configuration, requesting a token with the password grant when
    /// none is configured.
    pub async fn connect(config: &SocialFeedConfig) -> Result<Self, FeedError> {
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Self::new(&config.api_url, token));
        }

        let (Some(client_id), Some(client_secret), Some(username), Some(password)) = (
            config.client_id.as_deref(),
            config.client_secret.as_deref(),
            config.username.as_deref(),
            config.password.as_deref(),
        ) else {
            return Err(FeedError::Auth(
                "no token configured and no password grant credentials".to_string(),
            ));
        };

        let client = reqwest::Client::new();
        let base_url = config.api_url.trim_end_matches('/');

        let response = client
            .post(format!("{}/oauth/token", base_url))
            .json(&json!({
                "client_id": client_id,
                "client_secret": client_secret,
                "grant_type": "password",
                "username": username,
                "password": password,
                "redirect_uri": "urn:ietf:wg:oauth:2.0:oob",
                "scope": "read",
            }))
            .send()
            .await
            .map_err(|e| FeedError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Auth(format!("token request failed, status: {}", status)));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| FeedError::Auth(format!("invalid token response: {}", e)))?;

        info!("acquired social api token for {}", username);

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            token: token.access_token,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, FeedError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| FeedError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, response.headers()));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| FeedError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl SocialClient for MastodonClient {
    async fn lookup_account(&self, account: &str) -> Result<String, FeedError> {
        let value = self
            .get("/api/v1/accounts/lookup", &[("acct", account.to_string())])
            .await?;

        serde_json::from_value::<Account>(value)
            .map(|a| a.id)
            .map_err(|e| FeedError::Malformed(format!("account lookup: {}", e)))
    }

    async fn fetch_page(
        &self,
        account_id: &str,
        min_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>, FeedError> {
        let mut query = vec![
            ("limit", limit.to_string()),
            ("exclude_replies", "true".to_string()),
        ];
        if let Some(min_id) = min_id {
            query.push(("min_id", min_id.to_string()));
        }

        let value = self
            .get(&format!("/api/v1/accounts/{}/statuses", account_id), &query)
            .await?;

        match value {
            Value::Array(items) => Ok(items),
            other => Err(FeedError::Malformed(format!(
                "expected a list of statuses, got: {}",
                other
            ))),
        }
    }
}

/// Map a non-success status to the error kind the caller reacts to.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> FeedError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FeedError::Auth(format!("status {}", status))
        }
        StatusCode::TOO_MANY_REQUESTS => FeedError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        _ => FeedError::Transient(format!("status {}", status)),
    }
}

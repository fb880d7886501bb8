//! Credential capability consumed by the transport.
//!
//! The transport never stores tokens itself. It asks a [`CredentialProvider`]
//! for the current bearer token and, after a 401, for exactly one refresh.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::AuthError;

/// Source of bearer tokens for authenticated calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current access token, or `None` when running unauthenticated.
    async fn access_token(&self) -> Result<Option<String>, AuthError>;

    /// Obtain a new access token after the server rejected the current one.
    async fn refresh(&self) -> Result<String, AuthError>;
}

/// Fixed token with no refresh capability.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    /// Use `token` for every request.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Send requests without an `Authorization` header.
    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        Err(AuthError::NoRefreshToken)
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Response of the refresh endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenPair {
    /// New access token.
    pub access_token: String,
    /// Rotated refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Token type, normally `bearer`.
    #[serde(default)]
    pub token_type: Option<String>,
    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// Access/refresh token pair rotated through `POST {base}/auth/refresh`.
pub struct RefreshTokenCredentials {
    http: reqwest::Client,
    refresh_url: String,
    tokens: Mutex<Tokens>,
}

impl RefreshTokenCredentials {
    /// Create a provider for the API rooted at `base_url`.
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        access_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Self {
        Self {
            http,
            refresh_url: format!("{}/auth/refresh", base_url.trim_end_matches('/')),
            tokens: Mutex::new(Tokens {
                access: access_token,
                refresh: refresh_token,
            }),
        }
    }
}

#[async_trait]
impl CredentialProvider for RefreshTokenCredentials {
    async fn access_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.tokens.lock().await.access.clone())
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        // Held across the call so concurrent refreshes run one at a time.
        let mut tokens = self.tokens.lock().await;
        let refresh_token = tokens.refresh.clone().ok_or(AuthError::NoRefreshToken)?;

        debug!(url = %self.refresh_url, "refreshing access token");
        let response = self
            .http
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "token refresh rejected");
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
                message: nimbus_core::text::truncate_with_suffix(&message, 200, "..."),
            });
        }

        let pair: TokenPair = response.json().await?;
        info!(expires_in = ?pair.expires_in, "access token refreshed");
        tokens.access = Some(pair.access_token.clone());
        if let Some(rotated) = pair.refresh_token {
            tokens.refresh = Some(rotated);
        }
        Ok(pair.access_token)
    }
}

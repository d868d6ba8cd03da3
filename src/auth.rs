use std::fmt;

use anyhow::{Context, Result};
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::backend::ClientConfig;
use crate::error::SyncError;

/// The account a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub username: String,
}

/// Credential pair handed out by the issuance endpoint.
#[derive(Clone)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub user: Option<UserRef>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

/// Unauthenticated client for the credential endpoints of the backend.
#[derive(Debug, Clone)]
pub struct AuthClient {
    base_url: Url,
    user_agent: String,
    http: Client,
}

impl AuthClient {
    pub fn new(cfg: ClientConfig) -> Result<Self> {
        let http = cfg.build_http().context("auth")?;
        Ok(Self {
            base_url: cfg.base_url,
            user_agent: cfg.user_agent,
            http,
        })
    }

    /// `POST /api/token/` with the account credentials.
    pub async fn issue_tokens(&self, username: &str, password: &str) -> Result<TokenPair, SyncError> {
        let body = json!({ "username": username, "password": password });
        let resp = self.post("api/token/", &body).await?;
        let resp = ensure_success(resp, "token request").await?;

        let payload: TokenResponse = resp
            .json()
            .await
            .map_err(|err| SyncError::transient("auth: decode token response", err))?;
        if payload.access.is_empty() {
            return Err(SyncError::Transient("auth: missing access token".into()));
        }
        if payload.refresh.is_empty() {
            return Err(SyncError::Transient("auth: missing refresh token".into()));
        }

        Ok(TokenPair {
            access: payload.access,
            refresh: payload.refresh,
            user: payload.user,
        })
    }

    /// `POST /api/token/refresh/`; returns the new access credential only.
    pub async fn refresh_access(&self, refresh_token: &str) -> Result<String, SyncError> {
        let body = json!({ "refresh": refresh_token });
        let resp = self.post("api/token/refresh/", &body).await?;
        let resp = ensure_success(resp, "refresh").await?;

        let payload: RefreshResponse = resp
            .json()
            .await
            .map_err(|err| SyncError::transient("auth: decode refresh response", err))?;
        if payload.access.is_empty() {
            return Err(SyncError::Transient(
                "auth: missing refreshed access token".into(),
            ));
        }
        Ok(payload.access)
    }

    /// `POST /api/user/register/`.
    pub async fn register(&self, username: &str, password: &str) -> Result<(), SyncError> {
        let body = json!({ "username": username, "password": password });
        let resp = self.post("api/user/register/", &body).await?;
        ensure_success(resp, "register").await?;
        Ok(())
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, SyncError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| SyncError::transient("auth: build url", err))?;
        self.http
            .post(url)
            .header(USER_AGENT, self.user_agent.clone())
            .json(body)
            .send()
            .await
            .map_err(|err| SyncError::transient("auth: request", err))
    }
}

async fn ensure_success(
    resp: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => err.to_string(),
        Err(_) => body,
    };
    match status {
        StatusCode::BAD_REQUEST if operation != "register" => {
            tracing::debug!(%status, operation, %detail, "auth: request rejected");
            Err(SyncError::Unauthorized)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            tracing::debug!(%status, operation, %detail, "auth: credentials rejected");
            Err(SyncError::Unauthorized)
        }
        _ => Err(SyncError::Transient(format!(
            "auth: {operation} failed ({status}): {detail}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access: String,
    #[serde(default)]
    refresh: String,
    #[serde(default)]
    user: Option<UserRef>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: String,
    #[serde(default)]
    code: String,
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.detail.is_empty(), self.code.is_empty()) {
            (true, true) => write!(f, "unknown error"),
            (false, true) => write!(f, "{}", self.detail),
            (true, false) => write!(f, "{}", self.code),
            (false, false) => write!(f, "{} ({})", self.detail, self.code),
        }
    }
}

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::SyncError;
use crate::ledger::{EntityId, EntityKind};
use crate::session::SessionManager;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/";

/// Connection settings shared by every HTTP client in the crate.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub user_agent: String,
    pub timeout: Duration,
    pub http_client: Option<Client>,
}

impl ClientConfig {
    pub(crate) fn build_http(&self) -> Result<Client> {
        if self.user_agent.trim().is_empty() {
            bail!("http client user agent required");
        }
        match &self.http_client {
            Some(client) => Ok(client.clone()),
            None => Client::builder()
                .timeout(if self.timeout.is_zero() {
                    Duration::from_secs(20)
                } else {
                    self.timeout
                })
                .build()
                .context("build http client"),
        }
    }
}

/// Client for the authenticated backend endpoints.
///
/// Every authorized request carries the session's current access credential.
/// A 401 triggers one coalesced refresh and a single retry; a second 401 is
/// reported as [`SyncError::Unauthorized`].
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
    user_agent: String,
    session: SessionManager,
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Profile {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub avatar_name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub cards_collected: u32,
    #[serde(default, deserialize_with = "decimal")]
    pub average_episode_rating: f64,
    #[serde(default, deserialize_with = "decimal")]
    pub average_character_rating: f64,
}

/// Partial profile write; only the fields that are set are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ProfileUpdate::default()
    }
}

#[derive(Debug, Deserialize)]
struct AverageRating {
    #[serde(default, deserialize_with = "decimal")]
    average_rating: f64,
}

impl BackendClient {
    pub fn new(config: ClientConfig, session: SessionManager) -> Result<Self> {
        let http = config.build_http().context("backend")?;
        Ok(Self {
            http,
            base_url: config.base_url,
            user_agent: config.user_agent,
            session,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Mean rating across all users. Public; works without a session.
    pub async fn average_rating(&self, kind: EntityKind, id: EntityId) -> Result<f64, SyncError> {
        let url = self.url(&format!("api/average_rating/{}/{id}/", kind.singular()))?;
        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone())
            .send()
            .await?;
        let resp = ensure_success(resp, "average rating").await?;
        let body: AverageRating = resp.json().await?;
        Ok(body.average_rating)
    }

    /// The signed-in user's profile, or `None` without a session.
    pub async fn profile(&self) -> Result<Option<Profile>, SyncError> {
        if self.session.require_authenticated().await.is_err() {
            return Ok(None);
        }
        match self.get_json::<Profile>("api/profile/").await {
            Ok(profile) => Ok(Some(profile)),
            Err(SyncError::NotFound(_)) | Err(SyncError::Unauthorized) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<Profile, SyncError> {
        self.session.require_authenticated().await?;
        let body = serde_json::to_value(update)
            .map_err(|err| SyncError::transient("backend: encode profile", err))?;
        self.post_json("api/profile/", &body)
            .await
            .map_err(SyncError::normalized)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let resp = self.send_authorized(Method::GET, path, None).await?;
        Ok(resp.json().await?)
    }

    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, SyncError> {
        let resp = self.send_authorized(Method::POST, path, Some(body)).await?;
        Ok(resp.json().await?)
    }

    async fn send_authorized(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, SyncError> {
        let url = self.url(path)?;
        let token = self.session.access_token().await?;
        let resp = self.send(method.clone(), url.clone(), &token, body).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return ensure_success(resp, path).await;
        }

        // A rejection of a token that was already replaced needs no new refresh.
        if self.session.snapshot().access_token.as_deref() == Some(token.as_str()) {
            debug!(path, "backend: access token rejected, refreshing");
            self.session.refresh().await?;
        } else {
            debug!(path, "backend: stale access token rejected, retrying");
        }
        let token = self.session.access_token().await?;
        let resp = self.send(method, url, &token, body).await?;
        ensure_success(resp, path).await
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        token: &str,
        body: Option<&Value>,
    ) -> Result<Response, SyncError> {
        let mut req = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(AUTHORIZATION, format!("Bearer {token}"));
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path)
            .map_err(|err| SyncError::transient("backend: build url", err))
    }
}

async fn ensure_success(resp: Response, operation: &str) -> Result<Response, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Unauthorized),
        StatusCode::NOT_FOUND => Err(SyncError::NotFound(operation.to_string())),
        _ => Err(SyncError::Transient(format!(
            "backend: {operation} failed ({status}): {body}"
        ))),
    }
}

/// Accepts `"4.5"`, `4.5`, `4` or `null`; the backend formats averages as
/// one-decimal strings.
pub(crate) fn decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Decimal {
        Number(f64),
        Text(String),
    }

    match Option::<Decimal>::deserialize(deserializer)? {
        None => Ok(0.0),
        Some(Decimal::Number(value)) => Ok(value),
        Some(Decimal::Text(text)) if text.trim().is_empty() => Ok(0.0),
        Some(Decimal::Text(text)) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_accepts_string_and_number() {
        let parsed: AverageRating = serde_json::from_str(r#"{"average_rating":"4.5"}"#).unwrap();
        assert_eq!(parsed.average_rating, 4.5);
        let parsed: AverageRating = serde_json::from_str(r#"{"average_rating":3}"#).unwrap();
        assert_eq!(parsed.average_rating, 3.0);
        let parsed: AverageRating = serde_json::from_str(r#"{"average_rating":"0.0"}"#).unwrap();
        assert_eq!(parsed.average_rating, 0.0);
        assert!(serde_json::from_str::<AverageRating>(r#"{"average_rating":"n/a"}"#).is_err());
    }

    #[test]
    fn profile_decodes_backend_shape() {
        let profile: Profile = serde_json::from_str(
            r#"{
                "owner": 3,
                "username": "morty",
                "first_name": "Morty",
                "last_name": "Smith",
                "avatar_url": "/images/default_avatar.jpeg",
                "avatar_name": "None",
                "bio": "aw geez",
                "cards_collected": 4,
                "average_episode_rating": "0.0",
                "average_character_rating": "3.7"
            }"#,
        )
        .unwrap();
        assert_eq!(profile.username, "morty");
        assert_eq!(profile.cards_collected, 4);
        assert_eq!(profile.average_character_rating, 3.7);
    }

    #[test]
    fn profile_update_sends_only_set_fields() {
        let update = ProfileUpdate {
            bio: Some("wubba lubba".into()),
            ..ProfileUpdate::default()
        };
        assert!(!update.is_empty());
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({ "bio": "wubba lubba" })
        );
        assert!(ProfileUpdate::default().is_empty());
    }

    #[test]
    fn config_requires_user_agent() {
        let cfg = ClientConfig {
            base_url: DEFAULT_BASE_URL.parse().unwrap(),
            user_agent: String::new(),
            timeout: Duration::ZERO,
            http_client: None,
        };
        assert!(cfg.build_http().is_err());
    }
}

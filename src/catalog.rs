use std::future::Future;

use anyhow::{Context, Result};
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::ClientConfig;
use crate::cursor::PageCursor;
use crate::error::SyncError;
use crate::ledger::{EntityId, EntityKind};

pub const DEFAULT_BASE_URL: &str = "https://rickandmortyapi.com/api/";
pub const NOT_FOUND_IMAGE: &str = "https://rickandmortyapi.com/api/character/avatar/19.jpeg";
pub const NOT_FOUND_NAME: &str = "Not Found";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedLink {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub species: String,
    #[serde(default, rename = "type")]
    pub subtype: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub origin: NamedLink,
    #[serde(default)]
    pub location: NamedLink,
    #[serde(default)]
    pub image: String,
    /// Episode URLs in airing order.
    #[serde(default)]
    pub episode: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub created: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub air_date: String,
    /// Production code, e.g. `S01E01`.
    #[serde(default)]
    pub episode: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub created: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CatalogEntity {
    Character(Character),
    Episode(Episode),
}

impl CatalogEntity {
    /// Placeholder rendered in place of an entity that could not be fetched.
    pub fn not_found(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Character => CatalogEntity::Character(Character {
                id: 0,
                name: NOT_FOUND_NAME.into(),
                status: "Unknown".into(),
                species: "Error".into(),
                location: NamedLink {
                    name: "Rickipedia".into(),
                    url: String::new(),
                },
                image: NOT_FOUND_IMAGE.into(),
                ..Character::default()
            }),
            EntityKind::Episode => CatalogEntity::Episode(Episode {
                id: 0,
                name: NOT_FOUND_NAME.into(),
                air_date: "Unknown".into(),
                episode: "Error".into(),
                ..Episode::default()
            }),
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            CatalogEntity::Character(c) => c.id,
            CatalogEntity::Episode(e) => e.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            CatalogEntity::Character(_) => EntityKind::Character,
            CatalogEntity::Episode(_) => EntityKind::Episode,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CatalogEntity::Character(c) => &c.name,
            CatalogEntity::Episode(e) => &e.name,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id() == 0
    }

    /// URL of the first episode a character appears in.
    pub fn first_episode_url(&self) -> Option<&str> {
        match self {
            CatalogEntity::Character(c) => c.episode.first().map(String::as_str),
            CatalogEntity::Episode(_) => None,
        }
    }
}

impl From<Character> for CatalogEntity {
    fn from(value: Character) -> Self {
        CatalogEntity::Character(value)
    }
}

impl From<Episode> for CatalogEntity {
    fn from(value: Episode) -> Self {
        CatalogEntity::Episode(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageInfo {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub pages: u32,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub prev: Option<String>,
}

/// One page of a catalog listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub info: PageInfo,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

/// Read-only access to the external catalog.
pub trait CatalogService: Send + Sync + 'static {
    fn fetch_entity(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> impl Future<Output = Result<CatalogEntity, SyncError>> + Send;

    /// Resolves an episode reference as found in `Character::episode`.
    fn fetch_episode_at(&self, url: &str) -> impl Future<Output = Result<Episode, SyncError>> + Send;
}

#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: Url,
    user_agent: String,
}

impl CatalogClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = config.build_http().context("catalog")?;
        Ok(Self {
            http,
            base_url: config.base_url,
            user_agent: config.user_agent,
        })
    }

    /// First page of the listing for `kind`.
    pub fn listing_url(&self, kind: EntityKind) -> Result<Url> {
        self.base_url
            .join(&format!("{}/?page=1", kind.singular()))
            .context("catalog: build listing url")
    }

    /// A cursor positioned at the first listing page for `kind`.
    pub fn cursor<T>(&self, kind: EntityKind) -> Result<PageCursor<T>>
    where
        T: DeserializeOwned + Clone + Send,
    {
        let cursor = PageCursor::new(self.http.clone(), self.user_agent.clone());
        cursor.initialize(self.listing_url(kind)?.to_string());
        Ok(cursor)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, SyncError> {
        let resp = self
            .http
            .get(url.clone())
            .header(USER_AGENT, self.user_agent.clone())
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(SyncError::Transient(format!(
                "catalog: {url} returned {status}"
            )));
        }
        Ok(resp.json().await?)
    }
}

impl CatalogService for CatalogClient {
    async fn fetch_entity(&self, kind: EntityKind, id: EntityId) -> Result<CatalogEntity, SyncError> {
        let url = self
            .base_url
            .join(&format!("{}/{id}", kind.singular()))
            .map_err(|err| SyncError::transient("catalog: build url", err))?;
        match kind {
            EntityKind::Character => self.get::<Character>(url).await.map(CatalogEntity::from),
            EntityKind::Episode => self.get::<Episode>(url).await.map(CatalogEntity::from),
        }
    }

    async fn fetch_episode_at(&self, url: &str) -> Result<Episode, SyncError> {
        let url = Url::parse(url)
            .or_else(|_| self.base_url.join(url))
            .map_err(|err| SyncError::transient("catalog: episode reference", err))?;
        self.get(url).await
    }
}

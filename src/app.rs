use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use crate::auth::AuthClient;
use crate::backend::{BackendClient, ClientConfig, Profile, ProfileUpdate};
use crate::catalog::{CatalogClient, CatalogEntity, CatalogService, Character, Episode};
use crate::cli::{Cli, Commands};
use crate::config::{self, Config};
use crate::cursor::{LoadOutcome, PageCursor};
use crate::error::SyncError;
use crate::join::{self, CollectionFeed, EntityJoinPipeline, JoinedEntity};
use crate::ledger::{CollectionLedgerClient, EntityId, EntityKind, LedgerChange, LedgerService, Rating};
use crate::session::{SessionManager, SessionStatus};
use crate::storage::{self, CredentialStore};
use crate::toggle::OptimisticToggleEngine;
use crate::view::EntityList;

type Pipeline = EntityJoinPipeline<CatalogClient, CollectionLedgerClient>;

pub async fn run(cli: Cli) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: cli.config.clone(),
        env_prefix: None,
    })
    .context("load config")?;

    let store = storage::SqliteCredentialStore::open(storage::Options {
        path: cfg.storage.path.clone(),
    })
    .context("open credential store")?;

    let app = App::new(&cfg, Arc::new(store))?;
    let out = Output { json: cli.json };
    app.execute(cli.command, &out).await
}

/// Everything a command needs, wired once per process.
pub struct App {
    session: SessionManager,
    backend: Arc<BackendClient>,
    catalog: Arc<CatalogClient>,
    pipeline: Arc<Pipeline>,
    toggles: OptimisticToggleEngine<CollectionLedgerClient>,
    collection_batch: usize,
}

impl App {
    pub fn new(cfg: &Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let backend_cfg = ClientConfig {
            base_url: parse_base_url(&cfg.backend.base_url).context("backend.base_url")?,
            user_agent: cfg.backend.user_agent.clone(),
            timeout: cfg.backend.timeout,
            http_client: None,
        };
        let catalog_cfg = ClientConfig {
            base_url: parse_base_url(&cfg.catalog.base_url).context("catalog.base_url")?,
            ..backend_cfg.clone()
        };

        let auth = AuthClient::new(backend_cfg.clone())?;
        let session = SessionManager::new(auth, store, cfg.session.refresh_skew);
        let backend = Arc::new(BackendClient::new(backend_cfg, session.clone())?);
        let catalog = Arc::new(CatalogClient::new(catalog_cfg)?);
        let ledger = Arc::new(CollectionLedgerClient::new(backend.clone()));
        let pipeline = Arc::new(EntityJoinPipeline::new(catalog.clone(), ledger.clone()));
        let toggles = OptimisticToggleEngine::new(ledger, session.clone());

        Ok(Self {
            session,
            backend,
            catalog,
            pipeline,
            toggles,
            collection_batch: cfg.catalog.collection_batch,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub async fn execute(&self, command: Commands, out: &Output) -> Result<()> {
        match command {
            Commands::Login { username, password } => {
                match self.session.login(&username, &password).await {
                    Ok(user) => out.line(format!("Logged in as {}.", user.username)),
                    Err(err) => bail!(self.failure_message(err)),
                }
            }
            Commands::Register { username, password } => {
                match self.session.register(&username, &password).await {
                    Ok(user) => out.line(format!("Registered and logged in as {}.", user.username)),
                    Err(err) => bail!(self.failure_message(err)),
                }
            }
            Commands::Logout => {
                self.session.logout();
                out.line("Logged out.".to_string());
            }
            Commands::Status => self.status(out).await?,
            Commands::Characters { pages, search } => {
                let mut entities = self.browse::<Character>(EntityKind::Character, pages).await?;
                if let Some(query) = search.as_deref() {
                    entities = join::search_by_name(&entities, query);
                }
                out.entities(&entities)?;
            }
            Commands::Episodes { pages, season } => {
                let entities = self.browse::<Episode>(EntityKind::Episode, pages).await?;
                out.entities(&join::filter_by_season(&entities, season))?;
            }
            Commands::Collection { kind, all } => self.collection(kind, all, out).await?,
            Commands::Rate { kind, id, rating } => {
                let rating = Rating::new(rating)?;
                self.toggle(kind, id, LedgerChange::Rating(rating), out).await?;
            }
            Commands::Collect { kind, id } => {
                self.toggle(kind, id, LedgerChange::Collected(true), out).await?;
            }
            Commands::Uncollect { kind, id } => {
                self.toggle(kind, id, LedgerChange::Collected(false), out).await?;
            }
            Commands::Average { kind, id } => {
                let average = self.backend.average_rating(kind, id).await?;
                if out.json {
                    out.json_value(&serde_json::json!({ "kind": kind, "id": id, "average_rating": average }))?;
                } else {
                    out.line(format!("{kind} #{id}: {average:.1} / 5"));
                }
            }
            Commands::Profile {
                first_name,
                last_name,
                avatar_url,
                avatar_name,
                bio,
            } => {
                let update = ProfileUpdate {
                    first_name,
                    last_name,
                    avatar_url,
                    avatar_name,
                    bio,
                };
                self.profile(update, out).await?;
            }
        }
        Ok(())
    }

    async fn status(&self, out: &Output) -> Result<()> {
        self.session.bootstrap().await;
        let snapshot = self.session.snapshot();
        let status = snapshot.status.normalized();
        let expires = snapshot
            .expires_at
            .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0));

        if out.json {
            #[derive(Serialize)]
            struct StatusView<'a> {
                status: String,
                username: Option<&'a str>,
                expires_at: Option<String>,
                error: Option<&'a str>,
            }
            return out.json_value(&StatusView {
                status: format!("{status:?}").to_lowercase(),
                username: snapshot.user.as_ref().map(|u| u.username.as_str()),
                expires_at: expires.map(|at| at.to_rfc3339()),
                error: snapshot.error.as_deref(),
            });
        }

        match (status, snapshot.user.as_ref()) {
            (SessionStatus::Authenticated, Some(user)) if !user.username.is_empty() => {
                out.line(format!("Logged in as {}.", user.username))
            }
            (SessionStatus::Authenticated, _) => out.line("Logged in.".to_string()),
            _ => out.line("Not logged in.".to_string()),
        }
        if let Some(at) = expires {
            out.line(format!("Access token expires {}.", at.to_rfc3339()));
        }
        if let Some(error) = snapshot.error {
            out.line(error);
        }
        Ok(())
    }

    /// Loads `pages` catalog pages, then the user's ledger rows and first
    /// appearances for what was loaded.
    async fn browse<T>(&self, kind: EntityKind, pages: usize) -> Result<Vec<JoinedEntity>>
    where
        T: serde::de::DeserializeOwned + Clone + Send + Into<CatalogEntity>,
    {
        let cursor: PageCursor<T> = self.catalog.cursor(kind)?;
        for _ in 0..pages.max(1) {
            match cursor.load_next().await {
                LoadOutcome::Loaded { .. } => {}
                LoadOutcome::Failed { error, .. } => return Err(error).context("load catalog page"),
                LoadOutcome::Skipped | LoadOutcome::Discarded => break,
            }
            if !cursor.has_more() {
                break;
            }
        }

        let list = EntityList::from_entities(
            cursor
                .items()
                .into_iter()
                .map(|item| JoinedEntity::new(item.into(), None))
                .collect(),
        );
        let ids: Vec<EntityId> = list.snapshot().iter().map(|e| e.id).collect();
        self.pipeline.attach_ledger(&list, kind, &ids).await;
        if kind == EntityKind::Character {
            self.pipeline.enrich_batch(&list, &ids).await;
        }
        Ok(list.snapshot())
    }

    async fn collection(&self, kind: EntityKind, all: bool, out: &Output) -> Result<()> {
        if self.session.require_authenticated().await.is_err() {
            bail!("Not logged in. Run `rickdex login` first.");
        }
        let feed = CollectionFeed::new(self.pipeline.clone(), kind, self.collection_batch);
        if all {
            feed.load_all().await?;
        } else if let LoadOutcome::Failed { error, .. } = feed.load_next().await {
            return Err(error).context("load collection");
        }

        let entities = feed.list().snapshot();
        if entities.is_empty() && !out.json {
            out.line("Collect a card to get started!".to_string());
            return Ok(());
        }
        out.entities(&entities)?;
        if feed.has_more() && !out.json {
            out.line("More cards available; pass --all to load everything.".to_string());
        }
        Ok(())
    }

    async fn toggle(&self, kind: EntityKind, id: EntityId, change: LedgerChange, out: &Output) -> Result<()> {
        if self.session.require_authenticated().await.is_err() {
            bail!("Not logged in. Run `rickdex login` first.");
        }

        let base = match self.catalog.fetch_entity(kind, id).await {
            Ok(base) => base,
            Err(SyncError::NotFound(_)) => bail!("{kind} #{id} does not exist"),
            Err(err) => return Err(err).context("load card"),
        };
        let ledger = self.pipeline.ledger().fetch_record(kind, id).await.ok().flatten();
        let list = EntityList::from_entities(vec![JoinedEntity::new(base, ledger)]);

        let result = self.toggles.toggle(&list, kind, id, change).await;
        let entity = list
            .get(kind, id)
            .ok_or_else(|| anyhow!("{kind} #{id} vanished from the view"))?;
        match result {
            Ok(()) => out.entities(std::slice::from_ref(&entity)),
            Err(err) => Err(err).context(format!("update {kind} #{id}")),
        }
    }

    async fn profile(&self, update: ProfileUpdate, out: &Output) -> Result<()> {
        let profile = if update.is_empty() {
            self.backend.profile().await?
        } else {
            match self.backend.update_profile(&update).await {
                Ok(profile) => Some(profile),
                Err(SyncError::Unauthorized) => None,
                Err(err) => return Err(err).context("update profile"),
            }
        };
        match profile {
            Some(profile) => out.profile(&profile),
            None => bail!("Not logged in. Run `rickdex login` first."),
        }
    }

    fn failure_message(&self, err: SyncError) -> String {
        match self.session.error() {
            Some(message) => format!("{message} ({err})"),
            None => err.to_string(),
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).with_context(|| format!("invalid url {raw:?}"))
}

/// Text or JSON rendering for command results.
pub struct Output {
    pub json: bool,
}

impl Output {
    fn line(&self, text: String) {
        println!("{text}");
    }

    fn json_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn entities(&self, entities: &[JoinedEntity]) -> Result<()> {
        if self.json {
            return self.json_value(entities);
        }
        for entity in entities {
            println!("{}", render_entity(entity));
        }
        Ok(())
    }

    fn profile(&self, profile: &Profile) -> Result<()> {
        if self.json {
            return self.json_value(profile);
        }
        let full_name = format!("{} {}", profile.first_name, profile.last_name);
        println!("{} ({})", profile.username, full_name.trim());
        if !profile.bio.is_empty() {
            println!("  {}", profile.bio);
        }
        println!("  cards collected: {}", profile.cards_collected);
        println!(
            "  average rating: episodes {:.1}, characters {:.1}",
            profile.average_episode_rating, profile.average_character_rating
        );
        Ok(())
    }
}

fn render_entity(entity: &JoinedEntity) -> String {
    let rating = match entity.rating() {
        Some(rating) => format!("{}{}", "*".repeat(rating.get() as usize), ".".repeat(5 - rating.get() as usize)),
        None => ".....".to_string(),
    };
    let collected = if entity.is_collected() { "collected" } else { "" };
    let detail = match &entity.base {
        CatalogEntity::Character(c) => {
            let first = entity
                .derived
                .first_appearance_name
                .as_deref()
                .unwrap_or("Unknown");
            format!("{} {} - {} (first seen: {first})", c.status, c.species, c.location.name)
        }
        CatalogEntity::Episode(e) => format!("{} - {}", e.episode, e.air_date),
    };
    format!(
        "#{:<4} {:<32} {rating} {collected:<9} {detail}",
        entity.id,
        entity.name()
    )
}

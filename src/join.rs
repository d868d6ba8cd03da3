//! Joining ledger rows with catalog bodies.
//!
//! The ledger only knows identifiers; the catalog only knows bodies. The
//! pipeline fetches bodies for a run of identifiers concurrently, keeps
//! source order, and substitutes a "Not Found" sentinel for any body that
//! cannot be fetched. Enrichment (a character's first-appearance episode
//! name) runs afterwards, per entity, and only ever adds to an entry.

use std::ops::RangeInclusive;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::{CatalogEntity, CatalogService};
use crate::cursor::LoadOutcome;
use crate::error::SyncError;
use crate::ledger::{EntityId, EntityKind, LedgerRecord, LedgerService, Rating};
use crate::view::EntityList;

pub const DEFAULT_COLLECTION_BATCH: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DerivedAttributes {
    pub first_appearance_name: Option<String>,
}

/// A catalog body joined with the user's ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub base: CatalogEntity,
    pub ledger: Option<LedgerRecord>,
    pub derived: DerivedAttributes,
}

impl JoinedEntity {
    pub fn new(base: CatalogEntity, ledger: Option<LedgerRecord>) -> Self {
        Self {
            id: base.id(),
            kind: base.kind(),
            base,
            ledger,
            derived: DerivedAttributes::default(),
        }
    }

    pub fn sentinel(kind: EntityKind) -> Self {
        Self::new(CatalogEntity::not_found(kind), None)
    }

    pub fn is_sentinel(&self) -> bool {
        self.base.is_sentinel()
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn rating(&self) -> Option<Rating> {
        self.ledger.as_ref().and_then(|record| record.rating)
    }

    pub fn is_collected(&self) -> bool {
        self.ledger.as_ref().is_some_and(|record| record.is_collected)
    }
}

pub struct EntityJoinPipeline<C, L> {
    catalog: Arc<C>,
    ledger: Arc<L>,
}

impl<C, L> EntityJoinPipeline<C, L>
where
    C: CatalogService,
    L: LedgerService,
{
    pub fn new(catalog: Arc<C>, ledger: Arc<L>) -> Self {
        Self { catalog, ledger }
    }

    pub fn catalog(&self) -> &Arc<C> {
        &self.catalog
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Every collected entity of `kind`, joined, in ledger order.
    ///
    /// Fails only if the ledger listing itself fails; individual catalog
    /// failures become sentinels.
    pub async fn resolve_collection(&self, kind: EntityKind) -> Result<Vec<JoinedEntity>, SyncError> {
        let rows = self.ledger.list_collection(kind).await?;
        Ok(self.join_records(kind, rows).await)
    }

    /// Fetches a body for each row concurrently. Output order and length match
    /// `rows`.
    pub async fn join_records(&self, kind: EntityKind, rows: Vec<LedgerRecord>) -> Vec<JoinedEntity> {
        join_all(rows.into_iter().map(|row| async move {
            match self.catalog.fetch_entity(kind, row.entity_id).await {
                Ok(base) => JoinedEntity::new(base, Some(row)),
                Err(err) => {
                    warn!(%kind, id = row.entity_id, error = %err, "join: catalog fetch failed, using placeholder");
                    JoinedEntity::sentinel(kind)
                }
            }
        }))
        .await
    }

    /// Name of the first episode a character appears in. `None` for
    /// episodes, sentinels, characters without episodes, or on any failure.
    pub async fn first_appearance(&self, base: &CatalogEntity) -> Option<String> {
        if base.is_sentinel() {
            return None;
        }
        let url = base.first_episode_url()?;
        match self.catalog.fetch_episode_at(url).await {
            Ok(episode) => Some(episode.name),
            Err(err) => {
                debug!(id = base.id(), %url, error = %err, "join: first appearance unavailable");
                None
            }
        }
    }

    /// Returns `entity` with its first-appearance name filled in when it can
    /// be resolved, unchanged otherwise.
    pub async fn enrich_first_appearance(&self, mut entity: JoinedEntity) -> JoinedEntity {
        if entity.kind != EntityKind::Character || entity.derived.first_appearance_name.is_some() {
            return entity;
        }
        if let Some(name) = self.first_appearance(&entity.base).await {
            entity.derived.first_appearance_name = Some(name);
        }
        entity
    }

    /// Enriches the characters `ids` of `list` concurrently and writes each
    /// result back by identifier. Results for entries removed in the
    /// meantime, or for a closed list, are dropped. Returns how many entries
    /// were written.
    pub async fn enrich_batch(&self, list: &EntityList, ids: &[EntityId]) -> usize {
        let targets: Vec<JoinedEntity> = ids
            .iter()
            .filter(|id| **id != 0)
            .filter_map(|id| list.get(EntityKind::Character, *id))
            .filter(|entity| entity.derived.first_appearance_name.is_none())
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let resolved = join_all(targets.iter().map(|entity| async move {
            (entity.id, self.first_appearance(&entity.base).await)
        }))
        .await;

        if list.is_closed() {
            debug!("join: view closed during enrichment, dropping results");
            return 0;
        }

        let mut written = 0;
        for (id, name) in resolved {
            let Some(name) = name else { continue };
            let applied = list.update(EntityKind::Character, id, |entity| {
                entity.derived.first_appearance_name = Some(name);
            });
            match applied {
                Some(()) => written += 1,
                None => debug!(id, "join: entity left the list, dropping enrichment"),
            }
        }
        written
    }

    /// Loads the ledger row for each listed entity and writes it back by
    /// identifier. Failures leave the entry's ledger as it was.
    pub async fn attach_ledger(&self, list: &EntityList, kind: EntityKind, ids: &[EntityId]) -> usize {
        let fetched = join_all(ids.iter().copied().filter(|id| *id != 0).map(|id| async move {
            (id, self.ledger.fetch_record(kind, id).await)
        }))
        .await;

        if list.is_closed() {
            return 0;
        }

        let mut written = 0;
        for (id, result) in fetched {
            match result {
                Ok(Some(record)) => {
                    if list.update(kind, id, |entity| entity.ledger = Some(record)).is_some() {
                        written += 1;
                    }
                }
                Ok(None) => {}
                Err(err) => debug!(%kind, id, error = %err, "join: ledger row unavailable"),
            }
        }
        written
    }
}

struct FeedState {
    rows: Option<Vec<LedgerRecord>>,
    position: usize,
    is_loading: bool,
    last_error: Option<SyncError>,
}

/// A user's collection, resolved `batch` identifiers at a time.
///
/// The identifier list is fetched once, on the first load. Each later load
/// joins the next batch, appends it to the list, then enriches that batch.
pub struct CollectionFeed<C, L> {
    pipeline: Arc<EntityJoinPipeline<C, L>>,
    kind: EntityKind,
    batch: usize,
    list: EntityList,
    state: Mutex<FeedState>,
}

impl<C, L> CollectionFeed<C, L>
where
    C: CatalogService,
    L: LedgerService,
{
    pub fn new(pipeline: Arc<EntityJoinPipeline<C, L>>, kind: EntityKind, batch: usize) -> Self {
        Self {
            pipeline,
            kind,
            batch: batch.max(1),
            list: EntityList::new(),
            state: Mutex::new(FeedState {
                rows: None,
                position: 0,
                is_loading: false,
                last_error: None,
            }),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn list(&self) -> &EntityList {
        &self.list
    }

    pub fn has_more(&self) -> bool {
        let state = self.state.lock();
        match &state.rows {
            None => true,
            Some(rows) => state.position < rows.len(),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().is_loading
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.state.lock().last_error.clone()
    }

    pub async fn load_next(&self) -> LoadOutcome {
        let needs_rows = {
            let mut state = self.state.lock();
            if self.list.is_closed() {
                return LoadOutcome::Discarded;
            }
            if state.is_loading {
                return LoadOutcome::Skipped;
            }
            if let Some(rows) = &state.rows {
                if state.position >= rows.len() {
                    return LoadOutcome::Skipped;
                }
            }
            state.is_loading = true;
            state.rows.is_none()
        };

        if needs_rows {
            let listed = self.pipeline.ledger().list_collection(self.kind).await;
            let mut state = self.state.lock();
            match listed {
                Ok(rows) => {
                    debug!(kind = %self.kind, count = rows.len(), "feed: collection listed");
                    state.rows = Some(rows);
                }
                Err(err) => {
                    warn!(kind = %self.kind, error = %err, "feed: collection listing failed");
                    state.is_loading = false;
                    state.last_error = Some(err.clone());
                    return LoadOutcome::failed(err);
                }
            }
        }

        let (slice, end) = {
            let state = self.state.lock();
            let rows = state.rows.as_deref().unwrap_or_default();
            let end = (state.position + self.batch).min(rows.len());
            (rows[state.position.min(end)..end].to_vec(), end)
        };

        let joined = self.pipeline.join_records(self.kind, slice).await;
        let ids: Vec<EntityId> = joined.iter().map(|entity| entity.id).collect();
        let added = joined.len();

        {
            let mut state = self.state.lock();
            state.is_loading = false;
            if !self.list.extend(joined) {
                debug!(kind = %self.kind, "feed: closed while joining, dropping batch");
                return LoadOutcome::Discarded;
            }
            state.position = end;
            state.last_error = None;
        }

        if self.kind == EntityKind::Character {
            self.pipeline.enrich_batch(&self.list, &ids).await;
        }
        LoadOutcome::Loaded { added }
    }

    /// Loads batches until the collection is exhausted or a load fails.
    pub async fn load_all(&self) -> Result<usize, SyncError> {
        let mut total = 0;
        while self.has_more() {
            match self.load_next().await {
                LoadOutcome::Loaded { added } => total += added,
                LoadOutcome::Failed { error, .. } => return Err(error),
                LoadOutcome::Skipped | LoadOutcome::Discarded => break,
            }
        }
        Ok(total)
    }

    pub fn close(&self) {
        self.list.close();
    }
}

/// Catalog episode ids aired in `season`.
pub fn season_range(season: u8) -> Option<RangeInclusive<EntityId>> {
    match season {
        1 => Some(1..=11),
        2 => Some(12..=21),
        3 => Some(22..=31),
        4 => Some(32..=41),
        5 => Some(42..=51),
        _ => None,
    }
}

/// Episodes of `season`; everything when `season` is `None`, nothing for an
/// unknown season.
pub fn filter_by_season(entities: &[JoinedEntity], season: Option<u8>) -> Vec<JoinedEntity> {
    let Some(season) = season else {
        return entities.to_vec();
    };
    let Some(range) = season_range(season) else {
        return Vec::new();
    };
    entities
        .iter()
        .filter(|entity| entity.kind == EntityKind::Episode && range.contains(&entity.id))
        .cloned()
        .collect()
}

/// Case-insensitive substring match on the entity name.
pub fn search_by_name(entities: &[JoinedEntity], query: &str) -> Vec<JoinedEntity> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return entities.to_vec();
    }
    entities
        .iter()
        .filter(|entity| entity.name().to_lowercase().contains(&query))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::catalog::Episode;
    use crate::ledger::LedgerChange;
    use crate::test_support::{character, episode};

    #[derive(Default)]
    struct FakeCatalog {
        entities: HashMap<(EntityKind, EntityId), CatalogEntity>,
        episodes: HashMap<String, Episode>,
        entity_calls: AtomicUsize,
    }

    impl FakeCatalog {
        fn with_character(mut self, id: EntityId, first_episode: &str) -> Self {
            self.entities.insert(
                (EntityKind::Character, id),
                character(id, &[first_episode]),
            );
            self
        }

        fn with_episode_ref(mut self, url: &str, name: &str) -> Self {
            self.episodes.insert(
                url.to_string(),
                Episode {
                    id: 1,
                    name: name.into(),
                    ..Episode::default()
                },
            );
            self
        }
    }

    impl CatalogService for FakeCatalog {
        async fn fetch_entity(&self, kind: EntityKind, id: EntityId) -> Result<CatalogEntity, SyncError> {
            self.entity_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.entities
                .get(&(kind, id))
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("{kind} {id}")))
        }

        async fn fetch_episode_at(&self, url: &str) -> Result<Episode, SyncError> {
            tokio::task::yield_now().await;
            self.episodes
                .get(url)
                .cloned()
                .ok_or_else(|| SyncError::Transient(format!("{url} unreachable")))
        }
    }

    #[derive(Default)]
    struct FakeLedger {
        rows: Vec<LedgerRecord>,
        fail_listing: bool,
    }

    impl FakeLedger {
        fn collected(kind: EntityKind, ids: &[EntityId]) -> Self {
            Self {
                rows: ids
                    .iter()
                    .map(|id| LedgerRecord {
                        is_collected: true,
                        ..LedgerRecord::empty(kind, *id)
                    })
                    .collect(),
                fail_listing: false,
            }
        }
    }

    impl LedgerService for FakeLedger {
        async fn list_collection(&self, kind: EntityKind) -> Result<Vec<LedgerRecord>, SyncError> {
            if self.fail_listing {
                return Err(SyncError::Transient("backend down".into()));
            }
            Ok(self
                .rows
                .iter()
                .filter(|row| row.entity_kind == kind)
                .cloned()
                .collect())
        }

        async fn fetch_record(
            &self,
            kind: EntityKind,
            id: EntityId,
        ) -> Result<Option<LedgerRecord>, SyncError> {
            Ok(self
                .rows
                .iter()
                .find(|row| row.entity_kind == kind && row.entity_id == id)
                .cloned())
        }

        async fn write_record(
            &self,
            kind: EntityKind,
            id: EntityId,
            change: LedgerChange,
        ) -> Result<LedgerRecord, SyncError> {
            let mut record = LedgerRecord::empty(kind, id);
            record.apply(change);
            Ok(record)
        }
    }

    fn pipeline(catalog: FakeCatalog, ledger: FakeLedger) -> Arc<EntityJoinPipeline<FakeCatalog, FakeLedger>> {
        Arc::new(EntityJoinPipeline::new(Arc::new(catalog), Arc::new(ledger)))
    }

    const PILOT: &str = "https://rickandmortyapi.com/api/episode/1";

    #[tokio::test]
    async fn failed_fetch_becomes_sentinel() {
        let pipeline = pipeline(
            FakeCatalog::default(),
            FakeLedger::collected(EntityKind::Character, &[42]),
        );

        let joined = pipeline.resolve_collection(EntityKind::Character).await.unwrap();

        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].id, 0);
        assert_eq!(joined[0].name(), "Not Found");
        assert!(joined[0].is_sentinel());
    }

    #[tokio::test]
    async fn join_keeps_ledger_order_and_rows() {
        let catalog = FakeCatalog::default()
            .with_character(3, PILOT)
            .with_character(1, PILOT)
            .with_character(2, PILOT);
        let pipeline = pipeline(catalog, FakeLedger::collected(EntityKind::Character, &[3, 1, 2]));

        let joined = pipeline.resolve_collection(EntityKind::Character).await.unwrap();

        let ids: Vec<_> = joined.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert!(joined.iter().all(|e| e.is_collected()));
    }

    #[tokio::test]
    async fn enrichment_failure_is_isolated() {
        let broken = "https://rickandmortyapi.com/api/episode/999";
        let catalog = FakeCatalog::default()
            .with_character(1, PILOT)
            .with_character(2, PILOT)
            .with_character(3, broken)
            .with_character(4, PILOT)
            .with_character(5, PILOT)
            .with_episode_ref(PILOT, "Pilot");
        let pipeline = pipeline(
            catalog,
            FakeLedger::collected(EntityKind::Character, &[1, 2, 3, 4, 5]),
        );
        let joined = pipeline.resolve_collection(EntityKind::Character).await.unwrap();
        let list = EntityList::from_entities(joined);

        let written = pipeline.enrich_batch(&list, &[1, 2, 3, 4, 5]).await;

        assert_eq!(written, 4);
        let snapshot = list.snapshot();
        assert_eq!(snapshot.len(), 5);
        let ids: Vec<_> = snapshot.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        for entity in &snapshot {
            if entity.id == 3 {
                assert!(entity.derived.first_appearance_name.is_none());
                assert_eq!(entity.name(), "Character 3");
                assert!(entity.ledger.is_some());
            } else {
                assert_eq!(entity.derived.first_appearance_name.as_deref(), Some("Pilot"));
            }
        }
    }

    #[tokio::test]
    async fn enrichment_for_removed_entity_is_dropped() {
        let catalog = FakeCatalog::default()
            .with_character(1, PILOT)
            .with_character(2, PILOT)
            .with_episode_ref(PILOT, "Pilot");
        let pipeline = pipeline(catalog, FakeLedger::collected(EntityKind::Character, &[1, 2]));
        let list = EntityList::from_entities(
            pipeline.resolve_collection(EntityKind::Character).await.unwrap(),
        );

        let enrich = pipeline.enrich_batch(&list, &[1, 2]);
        let remove = async {
            list.remove(EntityKind::Character, 1);
        };
        let (written, ()) = tokio::join!(enrich, remove);

        assert_eq!(written, 1);
        let snapshot = list.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, 2);
        assert_eq!(snapshot[0].derived.first_appearance_name.as_deref(), Some("Pilot"));
    }

    #[tokio::test]
    async fn closed_view_receives_no_enrichment() {
        let catalog = FakeCatalog::default()
            .with_character(1, PILOT)
            .with_episode_ref(PILOT, "Pilot");
        let pipeline = pipeline(catalog, FakeLedger::collected(EntityKind::Character, &[1]));
        let list = EntityList::from_entities(
            pipeline.resolve_collection(EntityKind::Character).await.unwrap(),
        );

        let enrich = pipeline.enrich_batch(&list, &[1]);
        let close = async {
            list.close();
        };
        let (written, ()) = tokio::join!(enrich, close);

        assert_eq!(written, 0);
        assert!(list.snapshot()[0].derived.first_appearance_name.is_none());
    }

    #[tokio::test]
    async fn episodes_are_not_enriched() {
        let pipeline = pipeline(FakeCatalog::default(), FakeLedger::default());
        let entity = JoinedEntity::new(episode(7), None);
        let out = pipeline.enrich_first_appearance(entity.clone()).await;
        assert_eq!(out, entity);
    }

    #[tokio::test]
    async fn feed_pages_through_collection_in_batches() {
        let ids: Vec<EntityId> = (1..=5).collect();
        let mut catalog = FakeCatalog::default().with_episode_ref(PILOT, "Pilot");
        for id in &ids {
            catalog = catalog.with_character(*id, PILOT);
        }
        let pipeline = pipeline(catalog, FakeLedger::collected(EntityKind::Character, &ids));
        let feed = CollectionFeed::new(pipeline.clone(), EntityKind::Character, 2);

        assert!(feed.has_more());
        assert_eq!(feed.load_next().await, LoadOutcome::Loaded { added: 2 });
        assert_eq!(feed.load_next().await, LoadOutcome::Loaded { added: 2 });
        assert_eq!(feed.load_next().await, LoadOutcome::Loaded { added: 1 });
        assert!(!feed.has_more());
        assert_eq!(feed.load_next().await, LoadOutcome::Skipped);

        let snapshot = feed.list().snapshot();
        let seen: HashSet<_> = snapshot.iter().map(|e| e.id).collect();
        assert_eq!(snapshot.len(), 5);
        assert_eq!(seen.len(), 5);
        assert!(snapshot
            .iter()
            .all(|e| e.derived.first_appearance_name.as_deref() == Some("Pilot")));
        assert_eq!(pipeline.catalog().entity_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn feed_listing_failure_is_retryable_and_keeps_state() {
        let ledger = FakeLedger {
            fail_listing: true,
            ..FakeLedger::default()
        };
        let feed = CollectionFeed::new(
            pipeline(FakeCatalog::default(), ledger),
            EntityKind::Episode,
            DEFAULT_COLLECTION_BATCH,
        );

        match feed.load_next().await {
            LoadOutcome::Failed { retryable, .. } => assert!(retryable),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(feed.has_more());
        assert!(!feed.is_loading());
        assert!(feed.last_error().is_some());
        assert!(feed.list().is_empty());
    }

    #[tokio::test]
    async fn feed_closed_mid_join_drops_batch() {
        let catalog = FakeCatalog::default()
            .with_character(1, PILOT)
            .with_character(2, PILOT);
        let feed = CollectionFeed::new(
            pipeline(catalog, FakeLedger::collected(EntityKind::Character, &[1, 2])),
            EntityKind::Character,
            DEFAULT_COLLECTION_BATCH,
        );

        let (outcome, _) = tokio::join!(feed.load_next(), async { feed.close() });

        assert_eq!(outcome, LoadOutcome::Discarded);
        assert!(feed.list().is_empty());
        assert!(!feed.is_loading());
        assert!(feed.has_more());
        assert_eq!(feed.load_next().await, LoadOutcome::Discarded);
    }

    #[tokio::test]
    async fn empty_collection_has_no_more_after_first_load() {
        let feed = CollectionFeed::new(
            pipeline(FakeCatalog::default(), FakeLedger::default()),
            EntityKind::Episode,
            DEFAULT_COLLECTION_BATCH,
        );
        assert_eq!(feed.load_all().await, Ok(0));
        assert!(!feed.has_more());
    }

    #[tokio::test]
    async fn attach_ledger_writes_by_identity() {
        let ledger = FakeLedger::collected(EntityKind::Episode, &[2]);
        let pipeline = pipeline(FakeCatalog::default(), ledger);
        let list = EntityList::from_entities(vec![
            JoinedEntity::new(episode(1), None),
            JoinedEntity::new(episode(2), None),
        ]);

        let written = pipeline.attach_ledger(&list, EntityKind::Episode, &[1, 2]).await;

        assert_eq!(written, 1);
        let snapshot = list.snapshot();
        assert!(snapshot[0].ledger.is_none());
        assert!(snapshot[1].is_collected());
    }

    #[test]
    fn season_filter_uses_fixed_ranges() {
        let all: Vec<_> = [1, 11, 12, 21, 22, 51]
            .into_iter()
            .map(|id| JoinedEntity::new(episode(id), None))
            .collect();

        let ids = |season: Option<u8>| -> Vec<EntityId> {
            filter_by_season(&all, season).iter().map(|e| e.id).collect()
        };
        assert_eq!(ids(Some(1)), vec![1, 11]);
        assert_eq!(ids(Some(2)), vec![12, 21]);
        assert_eq!(ids(Some(5)), vec![51]);
        assert_eq!(ids(None).len(), 6);
        assert!(ids(Some(9)).is_empty());
    }

    #[test]
    fn name_search_is_case_insensitive() {
        let all = vec![
            JoinedEntity::new(character(1, &[]), None),
            JoinedEntity::new(character(12, &[]), None),
            JoinedEntity::new(episode(1), None),
        ];
        let hits = search_by_name(&all, "CHARACTER 1");
        assert_eq!(hits.len(), 2);
        assert_eq!(search_by_name(&all, "  ").len(), 3);
        assert!(search_by_name(&all, "squanchy").is_empty());
    }
}

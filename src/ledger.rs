//! The backend's per-user record of ratings and collected flags.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::BackendClient;
use crate::error::SyncError;

/// Catalog identifier. The sentinel entity uses `0`.
pub type EntityId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Character,
    Episode,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Character, EntityKind::Episode];

    /// Path segment used by the catalog and the average-rating endpoint.
    pub fn singular(&self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Episode => "episode",
        }
    }

    /// Path segment used by the ledger and collection endpoints.
    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Character => "characters",
            EntityKind::Episode => "episodes",
        }
    }

    pub fn id_field(&self) -> &'static str {
        match self {
            EntityKind::Character => "character_id",
            EntityKind::Episode => "episode_id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.singular())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity kind {0:?} (expected character or episode)")]
pub struct UnknownKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "character" | "characters" => Ok(EntityKind::Character),
            "episode" | "episodes" => Ok(EntityKind::Episode),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A star or heart rating, always within `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Rating(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rating must be between 1 and 5, got {0}")]
pub struct RatingOutOfRange(pub i64);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: u8) -> Result<Self, RatingOutOfRange> {
        Self::try_from(i64::from(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rating {
    type Error = RatingOutOfRange;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&value) {
            Ok(Rating(value as u8))
        } else {
            Err(RatingOutOfRange(value))
        }
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cached copy of one backend ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerRecord {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub rating: Option<Rating>,
    pub is_collected: bool,
}

impl LedgerRecord {
    pub fn empty(kind: EntityKind, id: EntityId) -> Self {
        Self {
            entity_id: id,
            entity_kind: kind,
            rating: None,
            is_collected: false,
        }
    }

    /// Unrated and not collected; indistinguishable from no record at all.
    pub fn is_blank(&self) -> bool {
        self.rating.is_none() && !self.is_collected
    }

    pub fn value(&self, field: LedgerField) -> FieldValue {
        match field {
            LedgerField::Rating => FieldValue::Rating(self.rating),
            LedgerField::Collected => FieldValue::Collected(self.is_collected),
        }
    }

    pub fn set(&mut self, value: FieldValue) {
        match value {
            FieldValue::Rating(rating) => self.rating = rating,
            FieldValue::Collected(collected) => self.is_collected = collected,
        }
    }

    /// Applies `change` and returns the value it replaced.
    pub fn apply(&mut self, change: LedgerChange) -> FieldValue {
        let prior = self.value(change.field());
        self.set(change.into());
        prior
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerField {
    Rating,
    Collected,
}

/// A user-initiated write to one ledger field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerChange {
    Rating(Rating),
    Collected(bool),
}

impl LedgerChange {
    pub fn field(&self) -> LedgerField {
        match self {
            LedgerChange::Rating(_) => LedgerField::Rating,
            LedgerChange::Collected(_) => LedgerField::Collected,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            LedgerChange::Rating(rating) => json!({ "rating": rating.get() }),
            LedgerChange::Collected(collected) => json!({ "is_collected": collected }),
        }
    }
}

/// A field's value, including "unrated".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Rating(Option<Rating>),
    Collected(bool),
}

impl From<LedgerChange> for FieldValue {
    fn from(change: LedgerChange) -> Self {
        match change {
            LedgerChange::Rating(rating) => FieldValue::Rating(Some(rating)),
            LedgerChange::Collected(collected) => FieldValue::Collected(collected),
        }
    }
}

/// Read/write access to the ledger.
pub trait LedgerService: Send + Sync + 'static {
    /// Collected rows for `kind`, in backend order. Empty without a session.
    fn list_collection(
        &self,
        kind: EntityKind,
    ) -> impl Future<Output = Result<Vec<LedgerRecord>, SyncError>> + Send;

    /// The current row for one entity, or `None` without a session.
    fn fetch_record(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<LedgerRecord>, SyncError>> + Send;

    /// Writes one field and returns the row as the backend stored it.
    fn write_record(
        &self,
        kind: EntityKind,
        id: EntityId,
        change: LedgerChange,
    ) -> impl Future<Output = Result<LedgerRecord, SyncError>> + Send;
}

#[derive(Debug, Clone)]
pub struct CollectionLedgerClient {
    backend: Arc<BackendClient>,
}

impl CollectionLedgerClient {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self { backend }
    }

    /// Waits out any in-flight refresh so concurrent reads see the same session.
    async fn signed_in(&self) -> bool {
        self.backend.session().require_authenticated().await.is_ok()
    }
}

impl LedgerService for CollectionLedgerClient {
    async fn list_collection(&self, kind: EntityKind) -> Result<Vec<LedgerRecord>, SyncError> {
        if !self.signed_in().await {
            return Ok(Vec::new());
        }
        let path = format!("api/collection/{}/", kind.plural());
        let rows: Vec<WireRecord> = match self.backend.get_json(&path).await {
            Ok(rows) => rows,
            Err(SyncError::Unauthorized) => {
                debug!(%kind, "ledger: session lost while listing collection");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match row.entity_id(kind) {
                Some(id) => records.push(row.into_record(kind, id)),
                None => warn!(%kind, "ledger: collection row without {}", kind.id_field()),
            }
        }
        Ok(records)
    }

    async fn fetch_record(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<Option<LedgerRecord>, SyncError> {
        if !self.signed_in().await {
            return Ok(None);
        }
        let path = format!("api/{}/ratings/{id}/", kind.plural());
        match self.backend.get_json::<WireRecord>(&path).await {
            Ok(row) => Ok(Some(row.into_record(kind, id))),
            Err(SyncError::Unauthorized) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write_record(
        &self,
        kind: EntityKind,
        id: EntityId,
        change: LedgerChange,
    ) -> Result<LedgerRecord, SyncError> {
        self.backend.session().require_authenticated().await?;
        let path = format!("api/{}/ratings/{id}/", kind.plural());
        let row: WireRecord = self
            .backend
            .post_json(&path, &change.body())
            .await
            .map_err(SyncError::normalized)?;
        Ok(row.into_record(kind, id))
    }
}

/// Row as the backend serializes it. `{"rating": 0}` stands for "no record".
#[derive(Debug, Default, Deserialize)]
struct WireRecord {
    #[serde(default)]
    rating: Option<i64>,
    #[serde(default)]
    is_collected: Option<bool>,
    #[serde(default)]
    character_id: Option<EntityId>,
    #[serde(default)]
    episode_id: Option<EntityId>,
}

impl WireRecord {
    fn entity_id(&self, kind: EntityKind) -> Option<EntityId> {
        match kind {
            EntityKind::Character => self.character_id,
            EntityKind::Episode => self.episode_id,
        }
    }

    fn into_record(self, kind: EntityKind, id: EntityId) -> LedgerRecord {
        let rating = match self.rating {
            None | Some(0) => None,
            Some(raw) => match Rating::try_from(raw) {
                Ok(rating) => Some(rating),
                Err(err) => {
                    debug!(%kind, id, error = %err, "ledger: ignoring out-of-range rating");
                    None
                }
            },
        };
        LedgerRecord {
            entity_id: id,
            entity_kind: kind,
            rating,
            is_collected: self.is_collected.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_paths() {
        assert_eq!(EntityKind::Character.plural(), "characters");
        assert_eq!(EntityKind::Episode.singular(), "episode");
        assert_eq!(EntityKind::Episode.id_field(), "episode_id");
        assert_eq!("Characters".parse::<EntityKind>().unwrap(), EntityKind::Character);
        assert_eq!("episode".parse::<EntityKind>().unwrap(), EntityKind::Episode);
        assert!("location".parse::<EntityKind>().is_err());
    }

    #[test]
    fn rating_bounds() {
        assert!(Rating::new(0).is_err());
        assert!(Rating::new(6).is_err());
        assert_eq!(Rating::new(5).unwrap().get(), 5);
        assert!(serde_json::from_str::<Rating>("3").is_ok());
        assert!(serde_json::from_str::<Rating>("9").is_err());
        assert_eq!(serde_json::to_string(&Rating::new(2).unwrap()).unwrap(), "2");
    }

    #[test]
    fn zero_rating_means_no_record() {
        let row: WireRecord = serde_json::from_str(r#"{"rating":0}"#).unwrap();
        let record = row.into_record(EntityKind::Character, 42);
        assert_eq!(record, LedgerRecord::empty(EntityKind::Character, 42));
        assert!(record.is_blank());
    }

    #[test]
    fn full_row_decodes() {
        let row: WireRecord = serde_json::from_str(
            r#"{"id":9,"episode_id":12,"rating":4,"owner":3,"is_collected":true}"#,
        )
        .unwrap();
        assert_eq!(row.entity_id(EntityKind::Episode), Some(12));
        assert_eq!(row.entity_id(EntityKind::Character), None);
        let record = row.into_record(EntityKind::Episode, 12);
        assert_eq!(record.rating, Some(Rating::new(4).unwrap()));
        assert!(record.is_collected);
    }

    #[test]
    fn null_rating_is_unrated() {
        let row: WireRecord =
            serde_json::from_str(r#"{"character_id":1,"rating":null,"is_collected":true}"#).unwrap();
        let record = row.into_record(EntityKind::Character, 1);
        assert_eq!(record.rating, None);
        assert!(record.is_collected);
    }

    #[test]
    fn apply_returns_prior_value() {
        let mut record = LedgerRecord::empty(EntityKind::Episode, 3);
        let prior = record.apply(LedgerChange::Rating(Rating::new(4).unwrap()));
        assert_eq!(prior, FieldValue::Rating(None));
        let prior = record.apply(LedgerChange::Collected(true));
        assert_eq!(prior, FieldValue::Collected(false));

        record.set(FieldValue::Rating(None));
        assert_eq!(record.rating, None);
        assert!(record.is_collected);
    }

    #[test]
    fn change_bodies() {
        assert_eq!(
            LedgerChange::Rating(Rating::new(3).unwrap()).body(),
            json!({ "rating": 3 })
        );
        assert_eq!(
            LedgerChange::Collected(false).body(),
            json!({ "is_collected": false })
        );
    }
}

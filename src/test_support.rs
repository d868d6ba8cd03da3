//! Fixtures shared by unit tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::auth::AuthClient;
use crate::backend::ClientConfig;
use crate::catalog::{CatalogEntity, Character, Episode};
use crate::ledger::EntityId;
use crate::session::SessionManager;
use crate::storage::{CredentialStore, MemoryCredentialStore};
use crate::token;

/// Points at a closed port; any request fails fast.
pub(crate) fn offline_auth() -> AuthClient {
    AuthClient::new(ClientConfig {
        base_url: "http://127.0.0.1:9/".parse().unwrap(),
        user_agent: "rickdex-test".into(),
        timeout: Duration::from_millis(200),
        http_client: None,
    })
    .unwrap()
}

pub(crate) fn session_over(store: Arc<dyn CredentialStore>) -> SessionManager {
    SessionManager::new(offline_auth(), store, Duration::from_secs(30))
}

pub(crate) fn live_token(username: &str) -> String {
    token::mint_unsigned(Utc::now().timestamp() + 3600, username)
}

pub(crate) async fn signed_in_session() -> SessionManager {
    let store = Arc::new(MemoryCredentialStore::with_credentials(
        &live_token("rick"),
        "refresh",
    ));
    let session = session_over(store);
    session.bootstrap().await;
    session
}

pub(crate) async fn anonymous_session() -> SessionManager {
    let session = session_over(Arc::new(MemoryCredentialStore::new()));
    session.bootstrap().await;
    session
}

pub(crate) fn character(id: EntityId, episodes: &[&str]) -> CatalogEntity {
    CatalogEntity::Character(Character {
        id,
        name: format!("Character {id}"),
        status: "Alive".into(),
        species: "Human".into(),
        episode: episodes.iter().map(|e| e.to_string()).collect(),
        ..Character::default()
    })
}

pub(crate) fn episode(id: EntityId) -> CatalogEntity {
    CatalogEntity::Episode(Episode {
        id,
        name: format!("Episode {id}"),
        episode: format!("S01E{id:02}"),
        ..Episode::default()
    })
}

//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rickdex::auth::AuthClient;
use rickdex::backend::{BackendClient, ClientConfig};
use rickdex::catalog::CatalogClient;
use rickdex::session::SessionManager;
use rickdex::storage::{CredentialStore, MemoryCredentialStore};
use wiremock::MockServer;

/// Unsigned credential carrying `exp` and identity claims.
pub fn mint(exp: i64, username: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "exp": exp, "user_id": 1, "username": username }).to_string(),
    );
    format!("{header}.{payload}.signature")
}

pub fn live_token(username: &str) -> String {
    mint(Utc::now().timestamp() + 3600, username)
}

pub fn expired_token(username: &str) -> String {
    mint(Utc::now().timestamp() - 3600, username)
}

pub fn client_config(server: &MockServer, path: &str) -> ClientConfig {
    ClientConfig {
        base_url: format!("{}{path}", server.uri()).parse().unwrap(),
        user_agent: "rickdex-tests".into(),
        timeout: Duration::from_secs(5),
        http_client: None,
    }
}

pub fn session(server: &MockServer, store: Arc<dyn CredentialStore>) -> SessionManager {
    let auth = AuthClient::new(client_config(server, "/")).unwrap();
    SessionManager::new(auth, store, Duration::from_secs(30))
}

pub fn stored(access: &str, refresh: &str) -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::with_credentials(access, refresh))
}

pub fn backend(server: &MockServer, session: &SessionManager) -> Arc<BackendClient> {
    Arc::new(BackendClient::new(client_config(server, "/"), session.clone()).unwrap())
}

pub fn catalog(server: &MockServer) -> Arc<CatalogClient> {
    Arc::new(CatalogClient::new(client_config(server, "/api/")).unwrap())
}

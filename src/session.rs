//! Session lifecycle: who is logged in, and whether their access credential
//! can still be used.
//!
//! The [`SessionManager`] is the only writer of the session and of the
//! credential store. Everything else receives a clone of the manager and asks
//! it for a usable access credential or for the current status.
//!
//! Refreshes are coalesced: while one refresh request is in flight every
//! other caller awaits the same outcome, so a refresh credential is never
//! presented twice.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::auth::{AuthClient, UserRef};
use crate::error::SyncError;
use crate::storage::{CredentialKey, CredentialStore};
use crate::token;

const LOGIN_FAILED: &str = "Login failed.";
const REGISTER_FAILED: &str = "Registration failed. Please try again.";
const REFRESH_FAILED: &str = "Refresh token failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    Authenticated,
    Refreshing,
    /// Refresh failed and credentials were dropped. Observers see this as
    /// `Unauthenticated`.
    Invalid,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Unauthenticated
    }
}

impl SessionStatus {
    pub fn normalized(self) -> Self {
        match self {
            SessionStatus::Invalid => SessionStatus::Unauthenticated,
            other => other,
        }
    }
}

/// Snapshot of the authentication state.
///
/// `status == Authenticated` implies `access_token` is present and, at the
/// last check, `expires_at` was in the future.
#[derive(Clone, Default)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub user: Option<UserRef>,
    pub status: SessionStatus,
    /// Last user-facing failure, cleared on the next success.
    pub error: Option<String>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .field("status", &self.status)
            .field("error", &self.error)
            .finish()
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<(), SyncError>>>;

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    auth: AuthClient,
    store: Arc<dyn CredentialStore>,
    session: RwLock<Session>,
    refresh: Mutex<Option<RefreshFuture>>,
    bootstrap: OnceCell<()>,
    status_tx: watch::Sender<SessionStatus>,
    /// Bumped by login and logout; a refresh that started under an older
    /// epoch must not write its result.
    epoch: AtomicU64,
    refresh_skew: Duration,
}

impl SessionManager {
    pub fn new(auth: AuthClient, store: Arc<dyn CredentialStore>, refresh_skew: Duration) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Unauthenticated);
        Self {
            inner: Arc::new(Inner {
                auth,
                store,
                session: RwLock::new(Session::default()),
                refresh: Mutex::new(None),
                bootstrap: OnceCell::new(),
                status_tx,
                epoch: AtomicU64::new(0),
                refresh_skew,
            }),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.inner.session.read().clone()
    }

    /// Status as observed from outside the manager.
    pub fn status(&self) -> SessionStatus {
        self.inner.session.read().status.normalized()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    pub fn user(&self) -> Option<UserRef> {
        self.inner.session.read().user.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.session.read().error.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.inner.bootstrap.initialized()
    }

    /// Restores the session from the credential store. Runs once per manager;
    /// concurrent and later callers await the first run.
    ///
    /// No stored credential, or one that cannot be decoded, leaves the session
    /// `Unauthenticated` without touching the network. An expired credential
    /// triggers a refresh; a live one is trusted as-is.
    pub async fn bootstrap(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .bootstrap
            .get_or_init(|| inner.run_bootstrap())
            .await;
    }

    /// Mints a new access credential from the stored refresh credential.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Unauthorized`] when the refresh credential is
    /// missing or rejected, or the request fails; the session is dropped in
    /// all of those cases.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.inner.refresh().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserRef, SyncError> {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        match self.try_login(username, password).await {
            Ok(user) => {
                info!(username = %user.username, "session: logged in");
                Ok(user)
            }
            Err(err) => {
                warn!(error = %err, "session: login failed");
                if self.inner.epoch.load(Ordering::SeqCst) == epoch {
                    self.inner.reset(SessionStatus::Unauthenticated, Some(LOGIN_FAILED));
                }
                Err(err.normalized())
            }
        }
    }

    async fn try_login(&self, username: &str, password: &str) -> Result<UserRef, SyncError> {
        let pair = self.inner.auth.issue_tokens(username, password).await?;
        let claims = token::decode_claims(&pair.access)?;

        self.inner
            .store
            .set(CredentialKey::Access, &pair.access)
            .and_then(|_| self.inner.store.set(CredentialKey::Refresh, &pair.refresh))
            .map_err(|err| SyncError::Transient(format!("session: persist credentials: {err:#}")))?;

        let user = pair
            .user
            .clone()
            .filter(|u| !u.username.is_empty())
            .or_else(|| claims.user())
            .unwrap_or_else(|| UserRef {
                id: None,
                username: username.to_string(),
            });

        {
            let mut session = self.inner.session.write();
            *session = Session {
                access_token: Some(pair.access),
                refresh_token: Some(pair.refresh),
                expires_at: Some(claims.exp),
                user: Some(user.clone()),
                status: SessionStatus::Authenticated,
                error: None,
            };
        }
        self.inner.publish(SessionStatus::Authenticated);
        Ok(user)
    }

    /// Drops any existing session, creates the account, then logs in with the
    /// same credentials.
    pub async fn register(&self, username: &str, password: &str) -> Result<UserRef, SyncError> {
        self.logout();
        if let Err(err) = self.inner.auth.register(username, password).await {
            warn!(error = %err, "session: registration failed");
            self.inner
                .reset(SessionStatus::Unauthenticated, Some(REGISTER_FAILED));
            return Err(err.normalized());
        }
        self.login(username, password).await
    }

    /// Clears stored credentials and resets to `Unauthenticated`. Never fails
    /// and never touches the network.
    pub fn logout(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.clear_store();
        self.inner.reset(SessionStatus::Unauthenticated, None);
        info!("session: logged out");
    }

    /// Waits for bootstrap and any in-flight refresh, then reports whether
    /// writes are allowed.
    pub async fn require_authenticated(&self) -> Result<(), SyncError> {
        self.bootstrap().await;
        if self.inner.session.read().status == SessionStatus::Refreshing {
            self.refresh().await?;
        }
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(SyncError::Unauthorized)
        }
    }

    /// A usable access credential, refreshing first if it is within
    /// `refresh_skew` of expiry.
    pub async fn access_token(&self) -> Result<String, SyncError> {
        self.bootstrap().await;

        let (status, token, expires_at) = {
            let session = self.inner.session.read();
            (session.status, session.access_token.clone(), session.expires_at)
        };

        match status {
            SessionStatus::Authenticated => {
                let horizon = Utc::now().timestamp() + self.inner.refresh_skew.as_secs() as i64;
                match (token, expires_at) {
                    (Some(token), Some(exp)) if exp > horizon => return Ok(token),
                    _ => {
                        debug!("session: access token near expiry, refreshing");
                        self.refresh().await?;
                    }
                }
            }
            SessionStatus::Refreshing => self.refresh().await?,
            SessionStatus::Unauthenticated | SessionStatus::Invalid => {
                return Err(SyncError::Unauthorized)
            }
        }

        let session = self.inner.session.read();
        match (&session.status, &session.access_token) {
            (SessionStatus::Authenticated, Some(token)) => Ok(token.clone()),
            _ => Err(SyncError::Unauthorized),
        }
    }
}

impl Inner {
    async fn run_bootstrap(self: Arc<Self>) {
        let stored = match self.store.get(CredentialKey::Access) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "session: read stored access token");
                None
            }
        };

        let Some(access) = stored else {
            debug!("session: no stored credential");
            self.reset(SessionStatus::Unauthenticated, None);
            return;
        };

        let claims = match token::decode_claims(&access) {
            Ok(claims) => claims,
            Err(err) => {
                debug!(error = %err, "session: stored credential unreadable, treating as absent");
                self.reset(SessionStatus::Unauthenticated, None);
                return;
            }
        };

        let refresh_token = self.store.get(CredentialKey::Refresh).ok().flatten();
        {
            let mut session = self.session.write();
            session.access_token = Some(access);
            session.refresh_token = refresh_token;
            session.expires_at = Some(claims.exp);
            session.user = claims.user();
            session.error = None;
        }

        if claims.is_expired_at(Utc::now().timestamp()) {
            debug!("session: stored access token expired");
            self.set_status(SessionStatus::Refreshing);
            if let Err(err) = self.refresh().await {
                debug!(error = %err, "session: bootstrap refresh failed");
            }
        } else {
            self.set_status(SessionStatus::Authenticated);
        }
    }

    fn refresh(self: &Arc<Self>) -> RefreshFuture {
        let mut slot = self.refresh.lock();
        if let Some(pending) = slot.as_ref() {
            debug!("session: joining in-flight refresh");
            return pending.clone();
        }

        let inner = Arc::clone(self);
        let fut = async move {
            let outcome = inner.run_refresh().await;
            inner.refresh.lock().take();
            outcome
        }
        .boxed()
        .shared();
        *slot = Some(fut.clone());
        fut
    }

    async fn run_refresh(&self) -> Result<(), SyncError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.set_status(SessionStatus::Refreshing);

        let refresh_token = match self.store.get(CredentialKey::Refresh) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "session: read stored refresh token");
                None
            }
        };

        let outcome = match refresh_token {
            Some(refresh_token) => self.exchange(&refresh_token, epoch).await,
            None => Err(SyncError::Unauthorized),
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("session: discarding refresh outcome after login/logout");
            return if self.session.read().status == SessionStatus::Authenticated {
                Ok(())
            } else {
                Err(SyncError::Unauthorized)
            };
        }

        match outcome {
            Ok(()) => {
                info!("session: access token refreshed");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "session: refresh failed, dropping credentials");
                self.clear_store();
                self.reset(SessionStatus::Invalid, Some(REFRESH_FAILED));
                Err(SyncError::Unauthorized)
            }
        }
    }

    async fn exchange(&self, refresh_token: &str, epoch: u64) -> Result<(), SyncError> {
        let access = self.auth.refresh_access(refresh_token).await?;
        let claims = token::decode_claims(&access)?;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(());
        }

        self.store
            .set(CredentialKey::Access, &access)
            .map_err(|err| SyncError::Transient(format!("session: persist access token: {err:#}")))?;

        {
            let mut session = self.session.write();
            session.access_token = Some(access);
            session.refresh_token = Some(refresh_token.to_string());
            session.expires_at = Some(claims.exp);
            if session.user.is_none() {
                session.user = claims.user();
            }
            session.error = None;
            session.status = SessionStatus::Authenticated;
        }
        self.publish(SessionStatus::Authenticated);
        Ok(())
    }

    fn clear_store(&self) {
        if let Err(err) = self.store.clear() {
            warn!(error = %format!("{err:#}"), "session: clear stored credentials");
        }
    }

    fn reset(&self, status: SessionStatus, error: Option<&str>) {
        {
            let mut session = self.session.write();
            *session = Session {
                status,
                error: error.map(str::to_string),
                ..Session::default()
            };
        }
        self.publish(status);
    }

    fn set_status(&self, status: SessionStatus) {
        self.session.write().status = status;
        self.publish(status);
    }

    fn publish(&self, status: SessionStatus) {
        self.status_tx.send_replace(status.normalized());
    }
}

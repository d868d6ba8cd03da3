use parking_lot::Mutex;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::Page;
use crate::error::SyncError;

/// Result of a single `load_next` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { added: usize },
    /// Already loading, or nothing left to load.
    Skipped,
    /// State is unchanged; `retryable` mirrors [`SyncError::is_retryable`].
    Failed { error: SyncError, retryable: bool },
    /// The owner was torn down or re-initialized while the request was in
    /// flight; the response was dropped.
    Discarded,
}

impl LoadOutcome {
    pub(crate) fn failed(error: SyncError) -> Self {
        let retryable = error.is_retryable();
        LoadOutcome::Failed { error, retryable }
    }
}

struct CursorState<T> {
    items: Vec<T>,
    next_link: Option<String>,
    is_loading: bool,
    last_error: Option<SyncError>,
    /// Bumped by `initialize`; a response for an older generation is dropped.
    generation: u64,
}

/// Incremental fetch over a `{ results, info: { next } }` listing.
///
/// Items are appended in source order. Calls while a page is loading, or
/// once `next` is exhausted, are no-ops. A failed page leaves items and the
/// next link untouched so the same page can be retried.
pub struct PageCursor<T> {
    http: Client,
    user_agent: String,
    state: Mutex<CursorState<T>>,
    cancel: CancellationToken,
}

impl<T> PageCursor<T>
where
    T: DeserializeOwned + Clone + Send,
{
    pub fn new(http: Client, user_agent: impl Into<String>) -> Self {
        Self {
            http,
            user_agent: user_agent.into(),
            state: Mutex::new(CursorState {
                items: Vec::new(),
                next_link: None,
                is_loading: false,
                last_error: None,
                generation: 0,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn initialize(&self, first_url: impl Into<String>) {
        let mut state = self.state.lock();
        state.items.clear();
        state.next_link = Some(first_url.into());
        state.is_loading = false;
        state.last_error = None;
        state.generation += 1;
    }

    pub async fn load_next(&self) -> LoadOutcome {
        let (url, generation) = {
            let mut state = self.state.lock();
            if self.cancel.is_cancelled() {
                return LoadOutcome::Discarded;
            }
            if state.is_loading {
                return LoadOutcome::Skipped;
            }
            let Some(url) = state.next_link.clone() else {
                return LoadOutcome::Skipped;
            };
            state.is_loading = true;
            (url, state.generation)
        };

        let fetched = self.fetch(&url).await;

        if self.cancel.is_cancelled() {
            debug!(%url, "cursor: closed while loading, dropping page");
            return LoadOutcome::Discarded;
        }
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(%url, "cursor: re-initialized while loading, dropping page");
            return LoadOutcome::Discarded;
        }
        state.is_loading = false;

        match fetched {
            Ok(page) => {
                let added = page.results.len();
                state.items.extend(page.results);
                state.next_link = page.info.next.filter(|next| !next.is_empty());
                state.last_error = None;
                LoadOutcome::Loaded { added }
            }
            Err(err) => {
                warn!(%url, error = %err, "cursor: page load failed");
                state.last_error = Some(err.clone());
                LoadOutcome::failed(err)
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Page<T>, SyncError> {
        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Transient(format!("cursor: {url} returned {status}")));
        }
        Ok(resp.json().await?)
    }

    pub fn items(&self) -> Vec<T> {
        self.state.lock().items.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_more(&self) -> bool {
        self.state.lock().next_link.is_some()
    }

    pub fn next_link(&self) -> Option<String> {
        self.state.lock().next_link.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().is_loading
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.state.lock().last_error.clone()
    }

    /// Tears the cursor down. Responses still in flight are dropped.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Episode;

    fn cursor() -> PageCursor<Episode> {
        PageCursor::new(Client::new(), "rickdex-test")
    }

    #[test]
    fn fresh_cursor_has_nothing_to_load() {
        let cursor = cursor();
        assert!(!cursor.has_more());
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn load_without_next_link_is_a_no_op() {
        let cursor = cursor();
        assert_eq!(cursor.load_next().await, LoadOutcome::Skipped);
        assert!(!cursor.is_loading());
    }

    #[tokio::test]
    async fn closed_cursor_discards() {
        let cursor = cursor();
        cursor.initialize("http://127.0.0.1:9/episode/?page=1");
        assert!(cursor.has_more());
        cursor.close();
        assert_eq!(cursor.load_next().await, LoadOutcome::Discarded);
        assert!(cursor.is_closed());
        assert!(!cursor.is_loading());
    }

    #[test]
    fn initialize_resets_state() {
        let cursor = cursor();
        cursor.initialize("http://127.0.0.1:9/a");
        {
            let mut state = cursor.state.lock();
            state.items.push(Episode::default());
            state.last_error = Some(SyncError::Transient("x".into()));
        }
        cursor.initialize("http://127.0.0.1:9/b");
        assert!(cursor.is_empty());
        assert!(cursor.last_error().is_none());
        assert_eq!(cursor.next_link().as_deref(), Some("http://127.0.0.1:9/b"));
    }
}

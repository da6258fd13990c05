//! Pagination controller
//!
//! One controller owns one paginated view: a configured query, the current
//! page, and a watchable [`PaginationState`]. Resolutions run through the
//! shared cache and fetcher; every await is followed by a staleness check
//! so a reconfigured or dropped controller never commits old results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::{AddOutcome, CacheStore, RemoveOutcome};
use crate::entity::{Entity, ItemRef};
use crate::error::FetchError;
use crate::fetcher::PageFetcher;
use crate::query::{self, QueryParams, DEFAULT_PAGE_SIZE};
use crate::status::Status;
use crate::transport::{Session, Transport};

/// Snapshot of a paginated view.
#[derive(Debug, Clone, Default)]
pub struct PaginationState {
    pub items: Vec<Entity>,
    pub item_ids: Vec<String>,
    /// 1-based current page.
    pub page: u32,
    pub page_size: u32,
    /// Total items the backend reports for the query.
    pub count: u64,
    pub status: Status,
}

impl PaginationState {
    /// Last valid page for the current count; `0` when empty.
    pub fn last_page(&self) -> u32 {
        query::last_page(self.count, self.page_size)
    }
}

/// Configuration of a paginated view.
#[derive(Debug, Clone)]
pub struct PaginationConfig {
    /// Base url of the collection; `None` keeps the view idle.
    pub url: Option<String>,
    pub query: QueryParams,
    pub page: u32,
    pub page_size: u32,
    /// When off, every resolution bypasses the cache and the view keeps a
    /// private item list.
    pub use_cache: bool,
    pub session: Option<Session>,
    /// One-shot: the next resolution drops this query's cache first.
    pub reset_cache: bool,
}

impl PaginationConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            query: QueryParams::new(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            use_cache: true,
            session: None,
            reset_cache: false,
        }
    }

    pub fn idle() -> Self {
        Self {
            url: None,
            query: QueryParams::new(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            use_cache: true,
            session: None,
            reset_cache: false,
        }
    }

    pub fn with_query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_reset_cache(mut self) -> Self {
        self.reset_cache = true;
        self
    }

    fn normalized_url(&self) -> Option<String> {
        self.url
            .as_ref()
            .map(|url| query::normalize(url, &self.query, self.page_size))
    }
}

struct ControllerInner {
    config: Mutex<PaginationConfig>,
    fetcher: PageFetcher,
    cache: Arc<CacheStore>,
    state_tx: watch::Sender<PaginationState>,
    /// Bumped whenever the view is reconfigured; a resolution only commits
    /// if it still holds the current generation.
    generation: AtomicU64,
    cancel: CancellationToken,
}

impl ControllerInner {
    fn config(&self) -> MutexGuard<'_, PaginationConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one paginated view. Cheap to clone; dropping the last handle
/// cancels any in-flight resolution.
#[derive(Clone)]
pub struct PaginationController {
    inner: Arc<ControllerInner>,
}

impl PaginationController {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<CacheStore>,
        config: PaginationConfig,
    ) -> Self {
        let state = PaginationState {
            page: config.page,
            page_size: config.page_size,
            ..PaginationState::default()
        };
        let (state_tx, _) = watch::channel(state);
        Self {
            inner: Arc::new(ControllerInner {
                config: Mutex::new(config),
                fetcher: PageFetcher::new(transport, cache.clone()),
                cache,
                state_tx,
                generation: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> PaginationState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch the view; fires on every committed state change.
    pub fn subscribe(&self) -> watch::Receiver<PaginationState> {
        self.inner.state_tx.subscribe()
    }

    pub fn config(&self) -> PaginationConfig {
        self.inner.config().clone()
    }

    /// Cancel any in-flight resolution and stop committing results.
    pub fn detach(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel.cancel();
    }

    /// Resolve the configured page, committing `Pending` first and the
    /// final `Success`/`Error` state if the view was not reconfigured in
    /// the meantime.
    pub async fn resolve(&self) -> Result<(), FetchError> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.inner.cancel.child_token();
        match self.resolve_cycle(generation, &token).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.is_current(generation, &token) {
                    tracing::warn!(error = %err, "pagination resolve failed");
                    self.commit(generation, &token, |state, config| {
                        state.items.clear();
                        state.item_ids.clear();
                        state.page = config.page;
                        state.page_size = config.page_size;
                        state.status = Status::Error;
                    });
                }
                Err(err)
            }
        }
    }

    async fn resolve_cycle(
        &self,
        generation: u64,
        token: &CancellationToken,
    ) -> Result<(), FetchError> {
        loop {
            let (url, page, page_size, use_cache, session, reset) = {
                let mut config = self.inner.config();
                let reset = config.reset_cache;
                config.reset_cache = false;
                (
                    config.normalized_url(),
                    config.page,
                    config.page_size,
                    config.use_cache,
                    config.session.clone(),
                    reset,
                )
            };
            let Some(url) = url else {
                self.commit(generation, token, |state, _| {
                    *state = PaginationState::default();
                });
                return Ok(());
            };

            self.commit(generation, token, |state, config| {
                state.page = config.page;
                state.page_size = config.page_size;
                state.status = Status::Pending;
            });

            if reset {
                self.inner.cache.invalidate_query(&url);
            }

            let listing = self
                .inner
                .fetcher
                .get_pages(&url, page, page_size, use_cache, session.as_ref())
                .await?;
            if !self.is_current(generation, token) {
                tracing::debug!(url, "discarding stale id listing");
                return Ok(());
            }

            // Page ran past the end (concurrent deletions, stale page
            // number): clamp and resolve again.
            let last = query::last_page(listing.count, page_size);
            if last > 0 && page > last {
                self.inner.config().page = last;
                continue;
            }

            let current = if use_cache {
                Vec::new()
            } else {
                self.inner.state_tx.borrow().items.clone()
            };
            let items = self
                .inner
                .fetcher
                .get_current_page_items(&url, &listing.ids, use_cache, &current, session.as_ref())
                .await?;
            if !self.is_current(generation, token) {
                tracing::debug!(url, "discarding stale page items");
                return Ok(());
            }

            self.commit(generation, token, |state, config| {
                state.items = items;
                state.item_ids = listing.ids;
                state.page = config.page;
                state.page_size = config.page_size;
                state.count = listing.count;
                state.status = Status::Success;
            });
            return Ok(());
        }
    }

    /// Navigate to a page (clamped to 1) and resolve.
    pub async fn set_page(&self, page: u32) -> Result<(), FetchError> {
        self.inner.config().page = page.max(1);
        self.resolve().await
    }

    /// Replace the query and resolve from page 1.
    pub async fn set_query(&self, query: QueryParams) -> Result<(), FetchError> {
        {
            let mut config = self.inner.config();
            config.query = query;
            config.page = 1;
        }
        self.resolve().await
    }

    pub fn set_session(&self, session: Option<Session>) {
        self.inner.config().session = session;
    }

    /// Drop this query's cache and resolve fresh.
    pub async fn refresh(&self) -> Result<(), FetchError> {
        if let Some(url) = self.inner.config().normalized_url() {
            self.inner.cache.invalidate_query(&url);
        }
        self.resolve().await
    }

    /// Record a newly created entity.
    ///
    /// Resolves from cache when the page math stays exact, otherwise falls
    /// back to a background refetch. Never returns an error; a failed
    /// fallback surfaces through the watched state.
    pub fn add_item(&self, entity: Entity) {
        let (url, use_cache, page, page_size) = {
            let config = self.inner.config();
            (
                config.normalized_url(),
                config.use_cache,
                config.page,
                config.page_size,
            )
        };
        let Some(url) = url else { return };

        if !use_cache {
            if page == 1 && query::is_from_last(&url) {
                // Prepend locally and let the page overflow trim.
                self.send_local(|state| {
                    state.item_ids.insert(0, entity.id().to_string());
                    state.items.insert(0, entity.clone());
                    state.item_ids.truncate(page_size as usize);
                    state.items.truncate(page_size as usize);
                    state.count += 1;
                    state.status = Status::Success;
                });
            } else {
                self.kick(false);
            }
            return;
        }

        let from_last = query::is_from_last(&url);
        match self.inner.cache.add_to_query(&url, &entity, from_last) {
            AddOutcome::NoEntry => self.kick(false),
            AddOutcome::AlreadyPresent | AddOutcome::Inserted => self.rerender_from_cache(&url),
        }
    }

    /// Record a deleted entity by id or value.
    pub fn remove_item(&self, item: impl Into<ItemRef>) {
        let item = item.into();
        let id = item.id().to_string();
        let (url, use_cache, page) = {
            let config = self.inner.config();
            (config.normalized_url(), config.use_cache, config.page)
        };
        let Some(url) = url else { return };

        if !use_cache {
            let state = self.inner.state_tx.borrow().clone();
            let held = state.item_ids.iter().any(|i| i == &id);
            if !held || state.last_page() != page || state.item_ids.len() == 1 {
                // The page refills from a neighbor we do not hold.
                self.kick(true);
                return;
            }
            self.send_local(|state| {
                state.item_ids.retain(|i| i != &id);
                state.items.retain(|e| e.id() != id);
                state.count = state.count.saturating_sub(1);
                state.status = Status::Success;
            });
            return;
        }

        match self.inner.cache.remove_from_query(&url, &id) {
            RemoveOutcome::NotFound => {}
            RemoveOutcome::Removed { last_page, .. } => {
                if page > last_page.max(1) {
                    // Current page vanished; step back and refetch.
                    self.inner.config().page = last_page.max(1);
                    self.kick(false);
                } else {
                    self.rerender_from_cache(&url);
                }
            }
        }
    }

    /// Record an updated entity snapshot.
    pub fn update_item(&self, entity: Entity) {
        let (url, use_cache, page) = {
            let config = self.inner.config();
            (config.normalized_url(), config.use_cache, config.page)
        };
        let Some(url) = url else { return };

        if !use_cache {
            self.send_local(|state| {
                if let Some(slot) = state.items.iter_mut().find(|e| e.id() == entity.id()) {
                    *slot = entity.clone();
                }
            });
            return;
        }

        self.inner.cache.replace_item(&entity);
        if self.inner.cache.page_contains(&url, page, entity.id()) {
            self.rerender_from_cache(&url);
        }
    }

    /// Re-commit the current page straight from cache; falls back to a
    /// refetch when a snapshot is missing.
    fn rerender_from_cache(&self, url: &str) {
        let page = self.inner.config().page;
        match self.inner.cache.page_items(url, page) {
            Some((count, ids, Some(items))) => self.send_local(|state| {
                state.items = items.clone();
                state.item_ids = ids.clone();
                state.count = count;
                state.status = Status::Success;
            }),
            _ => self.kick(false),
        }
    }

    /// Background resolve for mutation fallbacks.
    fn kick(&self, invalidate: bool) {
        if invalidate {
            if let Some(url) = self.inner.config().normalized_url() {
                self.inner.cache.invalidate_query(&url);
            }
        }
        let this = self.clone();
        tokio::spawn(async move {
            // resolve() reports failures through the watched state
            let _ = this.resolve().await;
        });
    }

    fn send_local(&self, apply: impl FnOnce(&mut PaginationState)) {
        self.inner.state_tx.send_modify(apply);
    }

    fn is_current(&self, generation: u64, token: &CancellationToken) -> bool {
        !token.is_cancelled() && self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn commit(
        &self,
        generation: u64,
        token: &CancellationToken,
        apply: impl FnOnce(&mut PaginationState, &PaginationConfig),
    ) {
        if !self.is_current(generation, token) {
            return;
        }
        let config = self.inner.config().clone();
        self.inner
            .state_tx
            .send_modify(|state| apply(state, &config));
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_entity, FakeBackend};

    fn setup(count: usize) -> (Arc<FakeBackend>, Arc<CacheStore>, PaginationController) {
        let backend = Arc::new(FakeBackend::with_entities("device", count));
        let cache = Arc::new(CacheStore::new());
        let controller = PaginationController::new(
            backend.clone() as Arc<dyn Transport>,
            cache.clone(),
            PaginationConfig::new("/device"),
        );
        (backend, cache, controller)
    }

    // let any kicked background resolve run
    async fn settle(_controller: &PaginationController) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_resolve_pages_and_counts() {
        let (_, _, controller) = setup(18);
        controller.resolve().await.unwrap();
        let state = controller.state();
        assert_eq!(state.status, Status::Success);
        assert_eq!(state.count, 18);
        assert_eq!(state.items.len(), 10);
        assert_eq!(state.item_ids[0], "device-0");

        controller.set_page(2).await.unwrap();
        let state = controller.state();
        assert_eq!(state.page, 2);
        assert_eq!(state.items.len(), 8);
    }

    #[tokio::test]
    async fn test_page_past_end_clamps_to_last() {
        let (_, _, controller) = setup(18);
        controller.set_page(5).await.unwrap();
        let state = controller.state();
        assert_eq!(state.page, 2);
        assert_eq!(state.items.len(), 8);
        assert_eq!(state.status, Status::Success);
    }

    #[tokio::test]
    async fn test_idle_without_url() {
        let backend = Arc::new(FakeBackend::new());
        let controller = PaginationController::new(
            backend as Arc<dyn Transport>,
            Arc::new(CacheStore::new()),
            PaginationConfig::idle(),
        );
        controller.resolve().await.unwrap();
        assert_eq!(controller.state().status, Status::Idle);
    }

    #[tokio::test]
    async fn test_listing_failure_commits_error_state() {
        let (backend, _, controller) = setup(5);
        backend.set_fail_listing(true);
        assert!(controller.resolve().await.is_err());
        let state = controller.state();
        assert_eq!(state.status, Status::Error);
        assert!(state.items.is_empty());
    }

    #[tokio::test]
    async fn test_failed_resolve_keeps_previous_cache() {
        let (backend, cache, controller) = setup(5);
        controller.resolve().await.unwrap();
        assert!(cache.item("device-0").is_some());

        backend.set_fail_listing(true);
        let second = PaginationController::new(
            backend.clone() as Arc<dyn Transport>,
            cache.clone(),
            PaginationConfig::new("/device").with_reset_cache(),
        );
        // reset drops the entry, then the refetch fails
        assert!(second.resolve().await.is_err());
        // but the first controller's earlier results were already consumed;
        // a fresh resolve against a healthy backend recovers
        backend.set_fail_listing(false);
        controller.resolve().await.unwrap();
        assert_eq!(controller.state().status, Status::Success);
    }

    #[tokio::test]
    async fn test_controllers_share_cache() {
        let (backend, cache, controller) = setup(18);
        controller.resolve().await.unwrap();
        let calls_before = backend.calls().len();

        let second = PaginationController::new(
            backend.clone() as Arc<dyn Transport>,
            cache,
            PaginationConfig::new("/device"),
        );
        second.resolve().await.unwrap();
        assert_eq!(second.state().items.len(), 10);
        // identical query, page fully cached: zero new requests
        assert_eq!(backend.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_add_item_rerenders_from_cache() {
        let (backend, _, controller) = setup(18);
        controller.resolve().await.unwrap();
        let calls_before = backend.calls().len();

        controller.add_item(test_entity("device", "fresh"));
        let state = controller.state();
        assert_eq!(state.count, 19);
        assert_eq!(state.item_ids[0], "fresh");
        assert_eq!(state.items.len(), 10);
        assert_eq!(state.status, Status::Success);
        assert_eq!(backend.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_add_item_is_idempotent() {
        let (_, _, controller) = setup(18);
        controller.resolve().await.unwrap();

        controller.add_item(test_entity("device", "fresh"));
        let count_after_first = controller.state().count;
        controller.add_item(test_entity("device", "fresh"));
        settle(&controller).await;
        assert_eq!(controller.state().count, count_after_first);
    }

    #[tokio::test]
    async fn test_remove_item_shifts_page() {
        let (_, _, controller) = setup(18);
        controller.resolve().await.unwrap();

        controller.remove_item("device-0");
        // device-10's snapshot was never fetched, so the re-render falls
        // back to a background resolve
        settle(&controller).await;
        let state = controller.state();
        assert_eq!(state.count, 17);
        assert_eq!(state.items.len(), 10);
        assert_eq!(state.item_ids[0], "device-1");
        // device-10 pulled back from page 2
        assert_eq!(state.item_ids[9], "device-10");
    }

    #[tokio::test]
    async fn test_remove_navigates_back_when_page_vanishes() {
        let (backend, _, controller) = setup(11);
        controller.set_page(2).await.unwrap();
        assert_eq!(controller.state().items.len(), 1);

        backend.remove("device-10");
        controller.remove_item("device-10");
        settle(&controller).await;
        let state = controller.state();
        assert_eq!(state.page, 1);
        assert_eq!(state.count, 10);
        assert_eq!(state.items.len(), 10);
    }

    #[tokio::test]
    async fn test_update_item_rerenders_current_page() {
        let (_, _, controller) = setup(5);
        controller.resolve().await.unwrap();

        let updated = Entity::from_value(serde_json::json!({
            "meta": {"id": "device-2", "type": "device"},
            "name": "renamed",
        }))
        .unwrap();
        controller.update_item(updated);
        let state = controller.state();
        assert_eq!(state.items[2].value()["name"], "renamed");
        assert_eq!(state.status, Status::Success);
    }

    #[tokio::test]
    async fn test_no_cache_add_prepends_on_first_page() {
        let backend = Arc::new(FakeBackend::with_entities("device", 18));
        let controller = PaginationController::new(
            backend.clone() as Arc<dyn Transport>,
            Arc::new(CacheStore::new()),
            PaginationConfig::new("/device").with_cache(false),
        );
        controller.resolve().await.unwrap();

        controller.add_item(test_entity("device", "fresh"));
        let state = controller.state();
        assert_eq!(state.item_ids[0], "fresh");
        assert_eq!(state.items.len(), 10);
        assert_eq!(state.count, 19);
    }

    #[tokio::test]
    async fn test_no_cache_add_on_oldest_first_query_refetches() {
        let backend = Arc::new(FakeBackend::with_entities("device", 5));
        let controller = PaginationController::new(
            backend.clone() as Arc<dyn Transport>,
            Arc::new(CacheStore::new()),
            PaginationConfig::new("/device")
                .with_cache(false)
                .with_query(QueryParams::new().suppress("from_last")),
        );
        controller.resolve().await.unwrap();

        // oldest-first: the created item belongs at the tail, so the local
        // prepend path does not apply
        backend.push_back(test_entity("device", "fresh"));
        controller.add_item(test_entity("device", "fresh"));
        settle(&controller).await;
        let state = controller.state();
        assert_eq!(state.count, 6);
        assert_eq!(state.item_ids[5], "fresh");
    }

    #[tokio::test]
    async fn test_no_cache_remove_refetches_when_page_refills() {
        let backend = Arc::new(FakeBackend::with_entities("device", 18));
        let controller = PaginationController::new(
            backend.clone() as Arc<dyn Transport>,
            Arc::new(CacheStore::new()),
            PaginationConfig::new("/device").with_cache(false),
        );
        controller.resolve().await.unwrap();

        backend.remove("device-0");
        controller.remove_item("device-0");
        settle(&controller).await;
        let state = controller.state();
        assert_eq!(state.count, 17);
        assert_eq!(state.items.len(), 10);
        assert_eq!(state.item_ids[0], "device-1");
    }

    #[tokio::test]
    async fn test_refresh_refetches_listing() {
        let (backend, _, controller) = setup(5);
        controller.resolve().await.unwrap();
        let listings = backend.listing_calls().len();

        controller.refresh().await.unwrap();
        assert_eq!(backend.listing_calls().len(), listings + 1);
        assert_eq!(controller.state().status, Status::Success);
    }

    #[tokio::test]
    async fn test_logout_clear_forces_refetch() {
        let (backend, cache, controller) = setup(5);
        controller.resolve().await.unwrap();
        let listings = backend.listing_calls().len();

        cache.clear();
        controller.resolve().await.unwrap();
        assert_eq!(backend.listing_calls().len(), listings + 1);
    }

    #[tokio::test]
    async fn test_detach_discards_late_results() {
        let (_, _, controller) = setup(5);
        controller.resolve().await.unwrap();
        let before = controller.state();

        controller.detach();
        // a detached controller no longer commits
        let _ = controller.resolve().await;
        assert_eq!(controller.state().items.len(), before.items.len());
    }
}

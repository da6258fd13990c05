//! Test doubles and time-control utilities

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::entity::Entity;
use crate::error::RequestError;
use crate::stream::StreamLink;
use crate::transport::{Response, Session, Transport};

/// Build a minimal entity for tests.
pub fn test_entity(entity_type: &str, id: &str) -> Entity {
    match Entity::from_value(json!({"meta": {"id": id, "type": entity_type}})) {
        Ok(entity) => entity,
        Err(_) => unreachable!("test entity always carries identity"),
    }
}

struct FakeInner {
    entities: Vec<Entity>,
    calls: Vec<String>,
    fail_listing: bool,
    fail_items: bool,
}

/// In-memory [`Transport`] that answers id listings and item batches from
/// an ordered entity collection, recording every url it sees.
///
/// Urls containing `id=[...]` are treated as item-batch requests and
/// answered with the matching entities in backend order; everything else is
/// an id listing, windowed by its `offset` and `limit` parameters.
pub struct FakeBackend {
    inner: Mutex<FakeInner>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeInner {
                entities: Vec::new(),
                calls: Vec::new(),
                fail_listing: false,
                fail_items: false,
            }),
        }
    }

    /// Backend pre-seeded with `count` entities of one type, ids
    /// `{type}-0` through `{type}-{count-1}`.
    pub fn with_entities(entity_type: &str, count: usize) -> Self {
        let backend = Self::new();
        {
            let mut inner = backend.lock();
            for i in 0..count {
                inner
                    .entities
                    .push(test_entity(entity_type, &format!("{entity_type}-{i}")));
            }
        }
        backend
    }

    fn lock(&self) -> MutexGuard<'_, FakeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepend an entity, as a newest-first backend would order a creation.
    pub fn push_front(&self, entity: Entity) {
        self.lock().entities.insert(0, entity);
    }

    pub fn push_back(&self, entity: Entity) {
        self.lock().entities.push(entity);
    }

    pub fn remove(&self, id: &str) {
        self.lock().entities.retain(|e| e.id() != id);
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.lock().fail_listing = fail;
    }

    pub fn set_fail_items(&self, fail: bool) {
        self.lock().fail_items = fail;
    }

    /// Every url requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn listing_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|url| !url.contains("id=["))
            .collect()
    }

    pub fn item_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|url| url.contains("id=["))
            .collect()
    }

    fn param(url: &str, key: &str) -> Option<String> {
        let query = url.split_once('?')?.1;
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix(&format!("{key}=")))
            .map(str::to_string)
    }

    fn answer(&self, url: &str) -> Response {
        let mut inner = self.lock();
        inner.calls.push(url.to_string());

        if let Some(raw_ids) = Self::param(url, "id") {
            if inner.fail_items {
                return Response::error(503);
            }
            let wanted = raw_ids.trim_matches(['[', ']']);
            let wanted: Vec<&str> = wanted.split(',').filter(|s| !s.is_empty()).collect();
            let matched: Vec<Value> = inner
                .entities
                .iter()
                .filter(|e| wanted.contains(&e.id()))
                .map(|e| e.value().clone())
                .collect();
            return Response::ok(Value::Array(matched));
        }

        if inner.fail_listing {
            return Response::error(500);
        }
        let offset: usize = Self::param(url, "offset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let limit: usize = Self::param(url, "limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(inner.entities.len());
        let count = inner.entities.len();
        let window: Vec<&str> = inner
            .entities
            .iter()
            .skip(offset)
            .take(limit)
            .map(Entity::id)
            .collect();
        let more = offset + window.len() < count;
        Response::ok(json!({"id": window, "count": count, "more": more}))
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn get(&self, url: &str, _session: Option<&Session>) -> Result<Response, RequestError> {
        Ok(self.answer(url))
    }
}

/// Scripted [`StreamLink`] recording open attempts and sent frames.
pub struct MockStreamLink {
    open: AtomicBool,
    opens: AtomicUsize,
    fail_open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockStreamLink {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Simulate the link dropping.
    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockStreamLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamLink for MockStreamLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), RequestError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(RequestError::Transport("connect refused".to_string()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), RequestError> {
        if !self.is_open() {
            return Err(RequestError::Transport("link closed".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        Ok(())
    }
}

/// Pause the tokio clock.
#[cfg(feature = "testing-time")]
pub fn pause_time() {
    tokio::time::pause();
}

/// Advance the paused tokio clock.
#[cfg(feature = "testing-time")]
pub async fn advance_time(duration: std::time::Duration) {
    tokio::time::advance(duration).await;
}

/// Resume the tokio clock.
#[cfg(feature = "testing-time")]
pub fn resume_time() {
    tokio::time::resume();
}

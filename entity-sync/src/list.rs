//! Windowed list loading
//!
//! Offset-based alternative to page navigation: [`ListLoader::refresh`]
//! fetches the first window and [`ListLoader::load_more`] appends the next
//! one, tracking whether another window might exist. Responses may carry
//! full entities or a plain `attributelist`; entities land in the store,
//! attribute lists only contribute keys.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::entity::Entity;
use crate::error::{FetchError, RequestError};
use crate::query::{normalize, with_params, QueryParams};
use crate::status::Status;
use crate::store::EntityStore;
use crate::transport::{decode_list_payload, ListPayload, Session, Transport};

/// Ceiling on items per list window.
pub const MAX_LIST_WINDOW: u32 = 100;

/// Snapshot of a windowed list.
#[derive(Debug, Clone, Default)]
pub struct ListState {
    pub ids: Vec<String>,
    /// Whether the last window came back full, suggesting more items.
    pub can_load_more: bool,
    pub status: Status,
}

/// Where a locally known id lands in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Start,
    End,
}

struct LoaderInner {
    url: String,
    limit: u32,
    entity_type: String,
    transport: Arc<dyn Transport>,
    store: Arc<dyn EntityStore>,
    session: Option<Session>,
    state_tx: watch::Sender<ListState>,
    guard: Mutex<()>,
}

/// Offset-windowed list over one collection url.
#[derive(Clone)]
pub struct ListLoader {
    inner: Arc<LoaderInner>,
}

impl ListLoader {
    pub fn new(
        url: impl Into<String>,
        query: QueryParams,
        entity_type: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self::with_limit(url, query, entity_type, transport, store, MAX_LIST_WINDOW)
    }

    pub fn with_limit(
        url: impl Into<String>,
        query: QueryParams,
        entity_type: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn EntityStore>,
        limit: u32,
    ) -> Self {
        let limit = limit.clamp(1, MAX_LIST_WINDOW);
        let url = normalize(&url.into(), &query, limit);
        let (state_tx, _) = watch::channel(ListState::default());
        Self {
            inner: Arc::new(LoaderInner {
                url,
                limit,
                entity_type: entity_type.into(),
                transport,
                store,
                session: None,
                state_tx,
                guard: Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ListState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListState> {
        self.inner.state_tx.subscribe()
    }

    /// Fetch the first window, replacing whatever is loaded.
    pub async fn refresh(&self) -> Result<(), FetchError> {
        self.fetch_window(0, true).await
    }

    /// Append the next window. No-op when the last window was short.
    pub async fn load_more(&self) -> Result<(), FetchError> {
        let (can_load_more, offset) = {
            let state = self.inner.state_tx.borrow();
            (state.can_load_more, state.ids.len())
        };
        if !can_load_more {
            return Ok(());
        }
        self.fetch_window(offset, false).await
    }

    async fn fetch_window(&self, offset: usize, replace: bool) -> Result<(), FetchError> {
        // One window at a time per loader.
        let _guard = self.inner.guard.lock().await;

        self.inner
            .state_tx
            .send_modify(|state| state.status = Status::Pending);
        let url = with_params(
            &self.inner.url,
            &[
                ("offset", offset.to_string()),
                ("limit", self.inner.limit.to_string()),
            ],
            &[],
        );

        let outcome = async {
            let response = self
                .inner
                .transport
                .get(&url, self.inner.session.as_ref())
                .await
                .map_err(FetchError::Item)?;
            if !response.ok {
                return Err(FetchError::Item(RequestError::Status(response.status)));
            }
            decode_list_payload(response.json).map_err(FetchError::Item)
        }
        .await;

        match outcome {
            Ok(ListPayload::Entities(entities)) => {
                let got = entities.len();
                let mut ids = Vec::with_capacity(got);
                for entity in entities {
                    ids.push(entity.id().to_string());
                    self.inner.store.insert(&self.inner.entity_type, entity);
                }
                let limit = self.inner.limit as usize;
                self.inner.state_tx.send_modify(|state| {
                    if replace {
                        state.ids = ids.clone();
                    } else {
                        state.ids.extend(ids.clone());
                    }
                    state.can_load_more = got == limit;
                    state.status = Status::Success;
                });
                Ok(())
            }
            Ok(ListPayload::AttributeMap(map)) => {
                // Attribute lists are flat: no entities, no further windows.
                let ids: Vec<String> = map.keys().cloned().collect();
                self.inner.state_tx.send_modify(|state| {
                    state.ids = ids.clone();
                    state.can_load_more = false;
                    state.status = Status::Success;
                });
                Ok(())
            }
            Err(err) => {
                tracing::warn!(url, error = %err, "list window fetch failed");
                self.inner
                    .state_tx
                    .send_modify(|state| state.status = Status::Error);
                Err(err)
            }
        }
    }

    /// Splice a locally known id into the list without a refetch.
    pub fn add_id(&self, id: &str, position: Position) {
        self.inner.state_tx.send_modify(|state| {
            if state.ids.iter().any(|i| i == id) {
                return;
            }
            match position {
                Position::Start => state.ids.insert(0, id.to_string()),
                Position::End => state.ids.push(id.to_string()),
            }
        });
    }

    pub fn remove_id(&self, id: &str) {
        self.inner
            .state_tx
            .send_modify(|state| state.ids.retain(|i| i != id));
    }

    /// Stored snapshots for the loaded ids, skipping attribute-only keys.
    pub fn items(&self) -> Vec<Entity> {
        let ids = self.inner.state_tx.borrow().ids.clone();
        ids.iter()
            .filter_map(|id| self.inner.store.get(&self.inner.entity_type, id))
            .collect()
    }
}

//! Explicit-id loading
//!
//! Loads a fixed set of entity ids rather than a paginated query. Each id
//! carries its own fetch status plus the query it was fetched under, so a
//! later load can tell which ids are already covered and which need a
//! refetch (different filter, or a deeper `expand` than the cached fetch
//! used).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::sync::watch;

use crate::entity::Entity;
use crate::query::QueryParams;
use crate::status::Status;
use crate::store::EntityStore;
use crate::transport::{decode_list_payload, ListPayload, Session, Transport};

/// Ids per request when loading an explicit id set.
pub const ID_SLICE_LENGTH: usize = 100;

#[derive(Debug, Clone)]
struct IdRecord {
    status: Status,
    query: QueryParams,
}

/// Per-id fetch bookkeeping, shared by every [`IdLoader`] of one service.
#[derive(Default)]
pub struct IdStatusCache {
    records: Mutex<HashMap<String, IdRecord>>,
}

impl IdStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, IdRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self, id: &str) -> Status {
        self.lock().get(id).map(|r| r.status).unwrap_or_default()
    }

    fn set(&self, ids: &[String], status: Status, query: &QueryParams) {
        let mut records = self.lock();
        for id in ids {
            records.insert(
                id.clone(),
                IdRecord {
                    status,
                    query: query.clone(),
                },
            );
        }
    }

    /// Mark one id idle so the next load refetches it, even when a stored
    /// snapshot would otherwise satisfy the request.
    pub fn reset(&self, id: &str) {
        let mut records = self.lock();
        match records.get_mut(id) {
            Some(record) => record.status = Status::Idle,
            None => {
                records.insert(
                    id.to_string(),
                    IdRecord {
                        status: Status::Idle,
                        query: QueryParams::new(),
                    },
                );
            }
        }
    }

    /// Wipe all records. Wired to logout.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Loads and tracks an explicit set of entity ids for one service.
pub struct IdLoader {
    service: String,
    transport: Arc<dyn Transport>,
    store: Arc<dyn EntityStore>,
    statuses: Arc<IdStatusCache>,
    session: Option<Session>,
    status_tx: watch::Sender<Status>,
}

impl IdLoader {
    pub fn new(
        service: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn EntityStore>,
        statuses: Arc<IdStatusCache>,
    ) -> Self {
        let (status_tx, _) = watch::channel(Status::Idle);
        Self {
            service: service.into(),
            transport,
            store,
            statuses,
            session: None,
            status_tx,
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Aggregate status of the most recent load.
    pub fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    /// Ids from `ids` that the current caches do not cover for `query`.
    ///
    /// An id is missing when it has never been fetched, its last fetch
    /// failed or was reset, it was fetched under an incompatible query, or
    /// it was fetched with a shallower `expand` than requested. A store hit
    /// satisfies an unexpanded request directly.
    pub fn missing_ids(&self, ids: &[String], query: &QueryParams) -> Vec<String> {
        let requested_expand = query.expand_level().unwrap_or(0);
        let records = self.statuses.lock();
        ids.iter()
            .filter(|id| {
                match records.get(*id) {
                    Some(record) => {
                        if matches!(record.status, Status::Error | Status::Idle) {
                            return true;
                        }
                        if !record.query.compatible_with(query) {
                            return true;
                        }
                        let cached_expand = record.query.expand_level().unwrap_or(0);
                        cached_expand < requested_expand
                    }
                    None => {
                        // An unexpanded request is satisfied by any stored
                        // snapshot, whatever fetched it.
                        !(requested_expand <= 0
                            && self.store.get(&self.service, id).is_some())
                    }
                }
            })
            .cloned()
            .collect()
    }

    /// Fetch whatever `ids` still need, slice by slice.
    ///
    /// Slices fail independently: a failed slice marks only its own ids
    /// `Error` while sibling slices land normally. The aggregate status is
    /// `Error` if any slice failed, otherwise `Success`.
    pub async fn load(&self, ids: &[String], query: &QueryParams) -> Status {
        let wanted = self.missing_ids(ids, query);
        if wanted.is_empty() {
            let _ = self.status_tx.send_replace(Status::Success);
            return Status::Success;
        }
        self.statuses.set(&wanted, Status::Pending, query);
        let _ = self.status_tx.send_replace(Status::Pending);

        let slices = wanted
            .chunks(ID_SLICE_LENGTH)
            .map(|slice| self.load_slice(slice, query));
        let results = join_all(slices).await;

        let status = if results.iter().any(|s| *s == Status::Error) {
            Status::Error
        } else {
            Status::Success
        };
        let _ = self.status_tx.send_replace(status);
        status
    }

    async fn load_slice(&self, ids: &[String], query: &QueryParams) -> Status {
        let mut params = query.clone();
        params.insert("id", ids.to_vec());
        let url = format!("/{}?{}", self.service, params.to_query_string());

        let failed = |statuses: &IdStatusCache| {
            statuses.set(ids, Status::Error, query);
            Status::Error
        };

        let response = match self.transport.get(&url, self.session.as_ref()).await {
            Ok(response) if response.ok => response,
            Ok(response) => {
                tracing::warn!(url, status = response.status, "id slice fetch rejected");
                return failed(&self.statuses);
            }
            Err(err) => {
                tracing::warn!(url, error = %err, "id slice fetch failed");
                return failed(&self.statuses);
            }
        };
        let entities = match decode_list_payload(response.json) {
            Ok(ListPayload::Entities(entities)) => entities,
            _ => return failed(&self.statuses),
        };
        for entity in entities {
            self.store.insert(&self.service, entity);
        }
        self.statuses.set(ids, Status::Success, query);
        Status::Success
    }

    /// Mark a set of ids idle so the next load refetches them.
    pub fn reset(&self, ids: &[String]) {
        for id in ids {
            self.statuses.reset(id);
        }
        let _ = self.status_tx.send_replace(Status::Idle);
    }

    /// Mark one id idle and refetch it.
    pub async fn refresh(&self, id: &str, query: &QueryParams) -> Status {
        self.statuses.reset(id);
        self.load(&[id.to_string()], query).await
    }

    /// Stored snapshots for `ids`, skipping ids not yet loaded.
    pub fn items(&self, ids: &[String]) -> Vec<Entity> {
        ids.iter()
            .filter_map(|id| self.store.get(&self.service, id))
            .collect()
    }
}

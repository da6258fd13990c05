//! Entity snapshot storage
//!
//! [`EntityStore`] is the seam between the loaders and whatever holds the
//! application's canonical entity state. [`MemoryStore`] is the plain
//! in-process implementation; [`StorePagination`] keeps a paginated view
//! and a store reconciled with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::entity::Entity;
use crate::pagination::{PaginationController, PaginationState};

/// Canonical entity storage keyed by `(type, id)`.
pub trait EntityStore: Send + Sync {
    fn get(&self, entity_type: &str, id: &str) -> Option<Entity>;
    fn insert(&self, entity_type: &str, entity: Entity);
    fn remove(&self, entity_type: &str, id: &str);
    fn clear(&self);
}

type Key = (String, String);

/// In-process [`EntityStore`].
#[derive(Default)]
pub struct MemoryStore {
    entities: Mutex<HashMap<Key, Entity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Entity>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl EntityStore for MemoryStore {
    fn get(&self, entity_type: &str, id: &str) -> Option<Entity> {
        self.lock()
            .get(&(entity_type.to_string(), id.to_string()))
            .cloned()
    }

    fn insert(&self, entity_type: &str, entity: Entity) {
        self.lock()
            .insert((entity_type.to_string(), entity.id().to_string()), entity);
    }

    fn remove(&self, entity_type: &str, id: &str) {
        self.lock()
            .remove(&(entity_type.to_string(), id.to_string()));
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// A paginated view whose snapshots come from a store.
///
/// The pagination cache decides which ids are on the page; the store wins
/// on what each entity currently looks like. [`StorePagination::reconcile`]
/// drops page items the store no longer holds, for when deletions arrive
/// through the store first.
pub struct StorePagination {
    controller: PaginationController,
    store: Arc<dyn EntityStore>,
    entity_type: String,
}

impl StorePagination {
    pub fn new(
        controller: PaginationController,
        store: Arc<dyn EntityStore>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            store,
            entity_type: entity_type.into(),
        }
    }

    pub fn controller(&self) -> &PaginationController {
        &self.controller
    }

    pub fn state(&self) -> PaginationState {
        self.controller.state()
    }

    /// Current page with store-held versions substituted where available.
    pub fn items(&self) -> Vec<Entity> {
        let state = self.controller.state();
        state
            .items
            .into_iter()
            .map(|item| {
                self.store
                    .get(&self.entity_type, item.id())
                    .unwrap_or(item)
            })
            .collect()
    }

    /// Copy the current page's snapshots into the store.
    pub fn publish(&self) {
        for item in self.controller.state().items {
            self.store.insert(&self.entity_type, item);
        }
    }

    /// Remove page items the store no longer holds.
    pub fn reconcile(&self) {
        let state = self.controller.state();
        for id in &state.item_ids {
            if self.store.get(&self.entity_type, id).is_none() {
                self.controller.remove_item(id.as_str());
            }
        }
    }
}

//! Two-level query cache
//!
//! Level one maps each normalized query url to the pages of entity ids it
//! has resolved so far; level two maps entity ids to their latest snapshot,
//! shared across every query. Mutations keep page boundaries exact: an id
//! inserted at the front of a newest-first query ripples one overflow id
//! into each following cached page, and a removal pulls one id back from
//! each following page. Cached pages that cannot be kept exact (a shift
//! runs into an unfetched neighbor) are dropped so the next read refetches
//! them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::entity::Entity;
use crate::query::last_page;

/// Cached id pages for one normalized query.
#[derive(Debug, Clone, Default)]
pub(crate) struct CacheEntry {
    pub count: u64,
    pub page_size: u32,
    /// 1-based page number to the ids on that page. Sparse: only fetched
    /// pages are present.
    pub pages: BTreeMap<u32, Vec<String>>,
    /// Set when a local mutation could not keep the pages exact.
    pub stale: bool,
}

impl CacheEntry {
    fn last_page(&self) -> u32 {
        last_page(self.count, self.page_size)
    }

    /// Drop cached pages past the last valid page for the current count.
    fn trim_beyond_last(&mut self) {
        let last = self.last_page();
        self.pages.retain(|&n, _| n >= 1 && n <= last.max(1));
        if self.count == 0 {
            self.pages.clear();
        }
    }

    /// Insert `id` at the head of page 1 and ripple overflow forward.
    ///
    /// Each cached page after the first receives the id that overflowed off
    /// its predecessor. When the ripple reaches a gap (the next page was
    /// never fetched) the remaining cached pages would be off by one, so
    /// they are dropped instead of shifted.
    fn insert_front(&mut self, id: &str) {
        self.count += 1;
        let mut carry = Some(id.to_string());
        let mut expected = 1u32;
        let page_size = self.page_size as usize;

        let numbers: Vec<u32> = self.pages.keys().copied().collect();
        for n in numbers {
            if n != expected {
                if carry.is_some() {
                    self.pages.split_off(&n);
                }
                break;
            }
            expected += 1;
            let Some(incoming) = carry.take() else { break };
            let page = match self.pages.get_mut(&n) {
                Some(page) => page,
                None => break,
            };
            page.insert(0, incoming);
            if page.len() > page_size {
                carry = page.pop();
            }
        }
        self.trim_beyond_last();
    }

    /// Append `id` to the cached last page of an oldest-first query.
    fn append_back(&mut self, id: &str) {
        let last = self.last_page().max(1);
        self.count += 1;
        match self.pages.get_mut(&last) {
            Some(page) if page.len() < self.page_size as usize => {
                page.push(id.to_string());
            }
            Some(_) => {
                // The id starts a page we have not fetched.
                self.stale = true;
            }
            None => {}
        }
    }

    /// Remove `id` and pull one id back from each following cached page.
    /// Returns the page the id was found on.
    fn remove_and_shift(&mut self, id: &str) -> Option<u32> {
        let found = self
            .pages
            .iter()
            .find(|(_, ids)| ids.iter().any(|i| i == id))
            .map(|(&n, _)| n)?;

        if let Some(page) = self.pages.get_mut(&found) {
            page.retain(|i| i != id);
        }
        self.count = self.count.saturating_sub(1);
        let last = self.last_page();

        let numbers: Vec<u32> = self
            .pages
            .keys()
            .copied()
            .filter(|&n| n >= found)
            .collect();
        for n in numbers {
            if n > last {
                self.pages.remove(&n);
                continue;
            }
            let pulled = match self.pages.get_mut(&(n + 1)) {
                Some(next) if !next.is_empty() => Some(next.remove(0)),
                Some(_) => None,
                None => None,
            };
            match pulled {
                Some(id) => {
                    if let Some(page) = self.pages.get_mut(&n) {
                        page.push(id);
                    }
                }
                None if n != last => {
                    // No neighbor to pull from; everything past this page
                    // is now off by one.
                    self.pages.split_off(&(n + 1));
                    break;
                }
                None => {}
            }
        }
        self.trim_beyond_last();
        Some(found)
    }
}

#[derive(Default)]
struct CacheInner {
    urls: HashMap<String, CacheEntry>,
    items: HashMap<String, Entity>,
}

/// Result of a cache-side insertion.
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Query was never resolved; caller must refetch.
    NoEntry,
    /// Id already cached; only the snapshot was refreshed.
    AlreadyPresent,
    Inserted,
}

/// Result of a cache-side removal.
#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    NotFound,
    Removed { count: u64, last_page: u32 },
}

/// Shared pagination cache. One instance backs every controller in a
/// session; `Clone`-cheap handles are taken through `Arc`.
#[derive(Default)]
pub struct CacheStore {
    inner: Mutex<CacheInner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wipe both levels. Wired to logout.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.urls.clear();
        inner.items.clear();
    }

    /// Cached `(count, ids)` for one page, when the entry is usable.
    ///
    /// A count of zero short-circuits even with `use_cache == false`: the
    /// backend already told us the query is empty. Stale entries are
    /// dropped on sight so the caller falls through to a refetch.
    pub fn cached_pages(
        &self,
        url: &str,
        page: u32,
        page_size: u32,
        use_cache: bool,
    ) -> Option<(u64, Vec<String>)> {
        let mut inner = self.lock();
        let entry = inner.urls.get(url)?;
        if entry.stale {
            inner.urls.remove(url);
            return None;
        }
        if entry.page_size != page_size {
            return None;
        }
        if entry.count == 0 {
            return Some((0, Vec::new()));
        }
        if !use_cache {
            return None;
        }
        let ids = entry.pages.get(&page)?.clone();
        Some((entry.count, ids))
    }

    /// Merge freshly listed pages into a query entry. Additive: pages from
    /// earlier fetches of the same query are kept.
    pub fn merge_pages(
        &self,
        url: &str,
        count: u64,
        page_size: u32,
        pages: impl IntoIterator<Item = (u32, Vec<String>)>,
    ) {
        let mut inner = self.lock();
        let entry = inner.urls.entry(url.to_string()).or_default();
        if entry.page_size != page_size {
            entry.pages.clear();
        }
        entry.count = count;
        entry.page_size = page_size;
        entry.stale = false;
        entry.pages.extend(pages);
        entry.trim_beyond_last();
    }

    /// Drop one query's id pages and every item snapshot they referenced.
    pub fn invalidate_query(&self, url: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.urls.remove(url) {
            for ids in entry.pages.values() {
                for id in ids {
                    inner.items.remove(id);
                }
            }
        }
    }

    /// Ids from `ids` with no cached snapshot, in input order.
    pub fn missing_ids(&self, ids: &[String]) -> Vec<String> {
        let inner = self.lock();
        ids.iter()
            .filter(|id| !inner.items.contains_key(*id))
            .cloned()
            .collect()
    }

    /// All snapshots for `ids` in order, or `None` if any is missing.
    pub fn items_if_complete(&self, ids: &[String]) -> Option<Vec<Entity>> {
        let inner = self.lock();
        ids.iter().map(|id| inner.items.get(id).cloned()).collect()
    }

    pub fn insert_item(&self, entity: Entity) {
        self.lock().items.insert(entity.id().to_string(), entity);
    }

    pub fn insert_items(&self, entities: impl IntoIterator<Item = Entity>) {
        let mut inner = self.lock();
        for entity in entities {
            inner.items.insert(entity.id().to_string(), entity);
        }
    }

    pub fn item(&self, id: &str) -> Option<Entity> {
        self.lock().items.get(id).cloned()
    }

    /// Record a newly created entity against a resolved query.
    pub fn add_to_query(&self, url: &str, entity: &Entity, from_last: bool) -> AddOutcome {
        let mut inner = self.lock();
        let id = entity.id().to_string();
        let Some(entry) = inner.urls.get_mut(url) else {
            return AddOutcome::NoEntry;
        };
        let present = entry.pages.values().any(|ids| ids.iter().any(|i| i == &id));
        if present {
            inner.items.insert(id, entity.clone());
            return AddOutcome::AlreadyPresent;
        }
        if from_last {
            entry.insert_front(&id);
        } else {
            // Materialize a fresh last page when the new id starts one and
            // its predecessor is cached.
            let old_last = entry.last_page().max(1);
            let full = entry
                .pages
                .get(&old_last)
                .map(|p| p.len() >= entry.page_size as usize)
                .unwrap_or(false);
            if full {
                entry.count += 1;
                entry.pages.insert(old_last + 1, vec![id.clone()]);
            } else {
                entry.append_back(&id);
            }
        }
        inner.items.insert(id, entity.clone());
        AddOutcome::Inserted
    }

    /// Remove an entity from a resolved query, shifting following pages.
    pub fn remove_from_query(&self, url: &str, id: &str) -> RemoveOutcome {
        let mut inner = self.lock();
        let Some(entry) = inner.urls.get_mut(url) else {
            return RemoveOutcome::NotFound;
        };
        match entry.remove_and_shift(id) {
            Some(_) => {
                let count = entry.count;
                let last = entry.last_page();
                inner.items.remove(id);
                RemoveOutcome::Removed {
                    count,
                    last_page: last,
                }
            }
            None => RemoveOutcome::NotFound,
        }
    }

    /// Replace an item snapshot. Returns whether the id was known.
    pub fn replace_item(&self, entity: &Entity) -> bool {
        let mut inner = self.lock();
        let id = entity.id().to_string();
        let known = inner.items.contains_key(&id);
        inner.items.insert(id, entity.clone());
        known
    }

    /// Whether a cached page of `url` holds `id`.
    pub fn page_contains(&self, url: &str, page: u32, id: &str) -> bool {
        let inner = self.lock();
        inner
            .urls
            .get(url)
            .and_then(|entry| entry.pages.get(&page))
            .map(|ids| ids.iter().any(|i| i == id))
            .unwrap_or(false)
    }

    /// One-lock read of a page for re-rendering after a mutation: the
    /// count, the page's ids, and the full snapshot list when every
    /// snapshot is cached.
    pub fn page_items(
        &self,
        url: &str,
        page: u32,
    ) -> Option<(u64, Vec<String>, Option<Vec<Entity>>)> {
        let inner = self.lock();
        let entry = inner.urls.get(url)?;
        if entry.stale {
            return None;
        }
        if entry.count == 0 {
            return Some((0, Vec::new(), Some(Vec::new())));
        }
        let ids = entry.pages.get(&page)?.clone();
        let items: Option<Vec<Entity>> =
            ids.iter().map(|id| inner.items.get(id).cloned()).collect();
        Some((entry.count, ids, items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str) -> Entity {
        Entity::from_value(json!({"meta": {"id": id, "type": "device"}})).unwrap()
    }

    fn ids(prefix: &str, range: std::ops::Range<u32>) -> Vec<String> {
        range.map(|i| format!("{prefix}{i}")).collect()
    }

    fn seeded(url: &str, count: u64, pages: Vec<(u32, Vec<String>)>) -> CacheStore {
        let store = CacheStore::new();
        store.merge_pages(url, count, 3, pages);
        store
    }

    #[test]
    fn test_insert_front_ripples_through_contiguous_pages() {
        let store = seeded(
            "/q",
            6,
            vec![(1, ids("a", 0..3)), (2, ids("b", 0..3))],
        );
        for e in ids("a", 0..3).iter().chain(ids("b", 0..3).iter()) {
            store.insert_item(entity(e));
        }

        let outcome = store.add_to_query("/q", &entity("new"), true);
        assert_eq!(outcome, AddOutcome::Inserted);

        let (count, page1) = store.cached_pages("/q", 1, 3, true).unwrap();
        assert_eq!(count, 7);
        assert_eq!(page1, vec!["new", "a0", "a1"]);
        let (_, page2) = store.cached_pages("/q", 2, 3, true).unwrap();
        assert_eq!(page2, vec!["a2", "b0", "b1"]);
        // b2 overflowed onto page 3, which was never fetched
        assert!(store.cached_pages("/q", 3, 3, true).is_none());
    }

    #[test]
    fn test_insert_front_invalidates_past_gap() {
        // pages 1 and 3 cached, 2 missing: the carry into page 3 cannot be
        // computed, so page 3 must go.
        let store = seeded(
            "/q",
            9,
            vec![(1, ids("a", 0..3)), (3, ids("c", 0..3))],
        );
        store.add_to_query("/q", &entity("new"), true);

        let (count, page1) = store.cached_pages("/q", 1, 3, true).unwrap();
        assert_eq!(count, 10);
        assert_eq!(page1, vec!["new", "a0", "a1"]);
        assert!(store.cached_pages("/q", 3, 3, true).is_none());
    }

    #[test]
    fn test_add_is_idempotent() {
        let store = seeded("/q", 3, vec![(1, ids("a", 0..3))]);
        let outcome = store.add_to_query("/q", &entity("a1"), true);
        assert_eq!(outcome, AddOutcome::AlreadyPresent);
        let (count, page1) = store.cached_pages("/q", 1, 3, true).unwrap();
        assert_eq!(count, 3);
        assert_eq!(page1, ids("a", 0..3));
    }

    #[test]
    fn test_add_without_entry_reports_no_entry() {
        let store = CacheStore::new();
        assert_eq!(
            store.add_to_query("/q", &entity("x"), true),
            AddOutcome::NoEntry
        );
    }

    #[test]
    fn test_remove_pulls_from_next_page() {
        let store = seeded(
            "/q",
            7,
            vec![
                (1, ids("a", 0..3)),
                (2, ids("b", 0..3)),
                (3, vec!["c0".into()]),
            ],
        );
        let outcome = store.remove_from_query("/q", "a1");
        assert_eq!(
            outcome,
            RemoveOutcome::Removed {
                count: 6,
                last_page: 2
            }
        );
        let (_, page1) = store.cached_pages("/q", 1, 3, true).unwrap();
        assert_eq!(page1, vec!["a0", "a2", "b0"]);
        let (_, page2) = store.cached_pages("/q", 2, 3, true).unwrap();
        assert_eq!(page2, vec!["b1", "b2", "c0"]);
        // page 3 is now beyond the last page
        assert!(store.cached_pages("/q", 3, 3, true).is_none());
    }

    #[test]
    fn test_remove_invalidates_past_gap() {
        let store = seeded(
            "/q",
            9,
            vec![(1, ids("a", 0..3)), (3, ids("c", 0..3))],
        );
        store.remove_from_query("/q", "a0");
        let (_, page1) = store.cached_pages("/q", 1, 3, true).unwrap();
        // nothing to pull from the unfetched page 2
        assert_eq!(page1, vec!["a1", "a2"]);
        assert!(store.cached_pages("/q", 3, 3, true).is_none());
    }

    #[test]
    fn test_remove_then_add_round_trip() {
        let store = seeded("/q", 3, vec![(1, ids("a", 0..3))]);
        store.remove_from_query("/q", "a0");
        store.add_to_query("/q", &entity("a0"), true);
        let (count, page1) = store.cached_pages("/q", 1, 3, true).unwrap();
        assert_eq!(count, 3);
        assert_eq!(page1, vec!["a0", "a1", "a2"]);
    }

    #[test]
    fn test_remove_unknown_id() {
        let store = seeded("/q", 3, vec![(1, ids("a", 0..3))]);
        assert_eq!(store.remove_from_query("/q", "zz"), RemoveOutcome::NotFound);
    }

    #[test]
    fn test_append_back_materializes_new_last_page() {
        let store = seeded("/q", 3, vec![(1, ids("a", 0..3))]);
        // oldest-first: a new item lands on a fresh last page
        let outcome = store.add_to_query("/q", &entity("new"), false);
        assert_eq!(outcome, AddOutcome::Inserted);
        let (_, page2) = store.cached_pages("/q", 2, 3, true).unwrap();
        assert_eq!(page2, vec!["new"]);
    }

    #[test]
    fn test_zero_count_short_circuits_without_cache() {
        let store = CacheStore::new();
        store.merge_pages("/q", 0, 3, Vec::new());
        let (count, ids) = store.cached_pages("/q", 1, 3, false).unwrap();
        assert_eq!(count, 0);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_page_size_mismatch_misses() {
        let store = seeded("/q", 3, vec![(1, ids("a", 0..3))]);
        assert!(store.cached_pages("/q", 1, 5, true).is_none());
    }

    #[test]
    fn test_invalidate_query_drops_pages_and_items() {
        let store = seeded("/q", 3, vec![(1, ids("a", 0..3))]);
        store.insert_item(entity("a0"));
        store.invalidate_query("/q");
        assert!(store.cached_pages("/q", 1, 3, true).is_none());
        assert!(store.item("a0").is_none());
    }

    #[test]
    fn test_items_if_complete_and_missing() {
        let store = CacheStore::new();
        store.insert_item(entity("a"));
        let want = vec!["a".to_string(), "b".to_string()];
        assert!(store.items_if_complete(&want).is_none());
        assert_eq!(store.missing_ids(&want), vec!["b".to_string()]);
        store.insert_item(entity("b"));
        assert_eq!(store.items_if_complete(&want).unwrap().len(), 2);
    }

    #[test]
    fn test_page_items_single_lock_read() {
        let store = seeded("/q", 2, vec![(1, vec!["a".into(), "b".into()])]);
        store.insert_item(entity("a"));
        let (count, ids, items) = store.page_items("/q", 1).unwrap();
        assert_eq!(count, 2);
        assert_eq!(ids.len(), 2);
        assert!(items.is_none());
        store.insert_item(entity("b"));
        let (_, _, items) = store.page_items("/q", 1).unwrap();
        assert_eq!(items.unwrap().len(), 2);
    }
}

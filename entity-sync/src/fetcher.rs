//! Two-phase page resolution
//!
//! Phase one lists entity ids: one id-listing request covers an "id page"
//! of `limit` ids, which the fetcher chunks into entity pages and merges
//! into the cache. Phase two fetches the snapshots the cache is missing,
//! batched at most [`MAX_IDS_PER_ITEM_REQUEST`] ids per request and issued
//! concurrently.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::cache::CacheStore;
use crate::entity::Entity;
use crate::error::{FetchError, RequestError};
use crate::query::{id_page_limit, with_params};
use crate::transport::{decode_list_payload, IdListing, ListPayload, Session, Transport};

/// Ceiling on ids per item-batch request.
pub const MAX_IDS_PER_ITEM_REQUEST: usize = 100;

/// Outcome of phase one for a single entity page.
#[derive(Debug, Clone)]
pub(crate) struct PageListing {
    pub count: u64,
    pub ids: Vec<String>,
}

pub(crate) struct PageFetcher {
    transport: Arc<dyn Transport>,
    cache: Arc<CacheStore>,
}

impl PageFetcher {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<CacheStore>) -> Self {
        Self { transport, cache }
    }

    /// Phase one: resolve the ids and total count for `page`.
    ///
    /// `url` must already be normalized. The request fetches the whole id
    /// page containing the target entity page; sibling entity pages from
    /// the same response are merged into the cache for free.
    pub async fn get_pages(
        &self,
        url: &str,
        page: u32,
        page_size: u32,
        use_cache: bool,
        session: Option<&Session>,
    ) -> Result<PageListing, FetchError> {
        if let Some((count, ids)) = self.cache.cached_pages(url, page, page_size, use_cache) {
            tracing::debug!(url, page, "page served from id cache");
            return Ok(PageListing { count, ids });
        }

        let limit = id_page_limit(page_size);
        let pages_per_listing = (limit / page_size).max(1);
        // 0-based index of the id page holding the requested entity page
        let ids_page = ((page as u64 * page_size as u64).div_ceil(limit as u64) as u32).max(1) - 1;
        let page_offset = ids_page * pages_per_listing;
        let offset = ids_page as u64 * limit as u64;

        let listing_url = with_params(url, &[("offset", offset.to_string())], &["expand"]);
        let response = self
            .transport
            .get(&listing_url, session)
            .await
            .map_err(FetchError::Count)?;
        if !response.ok {
            return Err(FetchError::Count(RequestError::Status(response.status)));
        }
        let listing: IdListing = serde_json::from_value(response.json)
            .map_err(|e| FetchError::Count(RequestError::Decode(e.to_string())))?;

        let mut pages = Vec::new();
        for (i, chunk) in listing.id.chunks(page_size as usize).enumerate() {
            pages.push((page_offset + 1 + i as u32, chunk.to_vec()));
        }
        let requested = pages
            .iter()
            .find(|(n, _)| *n == page)
            .map(|(_, ids)| ids.clone())
            .unwrap_or_default();

        if use_cache {
            self.cache
                .merge_pages(url, listing.count, page_size, pages);
        }

        Ok(PageListing {
            count: listing.count,
            ids: requested,
        })
    }

    /// Phase two: materialize snapshots for `ids`, preserving their order.
    ///
    /// With caching on, only ids absent from the item cache hit the
    /// network; a fully cached page resolves with zero requests. Without
    /// caching, `current` supplies snapshots already held by the caller so
    /// unchanged ids are not refetched.
    pub async fn get_current_page_items(
        &self,
        url: &str,
        ids: &[String],
        use_cache: bool,
        current: &[Entity],
        session: Option<&Session>,
    ) -> Result<Vec<Entity>, FetchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let to_fetch: Vec<String> = if use_cache {
            if let Some(items) = self.cache.items_if_complete(ids) {
                tracing::debug!(url, "page items served from item cache");
                return Ok(items);
            }
            self.cache.missing_ids(ids)
        } else if current.is_empty() {
            ids.to_vec()
        } else {
            ids.iter()
                .filter(|id| !current.iter().any(|e| e.id() == id.as_str()))
                .cloned()
                .collect()
        };

        let batches = to_fetch
            .chunks(MAX_IDS_PER_ITEM_REQUEST)
            .map(|chunk| self.fetch_item_batch(url, chunk, session));
        let fetched: Vec<Vec<Entity>> = try_join_all(batches).await?;
        let mut fresh: Vec<Entity> = fetched.into_iter().flatten().collect();

        if use_cache {
            self.cache.insert_items(fresh.iter().cloned());
        }

        // Assemble in page order: fresh snapshots first, then whatever the
        // cache or the caller already held.
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let found = fresh
                .iter()
                .position(|e| e.id() == id.as_str())
                .map(|i| fresh.swap_remove(i))
                .or_else(|| {
                    if use_cache {
                        self.cache.item(id)
                    } else {
                        current.iter().find(|e| e.id() == id.as_str()).cloned()
                    }
                });
            if let Some(entity) = found {
                items.push(entity);
            }
        }
        Ok(items)
    }

    async fn fetch_item_batch(
        &self,
        url: &str,
        ids: &[String],
        session: Option<&Session>,
    ) -> Result<Vec<Entity>, FetchError> {
        let joined = format!("[{}]", ids.join(","));
        let batch_url = with_params(url, &[("id", joined)], &[]);
        let response = self
            .transport
            .get(&batch_url, session)
            .await
            .map_err(FetchError::Item)?;
        if !response.ok {
            return Err(FetchError::Item(RequestError::Status(response.status)));
        }
        match decode_list_payload(response.json).map_err(FetchError::Item)? {
            ListPayload::Entities(entities) => Ok(entities),
            ListPayload::AttributeMap(_) => Err(FetchError::Item(RequestError::Decode(
                "expected entities, got attribute list".to_string(),
            ))),
        }
    }
}

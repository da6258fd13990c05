//! Pagination cache and subscription sync for entity backends
//!
//! This crate keeps a client-side view of a REST collection consistent and
//! cheap to read: a two-level cache (id pages per query, one snapshot per
//! entity shared across queries), page-exact local mutations, and a
//! debounced stream subscription registry.
//!
//! # Core Concepts
//!
//! - **PaginationController**: one paginated view over a collection url,
//!   watchable through a [`tokio::sync::watch`] channel
//! - **CacheStore**: the shared two-level cache; mutations ripple ids
//!   across cached page boundaries instead of refetching
//! - **Transport**: the single seam to the backend; everything is a GET
//! - **SubscriptionRegistry**: ref-counted entity subscriptions coalesced
//!   into one debounced frame per burst
//! - **LogoutHub**: synchronous teardown of all session-scoped state
//!
//! # Basic Example
//!
//! ```ignore
//! use entity_sync::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn Transport>) {
//! let cache = Arc::new(CacheStore::new());
//! let controller = PaginationController::new(
//!     transport,
//!     cache.clone(),
//!     PaginationConfig::new("/device").with_page_size(10),
//! );
//!
//! controller.resolve().await.unwrap();
//! let state = controller.state();
//! println!("page {} of {}", state.page, state.last_page());
//!
//! // A second controller over the same query resolves without touching
//! // the network.
//! # }
//! ```
//!
//! # Mutation Pattern
//!
//! After creating, deleting or editing an entity through the backend,
//! report it locally instead of refetching:
//!
//! ```ignore
//! controller.add_item(created);
//! controller.remove_item("device-7");
//! controller.update_item(edited);
//! ```
//!
//! Each call resolves from cache when the page math stays exact and falls
//! back to a background refetch when it cannot.

pub mod cache;
pub mod entity;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod ids;
pub mod list;
pub mod pagination;
pub mod query;
pub mod status;
pub mod store;
pub mod stream;
pub mod testing;
pub mod transport;

pub use cache::{AddOutcome, CacheStore, RemoveOutcome};
pub use entity::{Entity, EntityError, ItemRef};
pub use error::{FetchError, RequestError};
pub use events::LogoutHub;
pub use fetcher::MAX_IDS_PER_ITEM_REQUEST;
pub use ids::{IdLoader, IdStatusCache, ID_SLICE_LENGTH};
pub use list::{ListLoader, ListState, Position, MAX_LIST_WINDOW};
pub use pagination::{PaginationConfig, PaginationController, PaginationState};
pub use query::{QueryParams, DEFAULT_PAGE_SIZE, MAX_IDS_PER_REQUEST};
pub use status::Status;
pub use store::{EntityStore, MemoryStore, StorePagination};
pub use stream::{Change, StreamLink, SubscriptionRegistry, DEBOUNCE_WINDOW};
pub use transport::{IdListing, ListPayload, Response, Session, Transport};

#[cfg(feature = "http")]
pub use transport::HttpTransport;

/// Common imports for building on this crate.
pub mod prelude {
    pub use crate::cache::CacheStore;
    pub use crate::entity::{Entity, ItemRef};
    pub use crate::error::{FetchError, RequestError};
    pub use crate::events::LogoutHub;
    pub use crate::pagination::{PaginationConfig, PaginationController, PaginationState};
    pub use crate::query::QueryParams;
    pub use crate::status::Status;
    pub use crate::store::{EntityStore, MemoryStore};
    pub use crate::stream::{Change, StreamLink, SubscriptionRegistry};
    pub use crate::transport::{Session, Transport};
}

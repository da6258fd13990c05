//! Error taxonomy for fetch resolutions
//!
//! Only network failures surface as errors. A stale resolution (the owning
//! controller was torn down or reconfigured mid-flight) is discarded
//! silently, and mutation helpers never return errors at all: they either
//! resolve from cache or fall back to a refresh.

use thiserror::Error;

/// Failure of a single backend request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The backend answered with a non-2xx status.
    #[error("http status {0}")]
    Status(u16),
    /// The request never produced a response.
    #[error("transport: {0}")]
    Transport(String),
    /// The response body did not match the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Failure of a pagination resolution cycle.
///
/// A failed resolution commits nothing: entities merged by a *previous*
/// successful resolution stay valid in cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The id-listing request failed.
    #[error("id listing failed: {0}")]
    Count(#[source] RequestError),
    /// One or more batched item requests failed. Results from sibling
    /// batches in the same resolution are discarded.
    #[error("item fetch failed: {0}")]
    Item(#[source] RequestError),
}

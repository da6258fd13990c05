//! Debounced entity subscriptions
//!
//! Views declare which entities they watch; the registry keeps a reference
//! count per path and mirrors the union to the backend over a stream link.
//! Updates are debounced: a burst of subscription changes collapses into a
//! single wire frame sent [`DEBOUNCE_WINDOW`] after the last change. An
//! explicit [`SubscriptionRegistry::flush`] skips the wait.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::RequestError;

/// Quiet period before a subscription change hits the wire.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Direction of a subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Add,
    Remove,
}

/// Low-level duplex link the registry writes frames to.
#[async_trait]
pub trait StreamLink: Send + Sync {
    fn is_open(&self) -> bool;
    async fn open(&self) -> Result<(), RequestError>;
    async fn send(&self, frame: String) -> Result<(), RequestError>;
}

struct RegistryState {
    /// Reference count per subscription path.
    refs: BTreeMap<String, usize>,
    /// Path set last acknowledged by the link.
    sent: Vec<String>,
    /// Debounce timer for the next flush.
    pending: Option<AbortHandle>,
}

struct RegistryInner {
    link: Arc<dyn StreamLink>,
    endpoint: String,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared subscription coalescer. Clone-cheap; all clones share one
/// reference table and one debounce timer.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(link: Arc<dyn StreamLink>, endpoint: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                link,
                endpoint: endpoint.into(),
                state: Mutex::new(RegistryState {
                    refs: BTreeMap::new(),
                    sent: Vec::new(),
                    pending: None,
                }),
            }),
        }
    }

    fn path(entity_type: &str, id: &str) -> String {
        format!("/{entity_type}/{id}")
    }

    /// Subscription paths for a set of entity ids.
    pub fn paths_for(entity_type: &str, ids: &[String]) -> Vec<String> {
        ids.iter().map(|id| Self::path(entity_type, id)).collect()
    }

    /// Apply a subscription change for a set of entity ids and arm the
    /// debounce timer. An `Add` bumps each path's reference count; a
    /// `Remove` drops it, deleting the path when it reaches zero.
    pub fn update(&self, change: Change, entity_type: &str, ids: &[String]) {
        let mut state = self.inner.state();
        for id in ids {
            let path = Self::path(entity_type, id);
            match change {
                Change::Add => {
                    *state.refs.entry(path).or_insert(0) += 1;
                }
                Change::Remove => {
                    if let Some(count) = state.refs.get_mut(&path) {
                        *count -= 1;
                        if *count == 0 {
                            state.refs.remove(&path);
                        }
                    }
                }
            }
        }

        if let Some(handle) = state.pending.take() {
            handle.abort();
        }
        let registry = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            registry.flush().await;
        });
        state.pending = Some(task.abort_handle());
    }

    /// Push the current path set to the backend immediately.
    ///
    /// No-op when the set already matches what was last sent. The link is
    /// opened lazily; if opening or sending fails the sent set is left
    /// untouched, so the next update retries the full delta.
    pub async fn flush(&self) {
        let (paths, endpoint) = {
            let mut state = self.inner.state();
            if let Some(handle) = state.pending.take() {
                handle.abort();
            }
            let paths: Vec<String> = state.refs.keys().cloned().collect();
            if paths == state.sent {
                return;
            }
            (paths, self.inner.endpoint.clone())
        };

        if !self.inner.link.is_open() {
            if let Err(err) = self.inner.link.open().await {
                tracing::warn!(error = %err, "stream link open failed, subscriptions deferred");
                return;
            }
        }

        let frame = json!({
            "jsonrpc": "2.0",
            "method": "PATCH",
            "id": Uuid::new_v4().to_string(),
            "params": {
                "url": endpoint,
                "data": paths,
            },
        });
        match self.inner.link.send(frame.to_string()).await {
            Ok(()) => {
                self.inner.state().sent = paths;
            }
            Err(err) => {
                tracing::warn!(error = %err, "subscription frame send failed");
            }
        }
    }

    /// Current reference count for one entity.
    pub fn ref_count(&self, entity_type: &str, id: &str) -> usize {
        self.inner
            .state()
            .refs
            .get(&Self::path(entity_type, id))
            .copied()
            .unwrap_or(0)
    }

    pub fn subscribed(&self, entity_type: &str, id: &str) -> bool {
        self.ref_count(entity_type, id) > 0
    }

    /// Drop every subscription. Wired to logout.
    pub fn clear(&self) {
        let mut state = self.inner.state();
        if let Some(handle) = state.pending.take() {
            handle.abort();
        }
        state.refs.clear();
        state.sent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStreamLink;
    use serde_json::Value;

    fn registry() -> (Arc<MockStreamLink>, SubscriptionRegistry) {
        let link = Arc::new(MockStreamLink::new());
        let registry = SubscriptionRegistry::new(link.clone() as Arc<dyn StreamLink>, "/services/2.1/websocket/open/subscription");
        (link, registry)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn frame_paths(frame: &str) -> Vec<String> {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["params"]["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_refcount_keeps_shared_subscription_alive() {
        let (link, registry) = registry();
        // two views watch the same entity
        registry.update(Change::Add, "device", &ids(&["a"]));
        registry.update(Change::Add, "device", &ids(&["a"]));
        assert_eq!(registry.ref_count("device", "a"), 2);

        registry.update(Change::Remove, "device", &ids(&["a"]));
        assert!(registry.subscribed("device", "a"));

        registry.flush().await;
        assert_eq!(frame_paths(&link.sent_frames()[0]), vec!["/device/a"]);

        registry.update(Change::Remove, "device", &ids(&["a"]));
        assert!(!registry.subscribed("device", "a"));
        registry.flush().await;
        let frames = link.sent_frames();
        assert!(frame_paths(&frames[frames.len() - 1]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_frame() {
        let (link, registry) = registry();
        registry.update(Change::Add, "device", &ids(&["a"]));
        registry.update(Change::Add, "device", &ids(&["b"]));
        registry.update(Change::Add, "state", &ids(&["c"]));

        tokio::time::sleep(DEBOUNCE_WINDOW * 2).await;
        let frames = link.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frame_paths(&frames[0]),
            vec!["/device/a", "/device/b", "/state/c"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_skips_when_nothing_changed() {
        let (link, registry) = registry();
        registry.update(Change::Add, "device", &ids(&["a"]));
        registry.flush().await;
        registry.flush().await;
        assert_eq!(link.sent_frames().len(), 1);
        assert_eq!(link.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_opened_lazily_and_reopened() {
        let (link, registry) = registry();
        assert_eq!(link.open_count(), 0);

        registry.update(Change::Add, "device", &ids(&["a"]));
        registry.flush().await;
        assert_eq!(link.open_count(), 1);

        link.disconnect();
        registry.update(Change::Add, "device", &ids(&["b"]));
        registry.flush().await;
        assert_eq!(link.open_count(), 2);
        assert_eq!(link.sent_frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_retries_on_next_flush() {
        let (link, registry) = registry();
        link.set_fail_open(true);
        registry.update(Change::Add, "device", &ids(&["a"]));
        registry.flush().await;
        assert!(link.sent_frames().is_empty());

        link.set_fail_open(false);
        registry.flush().await;
        assert_eq!(frame_paths(&link.sent_frames()[0]), vec!["/device/a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_is_jsonrpc_patch() {
        let (link, registry) = registry();
        registry.update(Change::Add, "device", &ids(&["a"]));
        registry.flush().await;

        let value: Value = serde_json::from_str(&link.sent_frames()[0]).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "PATCH");
        assert!(value["id"].as_str().is_some());
        assert_eq!(
            value["params"]["url"],
            "/services/2.1/websocket/open/subscription"
        );
    }

    #[test]
    fn test_paths_for() {
        assert_eq!(
            SubscriptionRegistry::paths_for("device", &ids(&["a", "b"])),
            vec!["/device/a", "/device/b"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_everything() {
        let (link, registry) = registry();
        registry.update(Change::Add, "device", &ids(&["a", "b"]));
        registry.flush().await;
        assert_eq!(link.sent_frames().len(), 1);

        registry.clear();
        assert!(!registry.subscribed("device", "a"));
        // sent set cleared too: a later identical add re-sends
        registry.update(Change::Add, "device", &ids(&["a", "b"]));
        registry.flush().await;
        assert_eq!(link.sent_frames().len(), 2);
    }
}

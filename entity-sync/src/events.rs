//! Session lifecycle events

use std::sync::{Arc, Mutex, PoisonError};

type Listener = Box<dyn Fn() + Send + Sync>;

/// Broadcast point for logout.
///
/// Caches and subscription registries hook themselves in at construction;
/// [`LogoutHub::fire`] runs every listener synchronously, in registration
/// order, so all cached state is gone before the call returns.
#[derive(Clone, Default)]
pub struct LogoutHub {
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl LogoutHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_logout(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.lock().push(Box::new(listener));
    }

    pub fn fire(&self) {
        tracing::debug!("logout fired, clearing session state");
        // Listeners run outside the lock so one may register another.
        let listeners = std::mem::take(&mut *self.lock());
        for listener in &listeners {
            listener();
        }
        let mut guard = self.lock();
        let added = std::mem::take(&mut *guard);
        *guard = listeners;
        guard.extend(added);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Lock-guarded handler registry.
//!
//! Handlers are kept in registration order and compared by identity (the
//! address of the shared allocation), so the same handle can never appear
//! twice under the same key.

use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct HandlerRegistry<K, H: ?Sized> {
    name: &'static str,
    entries: Mutex<Vec<(K, Arc<H>)>>,
}

impl<K: PartialEq + Clone, H: ?Sized> HandlerRegistry<K, H> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Add a handler. Returns `false` (and warns) if it is already present.
    pub fn register(&self, key: K, handler: Arc<H>) -> bool {
        let mut entries = self.entries.lock();
        if entries
            .iter()
            .any(|(k, h)| *k == key && same_handler(h, &handler))
        {
            warn!("[Registry] Handler already registered in {}", self.name);
            return false;
        }
        entries.push((key, handler));
        true
    }

    /// Remove a handler. Returns `false` (and warns) if it was not present.
    pub fn unregister(&self, key: &K, handler: &Arc<H>) -> bool {
        let mut entries = self.entries.lock();
        match entries
            .iter()
            .position(|(k, h)| k == key && same_handler(h, handler))
        {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => {
                warn!("[Registry] Handler not registered in {}", self.name);
                false
            }
        }
    }

    /// Handlers registered under `key`, in registration order.
    ///
    /// The snapshot is taken under the lock, so concurrent registration
    /// changes never corrupt an in-progress dispatch.
    pub fn snapshot(&self, key: &K) -> Vec<Arc<H>> {
        self.entries
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same_handler<H: ?Sized>(a: &Arc<H>, b: &Arc<H>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

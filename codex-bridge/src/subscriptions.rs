//! Notification subscriptions keyed by method name.
//!
//! Dispatch order is registration order per method. Each handler runs in
//! isolation: an `Err` or a panic is logged and the remaining handlers still run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;

pub type NotificationHandler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;
pub type NotificationFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Handle identifying one registration, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Entry {
    id: SubscriptionId,
    handler: NotificationHandler,
    filter: Option<NotificationFilter>,
}

pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    by_method: DashMap<String, Vec<Entry>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_method: DashMap::new(),
        }
    }

    pub fn add(
        &self,
        method: &str,
        handler: NotificationHandler,
        filter: Option<NotificationFilter>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_method
            .entry(method.to_string())
            .or_default()
            .push(Entry {
                id,
                handler,
                filter,
            });
        tracing::trace!(method, ?id, "Registered notification handler");
        id
    }

    /// Returns false if the subscription was not registered.
    pub fn remove(&self, method: &str, id: SubscriptionId) -> bool {
        let removed = match self.by_method.get_mut(method) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                entries.len() != before
            }
            None => false,
        };
        self.by_method.remove_if(method, |_, entries| entries.is_empty());
        removed
    }

    pub fn handler_count(&self, method: &str) -> usize {
        self.by_method.get(method).map(|e| e.len()).unwrap_or(0)
    }

    /// Invoke every matching handler for `method`. Returns how many ran.
    ///
    /// Works on a snapshot, so handlers may (un)register subscriptions freely.
    pub fn dispatch(&self, method: &str, params: &Value) -> usize {
        let entries: Vec<Entry> = self
            .by_method
            .get(method)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut invoked = 0;
        for entry in &entries {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(filter) = &entry.filter
                    && !filter(params)
                {
                    return Ok(false);
                }
                (entry.handler)(params).map(|()| true)
            }));
            match outcome {
                Ok(Ok(true)) => invoked += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    invoked += 1;
                    tracing::error!(method, error = %e, "Notification handler error");
                }
                Err(_) => {
                    invoked += 1;
                    tracing::error!(method, "Notification handler panicked");
                }
            }
        }
        invoked
    }
}

/// RAII registration: unregisters when dropped.
pub struct Subscription {
    registry: Arc<SubscriptionRegistry>,
    method: String,
    id: SubscriptionId,
}

impl Subscription {
    pub(crate) fn new(registry: Arc<SubscriptionRegistry>, method: String, id: SubscriptionId) -> Self {
        Self {
            registry,
            method,
            id,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.method, self.id);
    }
}

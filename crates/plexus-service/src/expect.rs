//! One-shot expect table.
//!
//! An *expect* is a handler armed against a `channel:subject:driver`
//! key with a timeout. When a matching message arrives first, the whole
//! key is consumed atomically and every armed handler runs exactly
//! once; when the timer fires first, only that entry is removed and its
//! timeout callback runs instead. Entries carry an explicit monotonic
//! ID so a timer can never evict a later handler armed under the same
//! key.

use crate::task::run_contained;
use plexus_wire::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Handler armed for one expected message.
pub type ExpectHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Callback fired when an expect expires unanswered.
pub type TimeoutHandler = Box<dyn FnOnce() + Send>;

struct ExpectEntry {
    id: u64,
    handler: ExpectHandler,
}

/// Table of pending expects, keyed `channel:subject:driverName`.
#[derive(Default)]
pub(crate) struct ExpectTable {
    entries: parking_lot::Mutex<HashMap<String, Vec<ExpectEntry>>>,
    seq: AtomicU64,
}

impl ExpectTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arms a handler under `key` for at most `timeout`.
    ///
    /// The timer task removes exactly its own entry when it fires
    /// (dropping the key once empty) and then runs `on_timeout`
    /// panic-contained.
    pub(crate) fn add(
        self: &Arc<Self>,
        service: &str,
        key: &str,
        handler: ExpectHandler,
        timeout: Duration,
        on_timeout: TimeoutHandler,
    ) {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(ExpectEntry { id, handler });

        let table = Arc::clone(self);
        let key = key.to_string();
        let service = service.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if table.remove_entry(&key, id) {
                run_contained(&service, "expect-timeout", on_timeout);
            }
        });
    }

    /// Consumes every handler armed under `key`.
    ///
    /// Dispatch calls this on a matching message; timers for consumed
    /// entries find nothing left and stay silent.
    pub(crate) fn take(&self, key: &str) -> Option<Vec<ExpectHandler>> {
        self.entries
            .lock()
            .remove(key)
            .map(|list| list.into_iter().map(|e| e.handler).collect())
    }

    /// Removes one entry by ID; `true` when it was still armed.
    fn remove_entry(&self, key: &str, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let Some(list) = entries.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| e.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(key);
        }
        removed
    }

    #[cfg(test)]
    fn armed(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, Vec::len)
    }
}

//! Counting gate used while draining.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Waits for a fixed number of completions, with a deadline.
///
/// Armed only for the duration of a drain: one unit per runtime that
/// was sent `command:stop`, one [`done_one`](Self::done_one) per
/// `state:stopped` ack.
#[derive(Clone)]
pub(crate) struct DrainGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    remaining: AtomicUsize,
    notify: Notify,
}

impl DrainGate {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                remaining: AtomicUsize::new(count),
                notify: Notify::new(),
            }),
        }
    }

    /// Records one completion; over-completion saturates at zero.
    pub(crate) fn done_one(&self) {
        let mut current = self.inner.remaining.load(Ordering::SeqCst);
        while current > 0 {
            match self.inner.remaining.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.inner.notify.notify_waiters();
                    }
                    return;
                }
                Err(seen) => current = seen,
            }
        }
    }

    /// Waits until the count reaches zero or `timeout` elapses.
    ///
    /// Returns `true` when fully drained.
    pub(crate) async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.remaining.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let notified = self.inner.notify.notified();
            if self.inner.remaining.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.remaining.load(Ordering::SeqCst) == 0;
            }
        }
    }
}

//! Panic containment for detached handler tasks.
//!
//! Every responder, transformer chain, expect handler and timeout
//! callback runs detached; a panic in one must never take the
//! supervisor down. Sync closures run under `catch_unwind`, async
//! handlers get a monitor task that logs the join error.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Spawns `fut` detached and logs if it panics.
pub(crate) fn spawn_contained<F>(service: &str, label: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let service = service.to_string();
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(err) = handle.await {
            if err.is_panic() {
                error!(service, task = label, "detached task panicked: {err}");
            }
        }
    });
}

/// Runs a sync closure, logging instead of unwinding on panic.
pub(crate) fn run_contained<F>(service: &str, label: &'static str, f: F)
where
    F: FnOnce(),
{
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(service, task = label, "handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_contained_swallows_panics() {
        run_contained("svc", "test", || panic!("boom"));
    }

    #[test]
    fn run_contained_runs_the_closure() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        run_contained("svc", "test", move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_contained_survives_a_panicking_task() {
        spawn_contained("svc", "test", async { panic!("boom") });
        // Give the monitor a chance to observe the panic; the test
        // passes by not propagating it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

//! Supervisor timing knobs.

use std::time::Duration;

/// Timeouts and retry budgets for one service.
///
/// The defaults are the production values; tests shrink them to keep
/// wall-clock time down.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// How long a driver gets to report `state:alive`.
    pub ready_timeout: Duration,
    /// Drain window granted to a replaced or unused runtime before its
    /// process is closed.
    pub graceful_timeout: Duration,
    /// Pause between crash-recovery attempts.
    pub retry_backoff: Duration,
    /// Crash-recovery attempts after the initial one.
    pub retry_count: u32,
    /// Upper bound on waiting for `state:stopped` acks during drain.
    pub drain_timeout: Duration,
    /// Ceiling on a synchronous RPC call.
    pub rpc_timeout: Duration,
    /// Interval of the driver-state gauge loop.
    pub metrics_interval: Duration,
    /// Settle time between loading required features and advancing to
    /// the discovery stage at boot.
    pub boot_settle: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            graceful_timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_secs(30),
            retry_count: 3,
            drain_timeout: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(60),
            boot_settle: Duration::from_secs(1),
        }
    }
}

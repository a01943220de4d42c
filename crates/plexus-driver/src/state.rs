//! Driver runtime states.

use serde::{Deserialize, Serialize};

/// State of one driver runtime.
///
/// | State | Meaning |
/// |-------|---------|
/// | `Loading` | process spawned, `state:alive` not yet seen |
/// | `Alive` | ready and serving |
/// | `Reloading` | hot reload in flight, waiting to re-confirm alive |
/// | `Failed` | crashed, write-broken, or missed its ready deadline |
/// | `Stopped` | acknowledged a graceful stop |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverState {
    /// Spawned, not yet confirmed alive.
    Loading,
    /// Confirmed alive and serving.
    Alive,
    /// Hot reload in flight.
    Reloading,
    /// Crashed or unresponsive.
    Failed,
    /// Gracefully stopped.
    Stopped,
}

impl DriverState {
    /// Returns `true` for states that no longer participate in
    /// dispatch or draining.
    #[must_use]
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Metric tag value for this state.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Alive => "alive",
            Self::Reloading => "reloading",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_states() {
        assert!(DriverState::Failed.is_down());
        assert!(DriverState::Stopped.is_down());
        assert!(!DriverState::Loading.is_down());
        assert!(!DriverState::Alive.is_down());
        assert!(!DriverState::Reloading.is_down());
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(DriverState::Alive.tag(), "alive");
        assert_eq!(DriverState::Loading.to_string(), "loading");
    }
}

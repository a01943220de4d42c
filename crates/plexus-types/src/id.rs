//! Identifier types for plexus.
//!
//! Runtime identity used to be a pointer comparison in older designs;
//! a UUID newtype makes the compare-and-delete idiom explicit and keeps
//! identities meaningful across log lines and serialized snapshots.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one driver runtime incarnation.
///
/// Every time a driver process is (re)started it gets a fresh
/// `RuntimeId`. The service supervisor uses the ID to decide whether a
/// slot in its feature table still refers to the incarnation an event
/// was observed on: a cold reload changes the ID, a hot reload keeps it.
///
/// # Example
///
/// ```
/// use plexus_types::RuntimeId;
///
/// let a = RuntimeId::new();
/// let b = RuntimeId::new();
/// assert_ne!(a, b);
/// assert_eq!(a, a.clone());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeId(Uuid);

impl RuntimeId {
    /// Creates a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RuntimeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough for log correlation.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

//! Driver metadata: how to launch a driver executable.

use crate::error::DriverError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Descriptor for a driver executable, taken from the staged config
/// value at `daemon.drivers.<driverName>`.
///
/// Metadata equality drives the reload decision: a changed descriptor
/// forces a cold reload, an unchanged one permits hot-reloading data
/// into the running process.
///
/// # Example
///
/// ```
/// use plexus_driver::DriverMeta;
/// use serde_json::json;
///
/// let meta = DriverMeta::from_value(&json!({
///     "name": "kv",
///     "executable": "/usr/libexec/plexus/kv-driver",
///     "arguments": ["--scope", "global"],
/// })).unwrap();
/// assert_eq!(meta.name, "kv");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverMeta {
    /// Driver name; also the third component of expect keys
    /// (`state:alive:<name>`).
    pub name: String,
    /// Path of the driver executable.
    pub executable: String,
    /// Arguments passed on launch.
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl DriverMeta {
    /// Deserializes metadata from a staged config value.
    ///
    /// Unknown keys are tolerated; the staged tree may carry
    /// deployment-specific extras this layer has no business reading.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::MetaInvalid`] when the value lacks the
    /// required shape.
    pub fn from_value(value: &Value) -> Result<Self, DriverError> {
        serde_json::from_value(value.clone()).map_err(DriverError::MetaInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_meta_parses() {
        let meta = DriverMeta::from_value(&json!({
            "name": "noop",
            "executable": "/bin/true",
        }))
        .unwrap();
        assert!(meta.arguments.is_empty());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let meta = DriverMeta::from_value(&json!({
            "name": "noop",
            "executable": "/bin/true",
            "packaging": "container",
        }))
        .unwrap();
        assert_eq!(meta.executable, "/bin/true");
    }

    #[test]
    fn missing_executable_is_invalid() {
        assert!(DriverMeta::from_value(&json!({"name": "noop"})).is_err());
    }

    #[test]
    fn equality_detects_changed_arguments() {
        let a = DriverMeta {
            name: "kv".into(),
            executable: "/bin/kv".into(),
            arguments: vec!["--scope".into(), "global".into()],
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.arguments.push("--verbose".into());
        assert_ne!(a, b);
    }
}

//! Driver and RPC layer errors.

use plexus_types::ErrorCode;
use plexus_wire::WireError;
use thiserror::Error;

/// Failure in the lifecycle of one driver runtime.
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | [`DriverError::Spawn`] | `DRIVER_SPAWN` | No |
/// | [`DriverError::MetaInvalid`] | `DRIVER_META_INVALID` | No |
/// | [`DriverError::Wire`] | `DRIVER_WIRE` | No |
/// | [`DriverError::ReadyTimeout`] | `DRIVER_READY_TIMEOUT` | Yes |
/// | [`DriverError::Terminated`] | `DRIVER_TERMINATED` | Yes |
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver executable could not be started.
    #[error("failed to spawn driver {name}")]
    Spawn {
        /// Driver name from its metadata.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The configured driver metadata does not describe an executable.
    #[error("invalid driver metadata: {0}")]
    MetaInvalid(#[source] serde_json::Error),

    /// A frame could not be written to or read from the driver.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The driver did not report `state:alive` within the deadline.
    #[error("driver {name} not ready in time")]
    ReadyTimeout {
        /// Driver name from its metadata.
        name: String,
    },

    /// The driver went away while being waited on.
    #[error("driver {name} terminated")]
    Terminated {
        /// Driver name from its metadata.
        name: String,
    },
}

impl ErrorCode for DriverError {
    fn code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "DRIVER_SPAWN",
            Self::MetaInvalid(_) => "DRIVER_META_INVALID",
            Self::Wire(_) => "DRIVER_WIRE",
            Self::ReadyTimeout { .. } => "DRIVER_READY_TIMEOUT",
            Self::Terminated { .. } => "DRIVER_TERMINATED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::ReadyTimeout { .. } | Self::Terminated { .. })
    }
}

/// Failure of one RPC exchange.
///
/// RPC errors surface to the caller and are never fatal to the
/// supervisor.
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | [`RpcError::Timeout`] | `RPC_TIMEOUT` | Yes |
/// | [`RpcError::Remote`] | `RPC_REMOTE` | No |
/// | [`RpcError::FeatureUnavailable`] | `RPC_FEATURE_UNAVAILABLE` | Yes |
/// | [`RpcError::Serialize`] | `RPC_SERIALIZE` | No |
/// | [`RpcError::Wire`] | `RPC_WIRE` | No |
/// | [`RpcError::Dropped`] | `RPC_DROPPED` | Yes |
#[derive(Debug, Error)]
pub enum RpcError {
    /// No return arrived within the configured ceiling.
    #[error("rpc call {rpc_id} timed out")]
    Timeout {
        /// Correlation ID of the expired call.
        rpc_id: String,
    },

    /// The callee reported an error.
    #[error("rpc call failed remotely: {0}")]
    Remote(String),

    /// The target feature has no loaded driver runtime.
    #[error("no stream for feature {0}")]
    FeatureUnavailable(String),

    /// Call parameters could not be encoded.
    #[error("failed to encode rpc params: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The call could not be written to the driver stream.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The pending call was abandoned before a return arrived.
    #[error("rpc call dropped before completion")]
    Dropped,
}

impl ErrorCode for RpcError {
    fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "RPC_TIMEOUT",
            Self::Remote(_) => "RPC_REMOTE",
            Self::FeatureUnavailable(_) => "RPC_FEATURE_UNAVAILABLE",
            Self::Serialize(_) => "RPC_SERIALIZE",
            Self::Wire(_) => "RPC_WIRE",
            Self::Dropped => "RPC_DROPPED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::FeatureUnavailable(_) | Self::Dropped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_types::assert_error_codes;

    #[test]
    fn driver_error_codes_valid() {
        let variants = vec![
            DriverError::Spawn {
                name: "x".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            },
            DriverError::MetaInvalid(
                serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
            ),
            DriverError::Wire(WireError::Truncated),
            DriverError::ReadyTimeout { name: "x".into() },
            DriverError::Terminated { name: "x".into() },
        ];
        assert_error_codes(&variants, "DRIVER_");
    }

    #[test]
    fn rpc_error_codes_valid() {
        let variants = vec![
            RpcError::Timeout {
                rpc_id: "1.1".into(),
            },
            RpcError::Remote("boom".into()),
            RpcError::FeatureUnavailable("kv".into()),
            RpcError::Serialize(serde_json::from_str::<serde_json::Value>("{").unwrap_err()),
            RpcError::Wire(WireError::Closed),
            RpcError::Dropped,
        ];
        assert_error_codes(&variants, "RPC_");
    }
}

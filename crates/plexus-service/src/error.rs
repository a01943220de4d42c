//! Service layer errors.

use crate::config::ConfigError;
use plexus_driver::DriverError;
use plexus_types::ErrorCode;
use thiserror::Error;

/// Failure while supervising a service's features.
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | [`ServiceError::FeatureNotLoaded`] | `SERVICE_FEATURE_NOT_LOADED` | Yes |
/// | [`ServiceError::FeatureUnresolved`] | `SERVICE_FEATURE_UNRESOLVED` | No |
/// | [`ServiceError::MetaMissing`] | `SERVICE_DRIVER_META_MISSING` | No |
/// | [`ServiceError::Driver`] | `SERVICE_DRIVER` | inherits |
/// | [`ServiceError::Config`] | `SERVICE_CONFIG` | inherits |
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A feature was addressed that has no loaded driver runtime.
    #[error("feature not loaded: {0}")]
    FeatureNotLoaded(String),

    /// No driver is mapped to the feature in staged config.
    #[error("no driver defined for feature {0}")]
    FeatureUnresolved(String),

    /// Staged config has no metadata for the mapped driver.
    #[error("missing driver metadata for {0}")]
    MetaMissing(String),

    /// A driver lifecycle operation failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The config collaborator rejected a staging step.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ErrorCode for ServiceError {
    fn code(&self) -> &'static str {
        match self {
            Self::FeatureNotLoaded(_) => "SERVICE_FEATURE_NOT_LOADED",
            Self::FeatureUnresolved(_) => "SERVICE_FEATURE_UNRESOLVED",
            Self::MetaMissing(_) => "SERVICE_DRIVER_META_MISSING",
            Self::Driver(_) => "SERVICE_DRIVER",
            Self::Config(_) => "SERVICE_CONFIG",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::FeatureNotLoaded(_) => true,
            Self::FeatureUnresolved(_) | Self::MetaMissing(_) => false,
            Self::Driver(inner) => inner.is_recoverable(),
            Self::Config(inner) => inner.is_recoverable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_types::assert_error_codes;

    #[test]
    fn all_error_codes_valid() {
        let variants = vec![
            ServiceError::FeatureNotLoaded("eventbus".into()),
            ServiceError::FeatureUnresolved("emitter".into()),
            ServiceError::MetaMissing("kv".into()),
            ServiceError::Driver(DriverError::ReadyTimeout { name: "kv".into() }),
            ServiceError::Config(ConfigError::Rollback),
        ];
        assert_error_codes(&variants, "SERVICE_");
    }

    #[test]
    fn recoverability_follows_the_inner_error() {
        assert!(ServiceError::Driver(DriverError::ReadyTimeout { name: "kv".into() })
            .is_recoverable());
        assert!(!ServiceError::FeatureUnresolved("emitter".into()).is_recoverable());
    }
}

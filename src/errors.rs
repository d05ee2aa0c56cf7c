//! Error utilities

use crate::key::InformerKey;
use std::fmt;

/// Error returned by `InformerRegistry::get_or_create`
#[non_exhaustive]
#[derive(Debug)]
pub enum RegistryError {
    /// Registry is shutting down and does not accept new informers
    Closed,
    /// Informer constructor failed; nothing was registered
    Construct {
        key: InformerKey,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// Key is already registered with an informer of another type
    TypeMismatch {
        key: InformerKey,
        expected: &'static str,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Closed => write!(f, "informer registry is shutting down"),
            RegistryError::Construct { key, .. } => {
                write!(f, "failed to construct informer for {}", key)
            }
            RegistryError::TypeMismatch { key, expected } => write!(
                f,
                "informer for {} is registered with a type other than {}",
                key, expected
            ),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Construct { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Describes error reason
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Closed,
    Construct,
    TypeMismatch,
    /// Catch-all variant. Since this enum is non-exhaustive,
    /// it should be handled with `_` pattern
    Unknown,
}

/// Tries to classify registry error, possibly wrapped in anyhow Error
pub fn classify(error: &anyhow::Error) -> ErrorClass {
    match error.downcast_ref::<RegistryError>() {
        Some(RegistryError::Closed) => ErrorClass::Closed,
        Some(RegistryError::Construct { .. }) => ErrorClass::Construct,
        Some(RegistryError::TypeMismatch { .. }) => ErrorClass::TypeMismatch,
        None => ErrorClass::Unknown,
    }
}

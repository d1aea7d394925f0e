//! Kernel error contract.
//!
//! # Responsibility
//! - Define the single error type returned by registry, handler and lifestyle
//!   operations.
//! - Preserve activator/proxy failures as the error source chain.
//!
//! # Invariants
//! - Factory failures are never swallowed; they surface as `Factory` with the
//!   original `ActivationError` as `source()`.
//! - Lock contention is not an error condition and has no variant here.

use crate::model::descriptor::RecordValidationError;
use crate::model::instance::ActivationError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type KernelResult<T> = Result<T, KernelError>;

/// Errors reported by the component kernel.
#[derive(Debug, Clone)]
pub enum KernelError {
    /// A component with this key is already registered.
    DuplicateKey(String),
    /// No component is registered under this key.
    NotFound(String),
    /// No handler exposes the requested service identifier.
    NoHandler(String),
    /// A handler exists but at least one required dependency is unsatisfied.
    HandlerNotValid { key: String, missing: Vec<String> },
    /// Completing the request would require a handler to resolve itself.
    CircularDependency { path: Vec<String> },
    /// A pooled component reached its bound (or waited out its timeout).
    PoolExhausted { key: String, max_size: usize },
    /// An activator or proxy hook failed while producing an instance.
    Factory {
        key: String,
        source: ActivationError,
    },
    /// The registration record failed declaration validation.
    InvalidRegistration(RecordValidationError),
    /// An explicitly scoped component was resolved outside any scope.
    ScopeNotActive { key: String },
    /// The resolved instance is not of the requested Rust type.
    TypeMismatch {
        service: String,
        expected: &'static str,
    },
    /// The registry has been disposed.
    Disposed,
}

impl Display for KernelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateKey(key) => write!(f, "component key already registered: {key}"),
            Self::NotFound(key) => write!(f, "component not found: {key}"),
            Self::NoHandler(service) => write!(f, "no component registered for service `{service}`"),
            Self::HandlerNotValid { key, missing } => write!(
                f,
                "component `{key}` is waiting for dependencies: {}",
                missing.join(", ")
            ),
            Self::CircularDependency { path } => {
                write!(f, "circular dependency detected: {}", path.join(" -> "))
            }
            Self::PoolExhausted { key, max_size } => {
                write!(f, "pool for component `{key}` exhausted (max_size={max_size})")
            }
            Self::Factory { key, source } => {
                write!(f, "failed to create component `{key}`: {source}")
            }
            Self::InvalidRegistration(err) => write!(f, "invalid registration: {err}"),
            Self::ScopeNotActive { key } => {
                write!(f, "component `{key}` requires an active scope on this thread")
            }
            Self::TypeMismatch { service, expected } => {
                write!(f, "instance resolved for `{service}` is not a `{expected}`")
            }
            Self::Disposed => write!(f, "registry has been disposed"),
        }
    }
}

impl Error for KernelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Factory { source, .. } => Some(source),
            Self::InvalidRegistration(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RecordValidationError> for KernelError {
    fn from(value: RecordValidationError) -> Self {
        Self::InvalidRegistration(value)
    }
}

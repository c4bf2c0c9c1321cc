//! Errors raised by registration and resolution

use trellis_intercept::InterceptError;
use trellis_reflect::{DynError, ReflectError};

pub type DiResult<T> = Result<T, DiError>;

/// Resolution and lifetime failures.
///
/// Everything here is fatal and surfaced to the caller; nothing is
/// silently corrected. [`DiError::ServiceNotRegistered`] is the one
/// variant `try_get_instance` converts to `None`: existence is the only
/// thing "try" concerns itself with, construction failures stay fatal.
#[derive(Debug, thiserror::Error)]
pub enum DiError {
    #[error("No registration found for service {service} (name: {name:?})")]
    ServiceNotRegistered { service: String, name: String },

    #[error("Unresolved dependency {dependency} required by {service} ({member})")]
    UnresolvedDependency {
        service: String,
        dependency: String,
        member: String,
    },

    #[error("Recursive dependency detected while resolving {service} (name: {name:?})")]
    RecursiveDependencyDetected { service: String, name: String },

    #[error("Type {implementing} has no public constructor")]
    NoPublicConstructor { implementing: String },

    #[error("Type {implementing} has no constructor whose parameters can all be resolved")]
    NoResolvableConstructor { implementing: String },

    #[error("Service {service} has a per-scope lifetime but no scope is active")]
    ScopedInstanceWithoutScope { service: String },

    #[error("Disposable service {service} requires an active scope to track its disposal")]
    DisposableInstanceWithoutScope { service: String },

    #[error("Cannot end a scope while a child scope is still active")]
    ScopeEndedWithLiveChild,

    #[error("Scope was not the innermost active scope when ended")]
    ScopeOutOfOrder,

    #[error("Unable to determine implementing type for service {service}")]
    UnableToDetermineImplementingType { service: String },

    #[error("{count} named registrations exist for {service} and no default; an unnamed lookup is ambiguous")]
    AmbiguousDefaultService { service: String, count: usize },

    #[error("Container was dropped while a deferred resolution was still pending")]
    ContainerUnavailable,

    #[error("Factory for service {service} failed")]
    FactoryFailed {
        service: String,
        #[source]
        source: DynError,
    },

    #[error("Constructor of {implementing} failed")]
    ConstructorFailed {
        implementing: String,
        #[source]
        source: DynError,
    },

    #[error("Failed to resolve {service} (name: {name:?})")]
    ResolutionFailed {
        service: String,
        name: String,
        #[source]
        source: Box<DiError>,
    },

    #[error(transparent)]
    Reflect(#[from] ReflectError),

    #[error(transparent)]
    Intercept(#[from] InterceptError),
}

impl DiError {
    /// The innermost error, unwrapping any [`DiError::ResolutionFailed`]
    /// context layers.
    pub fn root_cause(&self) -> &DiError {
        match self {
            DiError::ResolutionFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Wrap with the outer (service, name) the failure surfaced through,
    /// unless the error is the top-level "nothing registered" result,
    /// which stays unwrapped so `try_get_instance` can recognize it.
    pub(crate) fn in_context(self, service: String, name: &str) -> Self {
        match self {
            DiError::ServiceNotRegistered { .. } => self,
            other => DiError::ResolutionFailed {
                service,
                name: name.to_string(),
                source: Box::new(other),
            },
        }
    }
}

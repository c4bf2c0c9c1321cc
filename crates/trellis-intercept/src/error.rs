//! Errors raised by proxy synthesis and invocation

use trellis_reflect::DynError;

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    /// Proxy synthesis could not identify a usable target type or
    /// constructor shape. Synthesis is all-or-nothing; there is no
    /// recovery from this.
    #[error("Unable to determine implementing type for proxy target: {type_name}")]
    UnableToDetermineImplementingType { type_name: String },

    #[error("Type {type_name} has no method named {method}")]
    UnknownMethod { type_name: String, method: String },

    #[error("Method {method} takes {expected} argument(s), got {actual}")]
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("Method {method} is generic and requires type arguments")]
    MissingTypeArguments { method: String },

    #[error("Method {method} is not generic but type arguments were supplied")]
    UnexpectedTypeArguments { method: String },

    #[error("Proxy target is unavailable: {reason}")]
    TargetUnavailable { reason: String },

    #[error("Invocation of {method} failed")]
    InvocationFailed {
        method: String,
        #[source]
        source: DynError,
    },
}

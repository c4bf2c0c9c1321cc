//! Errors raised by the descriptor registry

/// Errors from descriptor registration, generic closing and downcasting.
#[derive(Debug, thiserror::Error)]
pub enum ReflectError {
    #[error("No descriptor registered for type: {type_name}")]
    UnknownType { type_name: String },

    #[error("Type {type_name} is not an open generic definition")]
    NotAGenericDefinition { type_name: String },

    #[error("Generic definition {type_name} takes {expected} argument(s), got {actual}")]
    GenericArityMismatch {
        type_name: String,
        expected: usize,
        actual: usize,
    },

    #[error(
        "Generic argument {argument} does not satisfy constraint {constraint} \
         of parameter {parameter} on {definition}"
    )]
    ConstraintViolation {
        definition: String,
        parameter: String,
        argument: String,
        constraint: String,
    },

    #[error("Instance downcast failed, expected {expected}")]
    DowncastFailed { expected: String },

    #[error("Constructor of {type_name} expected {expected} dependencies, got {actual}")]
    ConstructorArityMismatch {
        type_name: String,
        expected: usize,
        actual: usize,
    },
}

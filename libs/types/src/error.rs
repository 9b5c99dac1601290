//! Value conversion errors

use thiserror::Error;

/// Failure to read a typed value out of a [`crate::Value`] or [`crate::Args`]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    /// Value has a different runtime type than requested
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Positional argument is absent
    #[error("Missing positional argument {index} (got {available})")]
    MissingArgument { index: usize, available: usize },

    /// Named argument is absent
    #[error("Missing named argument '{key}'")]
    MissingNamed { key: String },

    /// Numeric value does not fit the requested type
    #[error("Value {value} out of range for {target}")]
    OutOfRange { value: String, target: &'static str },

    /// Unrecognised textual form (kind names, queue classes)
    #[error("Cannot parse '{input}' as {target}")]
    Parse { input: String, target: &'static str },
}

impl ValueError {
    pub fn mismatch(expected: &'static str, found: &'static str) -> Self {
        Self::TypeMismatch { expected, found }
    }

    pub fn out_of_range(value: impl ToString, target: &'static str) -> Self {
        Self::OutOfRange {
            value: value.to_string(),
            target,
        }
    }
}

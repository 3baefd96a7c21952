//! Error types for tune parameter translation.

use thiserror::Error;

use crate::types::NetworkStandard;

/// Errors raised while turning tune parameters into a locator and tuning space.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The tuning-space directory could not be searched.
    #[error("Tuning space lookup failed for {standard}: {reason}")]
    TuningSpaceLookup {
        standard: NetworkStandard,
        reason: String,
    },

    /// A new tuning space could not be created or registered.
    #[error("Failed to create tuning space '{name}': {reason}")]
    TuningSpaceCreate { name: String, reason: String },

    /// A parameter does not fit the locator field it maps to.
    #[error("Value {value} out of range for {field}")]
    FieldOutOfRange { field: &'static str, value: i64 },

    /// A configuration value is present but cannot be parsed.
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// The active tuning space belongs to another network standard.
    #[error("Tuning space '{name}' is {actual}, expected {expected}")]
    StandardMismatch {
        name: String,
        expected: NetworkStandard,
        actual: NetworkStandard,
    },
}

//! Error types and validation functions for HMM analysis.
//!
//! All configuration and data-shape problems are reported before any
//! computation starts; numerical degeneracy during a fit is recovered
//! locally and never surfaced through these types.

use thiserror::Error;

/// Error types for HMM fitting and statistical validation operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HmmAnalysisError {
    /// Insufficient data for the requested operation.
    #[error("Insufficient data: need at least {required} observations, got {actual}")]
    InsufficientData {
        /// Minimum required number of observations
        required: usize,
        /// Actual number of observations provided
        actual: usize,
    },

    /// Invalid parameter value in a configuration struct.
    #[error("Invalid parameter: {parameter} = {value}, expected {constraint}")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Invalid value provided
        value: f64,
        /// Valid range or constraint description
        constraint: String,
    },

    /// Two inputs disagree on a dimension that must match.
    #[error("Dimension mismatch: {what} expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Description of the mismatched dimension
        what: String,
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Numerical computation error that could not be recovered locally.
    #[error("Numerical computation failed: {reason}")]
    NumericalError {
        /// Detailed reason for the numerical failure
        reason: String,
        /// Operation that failed, when known
        operation: Option<String>,
    },

    /// Concurrent resource could not be acquired.
    #[error("Concurrent access failed: {resource}")]
    ConcurrencyError {
        /// Resource that couldn't be accessed
        resource: String,
    },
}

/// Result type for HMM analysis operations.
pub type HmmResult<T> = Result<T, HmmAnalysisError>;

/// Validates that a sequence has sufficient length for analysis.
///
/// # Example
/// ```rust
/// use hmm_analysis::errors::validate_data_length;
///
/// assert!(validate_data_length(3, 2, "test").is_ok());
/// assert!(validate_data_length(3, 5, "test").is_err());
/// ```
pub fn validate_data_length(actual: usize, min_required: usize, _operation: &str) -> HmmResult<()> {
    if actual < min_required {
        Err(HmmAnalysisError::InsufficientData {
            required: min_required,
            actual,
        })
    } else {
        Ok(())
    }
}

/// Validates that a count-like configuration parameter is at least `min`.
pub fn validate_count(value: usize, min: usize, name: &str) -> HmmResult<()> {
    if value < min {
        Err(HmmAnalysisError::InvalidParameter {
            parameter: name.to_string(),
            value: value as f64,
            constraint: format!(">= {}", min),
        })
    } else {
        Ok(())
    }
}

/// Validates that a parameter is finite and strictly positive.
///
/// Used for tolerances and regularization strengths, where zero or a NaN
/// would silently disable convergence checks or ridge protection.
pub fn validate_positive(value: f64, name: &str) -> HmmResult<()> {
    if !value.is_finite() || value <= 0.0 {
        Err(HmmAnalysisError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: "finite and > 0".to_string(),
        })
    } else {
        Ok(())
    }
}

/// Validates that all values in a slice are finite.
///
/// Returns immediately on the first non-finite value.
pub fn validate_all_finite(data: &[f64], name: &str) -> HmmResult<()> {
    if let Some((i, &value)) = data.iter().enumerate().find(|(_, &v)| !v.is_finite()) {
        return Err(HmmAnalysisError::NumericalError {
            reason: format!("{} contains non-finite value at index {}: {}", name, i, value),
            operation: None,
        });
    }
    Ok(())
}

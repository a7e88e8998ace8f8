//! Error types for constraint satisfaction.

use thiserror::Error;

use crate::ConstraintId;

/// Errors that can occur while administering or satisfying constraints.
///
/// Divergence is not represented here: a diverging frame is rolled back or
/// escalated and reported through [`crate::SatisfyReport`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SatisfyError {
    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A handle that does not refer to a live constraint.
    #[error("unknown constraint: {0}")]
    UnknownConstraint(ConstraintId),

    /// A constraint reported zero scalar equations.
    #[error("constraint {name} has zero dimension")]
    ZeroDimension {
        /// Name reported by the constraint.
        name: String,
    },

    /// A derivative block did not have the shape of its consumer and producer.
    #[error("derivative block has shape {actual:?}, expected {expected:?}")]
    BlockShape {
        /// Expected (rows, columns).
        expected: (usize, usize),
        /// Shape that was supplied.
        actual: (usize, usize),
    },

    /// A vector did not match the total constraint dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },
}

impl SatisfyError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type for satisfaction operations.
pub type Result<T> = std::result::Result<T, SatisfyError>;

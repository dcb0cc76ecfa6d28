//! Error types for oal-relax
//!
//! Every failure carries enough context (member index, atom counts, the
//! offending configuration key) to act on without a debugger.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// oal-relax error types
#[derive(Error, Debug)]
pub enum Error {
    /// Structure does not match the atom layout a member (or the run) expects
    #[error("Shape mismatch at {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Where the mismatch was detected (e.g. "member 2")
        context: String,
        /// Expected layout description
        expected: String,
        /// Actual layout description
        actual: String,
    },

    /// Oracle evaluation did not produce a usable result
    #[error("Oracle failure: {0}\nThe training set was left untouched; the driver may retry with a perturbed structure")]
    OracleFailure(String),

    /// A member's retraining produced invalid parameters
    #[error("Retrain divergence in member {member}: {reason}")]
    RetrainDivergence {
        /// Index of the member in the ensemble
        member: usize,
        /// What went wrong
        reason: String,
    },

    /// Invalid construction-time configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Provenance chain points across runs or at a missing record
    #[error("Provenance chain corruption: {0}\nAlready committed records remain valid")]
    ChainCorruption(String),

    /// Invalid argument to an operation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Provenance sink failed to commit a record
    #[error("Storage error: {0}")]
    StorageError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::ShapeMismatch`] from anything displayable.
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Attribute a member-level error to its position in the ensemble.
    ///
    /// Members do not know their own index, so they report
    /// [`Error::RetrainDivergence`] with `member: 0`; other variants pass
    /// through unchanged.
    #[must_use]
    pub fn for_member(self, index: usize) -> Self {
        match self {
            Self::RetrainDivergence { reason, .. } => Self::RetrainDivergence {
                member: index,
                reason,
            },
            other => other,
        }
    }

    /// Whether this error leaves the run in a usable state.
    ///
    /// Oracle failures and retrain divergence are recoverable; everything
    /// else should end the run.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::OracleFailure(_) | Self::RetrainDivergence { .. })
    }
}

//! Error taxonomy shared by the tree model and the rewrite passes.

use thiserror::Error;

/// Errors produced while editing or optimizing an RA tree.
///
/// `Unsupported` describes a query shape a rewrite cannot handle; the decorrelation
/// pass rolls the tree back before reporting it, so the tree stays valid and the
/// caller may choose to tolerate it. `InvariantViolation` means the tree itself is
/// malformed (an incomplete node, a marker without a join) and always aborts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizeError {
    #[error("unsupported construct in {rewrite}: {reason}")]
    Unsupported { rewrite: &'static str, reason: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl OptimizeError {
    pub fn unsupported(rewrite: &'static str, reason: impl Into<String>) -> Self {
        OptimizeError::Unsupported {
            rewrite,
            reason: reason.into(),
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        OptimizeError::InvariantViolation(reason.into())
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, OptimizeError::Unsupported { .. })
    }
}

pub type Result<T, E = OptimizeError> = std::result::Result<T, E>;

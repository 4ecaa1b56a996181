//! Crate-wide error type. Construction, verification and runtime failures
//! share one enum so callers can match on the failing stage.

use thiserror::Error;

use crate::qp::SolveStatus;

pub type DeepcResult<T> = Result<T, DeepcError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeepcError {
    /// A signal handed to the Hankel builder has an unusable length.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The input log cannot support prediction at the requested horizons.
    #[error("data is not persistently exciting: rank {rank} < {required}")]
    NotPersistentlyExciting { rank: usize, required: usize },

    /// Logs, bounds and declared dimensions disagree.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The assembled program failed its convexity / parameter-affinity checks.
    #[error("program invariant violated: {0}")]
    BuildInvariant(String),

    #[error("shape mismatch for `{name}`: expected {expected}, found {found}")]
    ShapeMismatch {
        name: &'static str,
        expected: String,
        found: String,
    },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("solve failed for scenario {scenario}: {status}")]
    SolveFailed { scenario: usize, status: SolveStatus },

    #[error("sensitivity system could not be factorised: {0}")]
    Sensitivity(String),
}

impl DeepcError {
    pub(crate) fn shape(name: &'static str, expected: (usize, usize), found: (usize, usize)) -> Self {
        DeepcError::ShapeMismatch {
            name,
            expected: format!("{}x{}", expected.0, expected.1),
            found: format!("{}x{}", found.0, found.1),
        }
    }

    /// Whether this error only concerns the current solve and leaves the controller usable.
    pub fn is_solve_failure(&self) -> bool {
        matches!(self, DeepcError::SolveFailed { .. })
    }
}

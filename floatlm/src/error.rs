//! Error taxonomy shared by all components of this crate.

use std::path::PathBuf;
use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An input stream or file violated its format contract: a record out of
    /// order, a truncated file, a metaparameters file with the wrong number
    /// of fields, or a float-count state whose mass invariant is broken.
    #[error("malformed input in {file}: {message}")]
    InputMalformed {
        /// File the offending record came from.
        file: PathBuf,
        /// What exactly was wrong, including the offending record if known.
        message: String,
    },
    /// A metaparameter vector outside the feasible region. The sigmoid
    /// reparameterization makes every optimizer point feasible by
    /// construction, so seeing this indicates an internal error.
    #[error("infeasible metaparameters (internal error): {0}")]
    InfeasibleMetaparameters(String),
    /// The optimizer could not make numerical progress even after resetting
    /// its inverse Hessian.
    #[error("numerical failure in {component}: {message}")]
    NumericalFailure {
        /// Component that failed, e.g. `bfgs`.
        component: &'static str,
        /// Details of the failure.
        message: String,
    },
    /// Temporary-file or sort-buffer trouble. Always fatal; no partial
    /// state is kept.
    #[error("resource failure: {0}")]
    ResourceFailure(String),
    /// The size-targeting controller ran past its iteration cap.
    #[error(
        "size targeting did not converge within {max_iterations} iterations; \
         rerun with a larger initial threshold"
    )]
    IterationBudgetExceeded {
        /// The configured iteration cap.
        max_iterations: usize,
    },
    /// Error from the underlying I/O layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shorthand for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convenience constructor for [`Error::InputMalformed`].
    pub fn malformed(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InputMalformed {
            file: file.into(),
            message: message.into(),
        }
    }
}

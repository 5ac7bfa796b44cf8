//! Error types for the group-lowering pass

use thiserror::Error;

/// Result type for lowering operations
pub type Result<T> = std::result::Result<T, LoweringError>;

/// Errors that can occur while lowering fusion regions
#[derive(Debug, Error)]
pub enum LoweringError {
    /// Malformed IR reached the pass: missing terminator, dangling shape
    /// source, empty cluster. Indicates a bug in an upstream stage and is
    /// never recovered.
    #[error("IR invariant violated: {0}")]
    InvariantViolation(String),

    /// The kernel backend could not produce a kernel for a group. Fatal to
    /// the pass invocation; no partial kernel is accepted and no retry is
    /// attempted here.
    #[error("kernel compilation failed for `{group}`: {reason}")]
    CompilationFailure { group: String, reason: String },

    #[error("graph error: {0}")]
    Graph(String),
}

// Graph-layer failures bubble up out of kiln-ir as anyhow errors.
impl From<anyhow::Error> for LoweringError {
    fn from(err: anyhow::Error) -> Self {
        LoweringError::Graph(err.to_string())
    }
}

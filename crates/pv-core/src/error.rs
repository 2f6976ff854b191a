//! # Error taxonomy
//!
//! Parser and dispatcher failures are deterministic and surface immediately.
//! Only [`StoreError`] is ever retried; once retries are exhausted it becomes
//! [`CoreError::StoreFailure`] with the collaborator's message untouched.

use thiserror::Error;

/// Result type used across pv-core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure raised by a store collaborator (registry or collection executor).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or timed out. Usually transient.
    #[error("{0}")]
    Unavailable(String),

    /// The store rejected the operation itself.
    #[error("{0}")]
    Operation(String),
}

/// Errors surfaced by the query layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A required input was absent or blank.
    #[error("missing parameters: {0}")]
    MissingParameters(String),

    /// An input was present but could not be interpreted.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Script does not start with the `db.` call prefix.
    #[error("invalid script format: {0}")]
    InvalidScriptFormat(String),

    /// No `db.<collection>.aggregate(` call could be found.
    #[error("invalid aggregation syntax: {0}")]
    InvalidAggregationSyntax(String),

    /// No bracketed pipeline array inside the aggregate call.
    #[error("invalid pipeline format: {0}")]
    InvalidPipelineFormat(String),

    /// The pipeline text failed both the strict and the repaired parse.
    #[error("invalid aggregation pipeline: {0}")]
    InvalidAggregationPipeline(String),

    /// Unknown (or disabled) stored query.
    #[error("stored query not found: {0}")]
    NotFound(String),

    /// Stored query carries an execution mode this build does not know.
    #[error("invalid execution mode: {0}")]
    InvalidExecutionMode(String),

    /// Store I/O failed on every retry attempt.
    #[error("{0}")]
    StoreFailure(String),
}

impl CoreError {
    /// True for failures caused by the caller's input or the stored query's
    /// content, false for store failures.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::StoreFailure(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        Self::StoreFailure(err.to_string())
    }
}

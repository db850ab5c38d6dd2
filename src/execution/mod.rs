//! Vectorized execution of query expressions.
//!
//! An expression is compiled by [`plan::new`] into a tree of
//! [`VectorOperator`]s. Each call to `next` on the root covers up to
//! `steps_batch` consecutive evaluation steps; callers pull until `next`
//! returns `None`.

pub mod aggregate;
pub mod concurrent;
pub mod function;
pub mod model;
pub mod options;
pub mod plan;
pub mod pool;
pub mod scan;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::storage::StorageError;

pub use model::{explain, StepVector, VectorOperator};
pub use options::QueryOptions;
pub use pool::VectorPool;

/// Error type for plan construction and execution
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Unsupported expression {0}")]
    UnsupportedExpression(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Unsupported aggregation: {0}")]
    UnsupportedAggregation(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Query cancelled")]
    Cancelled,
    #[error("Background producer failed: {0}")]
    Producer(String),
}

impl ExecutionError {
    /// Build-time errors: retrying the same expression fails the same way.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ExecutionError::UnsupportedExpression(_)
                | ExecutionError::UnknownFunction(_)
                | ExecutionError::NotImplemented(_)
                | ExecutionError::UnsupportedAggregation(_)
                | ExecutionError::InvalidArgument(_)
        )
    }
}

/// Result type for execution operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Fails with `Cancelled` once the token has been cancelled.
pub fn check_cancelled(ctx: &CancellationToken) -> ExecutionResult<()> {
    if ctx.is_cancelled() {
        return Err(ExecutionError::Cancelled);
    }
    Ok(())
}

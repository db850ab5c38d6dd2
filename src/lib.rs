//! vecql - a vectorized execution engine for PromQL-style queries
//!
//! Expressions are compiled into trees of operators that exchange batches
//! of step vectors, each batch covering several evaluation steps at once.

pub mod execution;
pub mod labels;
pub mod metrics;
pub mod query;
pub mod storage;

#[cfg(test)]
mod testutil;

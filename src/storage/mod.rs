//! Storage module for vecql
//! The read interface the engine pulls raw samples through, plus an in-memory implementation.

pub mod data;
pub mod memtable;

use async_trait::async_trait;
use thiserror::Error;

use crate::labels::Matcher;

pub use data::{DataError, FloatHistogram, HistogramBucket, Point, StoredSeries, Value};
pub use memtable::{MemTable, MemTableError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid time range: mint {0} > maxt {1}")]
    InvalidRange(i64, i64),
    #[error("Storage read failed: {0}")]
    ReadFailed(String),
}

/// A read handle producing raw series for a set of matchers over a time window.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Returns every series matching all `matchers`, restricted to points in
    /// `[mint, maxt]`. Series without points in the window are omitted.
    async fn select(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
    ) -> Result<Vec<StoredSeries>, StorageError>;
}

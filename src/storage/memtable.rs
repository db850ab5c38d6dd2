use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Queryable, StorageError};
use crate::labels::{Labels, Matcher};
use crate::storage::data::{validate_labels, DataError, Point, StoredSeries};

/// The in-memory table holding series points, keyed by label set.
pub struct MemTable {
    /// The data stored in the MemTable, organized by series labels
    data: Arc<RwLock<HashMap<Labels, Vec<Point>>>>,
    /// Number of points after which a flush is due
    capacity: usize,
    /// Current number of points in the MemTable
    size: Arc<RwLock<usize>>,
}

impl MemTable {
    /// Creates a new MemTable with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            size: Arc::new(RwLock::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts a point into the series identified by `labels`.
    /// Returns true if the MemTable has reached its capacity.
    pub async fn insert(&self, labels: &Labels, point: Point) -> Result<bool, MemTableError> {
        validate_labels(labels)?;

        let mut size = self.size.write().await;
        let mut data = self.data.write().await;

        let points = data.entry(labels.clone()).or_insert_with(Vec::new);
        if let Some(last) = points.last() {
            if point.t <= last.t {
                return Err(MemTableError::InvalidTimestampOrder);
            }
        }

        let t = point.t;
        points.push(point);
        *size += 1;

        debug!(
            "Inserted point into MemTable: series={}, timestamp={}, size={}/{}",
            labels, t, *size, self.capacity
        );

        Ok(*size >= self.capacity)
    }

    /// Inserts a run of float samples for one series.
    pub async fn insert_floats(
        &self,
        labels: &Labels,
        samples: impl IntoIterator<Item = (i64, f64)>,
    ) -> Result<bool, MemTableError> {
        let mut full = false;
        for (t, v) in samples {
            full = self.insert(labels, Point::float(t, v)).await?;
        }
        Ok(full)
    }

    /// Returns the current number of points
    pub async fn size(&self) -> usize {
        *self.size.read().await
    }

    pub async fn is_empty(&self) -> bool {
        *self.size.read().await == 0
    }

    /// Removes every series and returns the number of dropped points.
    pub async fn clear(&self) -> usize {
        let mut size = self.size.write().await;
        let mut data = self.data.write().await;
        data.clear();
        std::mem::replace(&mut *size, 0)
    }
}

#[async_trait]
impl Queryable for MemTable {
    async fn select(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
    ) -> Result<Vec<StoredSeries>, StorageError> {
        if mint > maxt {
            return Err(StorageError::InvalidRange(mint, maxt));
        }
        let data = self.data.read().await;
        let mut result: Vec<StoredSeries> = data
            .iter()
            .filter(|(labels, _)| matchers.iter().all(|m| m.matches_labels(labels)))
            .filter_map(|(labels, points)| {
                let start = points.partition_point(|p| p.t < mint);
                let end = points.partition_point(|p| p.t <= maxt);
                if start == end {
                    return None;
                }
                Some(StoredSeries {
                    labels: labels.clone(),
                    points: points[start..end].to_vec(),
                })
            })
            .collect();
        result.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(result)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemTableError {
    #[error("Invalid timestamp order")]
    InvalidTimestampOrder,
    #[error(transparent)]
    Data(#[from] DataError),
}

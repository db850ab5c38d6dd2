use serde::Serialize;
use thiserror::Error;

use crate::labels::{is_valid_label_name, Labels};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Invalid label name: {0}")]
    InvalidLabelName(String),
    #[error("Series must carry at least one label")]
    EmptySeries,
    #[error("Invalid histogram: {0}")]
    InvalidHistogram(String),
}

/// One bucket of a native histogram. Counts are per bucket, not cumulative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: f64,
}

/// A native histogram with explicit bucket boundaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FloatHistogram {
    pub count: f64,
    pub sum: f64,
    /// Sorted by upper bound, non-overlapping.
    pub buckets: Vec<HistogramBucket>,
}

impl FloatHistogram {
    /// Creates a histogram from buckets. The total count is derived from them.
    pub fn new(sum: f64, mut buckets: Vec<HistogramBucket>) -> Result<Self, DataError> {
        for b in &buckets {
            if b.lower > b.upper || b.count < 0.0 {
                return Err(DataError::InvalidHistogram(format!(
                    "bucket ({}, {}] with count {}",
                    b.lower, b.upper, b.count
                )));
            }
        }
        buckets.sort_by(|a, b| a.upper.total_cmp(&b.upper));
        let count = buckets.iter().map(|b| b.count).sum();
        Ok(Self { count, sum, buckets })
    }

    /// Adds `other` bucket by bucket. Buckets with the same bounds are merged.
    pub fn add(&mut self, other: &FloatHistogram) {
        self.count += other.count;
        self.sum += other.sum;
        for ob in &other.buckets {
            match self
                .buckets
                .iter_mut()
                .find(|b| b.lower == ob.lower && b.upper == ob.upper)
            {
                Some(b) => b.count += ob.count,
                None => self.buckets.push(*ob),
            }
        }
        self.buckets.sort_by(|a, b| a.upper.total_cmp(&b.upper));
    }

    pub fn scale(&mut self, factor: f64) {
        self.count *= factor;
        self.sum *= factor;
        for b in &mut self.buckets {
            b.count *= factor;
        }
    }

    /// Estimates the q-quantile by linear interpolation inside the bucket the
    /// rank falls into.
    pub fn quantile(&self, q: f64) -> f64 {
        if q.is_nan() {
            return f64::NAN;
        }
        if q < 0.0 {
            return f64::NEG_INFINITY;
        }
        if q > 1.0 {
            return f64::INFINITY;
        }
        if self.count == 0.0 || self.buckets.is_empty() {
            return f64::NAN;
        }

        let rank = q * self.count;
        let mut cumulative = 0.0;
        for b in &self.buckets {
            if b.count == 0.0 {
                continue;
            }
            let before = cumulative;
            cumulative += b.count;
            if cumulative >= rank {
                if b.lower.is_infinite() {
                    return b.upper;
                }
                if b.upper.is_infinite() {
                    return b.lower;
                }
                return b.lower + (b.upper - b.lower) * ((rank - before) / b.count);
            }
        }
        self.buckets.last().map_or(f64::NAN, |b| b.upper)
    }
}

/// The value carried by one stored point.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Histogram(FloatHistogram),
}

/// A single timestamped point of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Timestamp in milliseconds since epoch
    pub t: i64,
    pub value: Value,
}

impl Point {
    pub fn float(t: i64, v: f64) -> Self {
        Self {
            t,
            value: Value::Float(v),
        }
    }

    pub fn histogram(t: i64, h: FloatHistogram) -> Self {
        Self {
            t,
            value: Value::Histogram(h),
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match &self.value {
            Value::Float(v) => Some(*v),
            Value::Histogram(_) => None,
        }
    }
}

/// A series returned by a storage select: its labels plus time-ordered points.
#[derive(Debug, Clone)]
pub struct StoredSeries {
    pub labels: Labels,
    pub points: Vec<Point>,
}

/// Checks that a label set can be stored.
pub fn validate_labels(labels: &Labels) -> Result<(), DataError> {
    if labels.is_empty() {
        return Err(DataError::EmptySeries);
    }
    for l in labels.iter() {
        if !is_valid_label_name(&l.name) {
            return Err(DataError::InvalidLabelName(l.name.clone()));
        }
    }
    Ok(())
}

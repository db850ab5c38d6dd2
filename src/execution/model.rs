use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::pool::VectorPool;
use super::ExecutionResult;
use crate::labels::Labels;
use crate::storage::FloatHistogram;

/// Samples of one evaluation step. Sample IDs index into the series array of
/// the operator that emitted the vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepVector {
    /// Step timestamp in milliseconds
    pub t: i64,
    pub sample_ids: Vec<u64>,
    pub samples: Vec<f64>,
    pub histogram_ids: Vec<u64>,
    pub histograms: Vec<FloatHistogram>,
}

impl StepVector {
    pub fn new(t: i64) -> Self {
        Self {
            t,
            ..Default::default()
        }
    }

    pub fn with_capacity(t: i64, capacity: usize) -> Self {
        Self {
            t,
            sample_ids: Vec::with_capacity(capacity),
            samples: Vec::with_capacity(capacity),
            histogram_ids: Vec::new(),
            histograms: Vec::new(),
        }
    }

    pub fn append_sample(&mut self, id: u64, v: f64) {
        self.sample_ids.push(id);
        self.samples.push(v);
    }

    pub fn append_histogram(&mut self, id: u64, h: FloatHistogram) {
        self.histogram_ids.push(id);
        self.histograms.push(h);
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.histograms.is_empty()
    }

    /// Empties the vector, keeping its allocations.
    pub fn clear(&mut self) {
        self.sample_ids.clear();
        self.samples.clear();
        self.histogram_ids.clear();
        self.histograms.clear();
    }

    /// Replaces every float sample with `f(value)` in place. Samples for which
    /// `f` returns `None` are removed by compacting the remaining ones.
    pub fn map_samples(&mut self, mut f: impl FnMut(f64) -> Option<f64>) {
        let mut kept = 0;
        for i in 0..self.samples.len() {
            if let Some(v) = f(self.samples[i]) {
                self.samples[kept] = v;
                self.sample_ids[kept] = self.sample_ids[i];
                kept += 1;
            }
        }
        self.samples.truncate(kept);
        self.sample_ids.truncate(kept);
    }

    /// Converts every histogram sample into a float sample with the same ID.
    /// All histograms are removed; only those for which `f` returns a value
    /// come back as floats.
    pub fn map_histograms(&mut self, mut f: impl FnMut(&FloatHistogram) -> Option<f64>) {
        let mut ids = std::mem::take(&mut self.histogram_ids);
        let mut histograms = std::mem::take(&mut self.histograms);
        for (id, h) in ids.drain(..).zip(histograms.drain(..)) {
            if let Some(v) = f(&h) {
                self.append_sample(id, v);
            }
        }
        self.histogram_ids = ids;
        self.histograms = histograms;
    }
}

/// The pull protocol shared by every node of an execution plan.
#[async_trait]
pub trait VectorOperator: Send + Sync {
    /// Returns the next batch of up to `steps_batch` step vectors, or `None`
    /// once every step has been produced. A returned batch always holds at
    /// least one step vector; the step vectors themselves may be empty.
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>>;

    /// Returns the labels of every series this operator can emit. Computed on
    /// first call; later calls return the same array.
    async fn series(&self, ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>>;

    /// The pool that buffers returned by `next` should be handed back to.
    fn pool(&self) -> Arc<VectorPool>;

    /// Describes this node and returns its children.
    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>);
}

/// Renders an operator tree, one node per line.
pub fn explain(op: &dyn VectorOperator) -> String {
    let mut out = String::new();
    explain_into(op, 0, &mut out);
    out
}

fn explain_into(op: &dyn VectorOperator, depth: usize, out: &mut String) {
    let (me, children) = op.explain();
    let _ = writeln!(out, "{}{}", "  ".repeat(depth), me);
    for child in children {
        explain_into(child.as_ref(), depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HistogramBucket;

    fn histogram(count: f64) -> FloatHistogram {
        FloatHistogram::new(
            count,
            vec![HistogramBucket {
                lower: 0.0,
                upper: 1.0,
                count,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_map_samples_compacts_in_place() {
        let mut sv = StepVector::new(0);
        for (id, v) in [(0, 1.0), (1, -2.0), (2, 3.0), (3, -4.0)] {
            sv.append_sample(id, v);
        }
        let capacity = sv.samples.capacity();

        sv.map_samples(|v| if v > 0.0 { Some(v * 10.0) } else { None });

        assert_eq!(sv.sample_ids, vec![0, 2]);
        assert_eq!(sv.samples, vec![10.0, 30.0]);
        assert_eq!(sv.samples.capacity(), capacity);
    }

    #[test]
    fn test_map_histograms_produces_floats() {
        let mut sv = StepVector::new(0);
        sv.append_sample(0, 1.0);
        sv.append_histogram(1, histogram(4.0));
        sv.append_histogram(2, histogram(0.0));

        sv.map_histograms(|h| if h.count > 0.0 { Some(h.count) } else { None });

        assert!(sv.histograms.is_empty());
        assert!(sv.histogram_ids.is_empty());
        assert_eq!(sv.sample_ids, vec![0, 1]);
        assert_eq!(sv.samples, vec![1.0, 4.0]);
    }

    #[test]
    fn test_clear_keeps_timestamp() {
        let mut sv = StepVector::new(42);
        sv.append_sample(0, 1.0);
        sv.clear();
        assert!(sv.is_empty());
        assert_eq!(sv.t, 42);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionError, ExecutionResult};
use crate::labels::{Labels, BUCKET_LABEL, METRIC_NAME};

/// `histogram_quantile(q, v)` over classic `le` bucket series and native
/// histograms.
pub struct HistogramOperator {
    scalar_op: Arc<dyn VectorOperator>,
    vector_op: Arc<dyn VectorOperator>,
    pool: Arc<VectorPool>,
    table: OnceCell<HistogramTable>,
    state: Mutex<HistogramState>,
}

struct HistogramTable {
    series: Arc<[Labels]>,
    /// For every input series, its output series and bucket upper bound.
    /// Series without an `le` label only contribute native histograms;
    /// series with an unparsable `le` are ignored.
    inputs: Vec<Option<(usize, Option<f64>)>>,
}

#[derive(Default)]
struct HistogramState {
    /// Classic buckets of each output series at the current step, as (upper bound, cumulative count)
    buckets: Vec<Vec<(f64, f64)>>,
    native: Vec<Option<f64>>,
}

impl HistogramOperator {
    pub fn new(scalar_op: Arc<dyn VectorOperator>, vector_op: Arc<dyn VectorOperator>, steps_batch: usize) -> Self {
        Self {
            scalar_op,
            vector_op,
            pool: Arc::new(VectorPool::new(steps_batch)),
            table: OnceCell::new(),
            state: Mutex::new(HistogramState::default()),
        }
    }

    async fn table(&self, ctx: &CancellationToken) -> ExecutionResult<&HistogramTable> {
        self.table
            .get_or_try_init(|| async {
                let input = self.vector_op.series(ctx).await?;
                let mut index: HashMap<Labels, usize> = HashMap::new();
                let mut outputs = Vec::new();
                let mut inputs = Vec::with_capacity(input.len());
                for labels in input.iter() {
                    let upper = match labels.get(BUCKET_LABEL) {
                        None => None,
                        Some(le) => match le.parse::<f64>() {
                            Ok(upper) => Some(upper),
                            Err(_) => {
                                debug!(le, "ignoring bucket with invalid upper bound");
                                inputs.push(None);
                                continue;
                            }
                        },
                    };
                    let base = labels.without(&[BUCKET_LABEL, METRIC_NAME]);
                    let next_id = outputs.len();
                    let out = *index.entry(base.clone()).or_insert_with(|| {
                        outputs.push(base);
                        next_id
                    });
                    inputs.push(Some((out, upper)));
                }
                self.pool.set_step_size(outputs.len());
                Ok::<_, ExecutionError>(HistogramTable {
                    series: Arc::from(outputs),
                    inputs,
                })
            })
            .await
    }
}

#[async_trait]
impl VectorOperator for HistogramOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        let table = self.table(ctx).await?;

        let Some(mut input) = self.vector_op.next(ctx).await? else {
            return Ok(None);
        };
        let mut quantiles = vec![f64::NAN; input.len()];
        if let Some(scalars) = self.scalar_op.next(ctx).await? {
            for (q, sv) in quantiles.iter_mut().zip(&scalars) {
                if let Some(v) = sv.samples.first() {
                    *q = *v;
                }
            }
            self.scalar_op.pool().put_vectors(scalars);
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let num_outputs = table.series.len();
        state.buckets.resize_with(num_outputs, Vec::new);
        state.native.resize(num_outputs, None);

        let input_pool = self.vector_op.pool();
        let mut batch = self.pool.get_vector_batch();
        for (sv, q) in input.drain(..).zip(quantiles) {
            for b in state.buckets.iter_mut() {
                b.clear();
            }
            state.native.fill(None);

            for (id, v) in sv.sample_ids.iter().zip(&sv.samples) {
                if let Some((out, Some(upper))) = table.inputs[*id as usize] {
                    state.buckets[out].push((upper, *v));
                }
            }
            for (id, h) in sv.histogram_ids.iter().zip(&sv.histograms) {
                if let Some((out, _)) = table.inputs[*id as usize] {
                    state.native[out] = Some(h.quantile(q));
                }
            }

            let mut out = self.pool.get_step_vector(sv.t);
            for (i, (buckets, native)) in state.buckets.iter_mut().zip(&state.native).enumerate() {
                match native {
                    Some(v) => out.append_sample(i as u64, *v),
                    None if !buckets.is_empty() => out.append_sample(i as u64, bucket_quantile(q, buckets)),
                    None => {}
                }
            }
            batch.push(out);
            input_pool.put_step_vector(sv);
        }
        input_pool.put_vectors(input);
        Ok(Some(batch))
    }

    async fn series(&self, ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        Ok(Arc::clone(&self.table(ctx).await?.series))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        (
            "[*histogramOperator] histogram_quantile".to_string(),
            vec![Arc::clone(&self.scalar_op), Arc::clone(&self.vector_op)],
        )
    }
}

/// Quantile of a classic histogram given as (upper bound, cumulative count)
/// pairs, interpolating linearly inside the bucket the rank falls into.
fn bucket_quantile(q: f64, buckets: &mut Vec<(f64, f64)>) -> f64 {
    if q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
    match buckets.last() {
        Some((upper, _)) if *upper == f64::INFINITY => {}
        _ => return f64::NAN,
    }

    // Buckets with the same bound are summed.
    buckets.dedup_by(|cur, prev| {
        if cur.0 == prev.0 {
            prev.1 += cur.1;
            true
        } else {
            false
        }
    });
    // Cumulative counts can only grow.
    let mut max = f64::NEG_INFINITY;
    for b in buckets.iter_mut() {
        if b.1 < max {
            b.1 = max;
        } else {
            max = b.1;
        }
    }

    let n = buckets.len();
    if n < 2 {
        return f64::NAN;
    }
    let observations = buckets[n - 1].1;
    if observations == 0.0 {
        return f64::NAN;
    }

    let mut rank = q * observations;
    let b = buckets.partition_point(|(_, count)| *count < rank);
    if b == n - 1 {
        return buckets[n - 2].0;
    }
    if b == 0 && buckets[0].0 <= 0.0 {
        return buckets[0].0;
    }

    let (bucket_end, mut count) = (buckets[b].0, buckets[b].1);
    let mut bucket_start = 0.0;
    if b > 0 {
        bucket_start = buckets[b - 1].0;
        count -= buckets[b - 1].1;
        rank -= buckets[b - 1].1;
    }
    bucket_start + (bucket_end - bucket_start) * (rank / count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scan::NumberLiteralOperator;
    use crate::execution::QueryOptions;
    use crate::storage::{FloatHistogram, HistogramBucket};
    use crate::testutil::{collect, step, MockOperator};
    use std::time::Duration;

    fn bucket_series(le: &str, instance: &str) -> Labels {
        Labels::from_pairs([("__name__", "latency_bucket"), ("le", le), ("instance", instance)])
    }

    #[test]
    fn test_bucket_quantile() {
        let mut buckets = vec![(1.0, 10.0), (f64::INFINITY, 20.0), (0.5, 5.0)];
        assert_eq!(bucket_quantile(0.5, &mut buckets), 1.0);

        let mut buckets = vec![(1.0, 10.0), (2.0, 20.0), (f64::INFINITY, 20.0)];
        assert_eq!(bucket_quantile(0.75, &mut buckets), 1.5);
        // The rank lands in the +Inf bucket: the highest finite bound is returned.
        let mut buckets = vec![(1.0, 10.0), (f64::INFINITY, 20.0)];
        assert_eq!(bucket_quantile(0.9, &mut buckets), 1.0);

        let mut no_inf = vec![(1.0, 10.0), (2.0, 20.0)];
        assert!(bucket_quantile(0.5, &mut no_inf).is_nan());
        let mut one = vec![(1.0, 10.0), (f64::INFINITY, 20.0)];
        assert_eq!(bucket_quantile(-1.0, &mut one), f64::NEG_INFINITY);
    }

    #[test]
    fn test_non_monotonic_buckets_are_fixed() {
        let mut buckets = vec![(1.0, 10.0), (2.0, 8.0), (4.0, 20.0), (f64::INFINITY, 20.0)];
        // 2.0 is raised to 10, so rank 15 falls in (2, 4].
        assert_eq!(bucket_quantile(0.75, &mut buckets), 3.0);
    }

    #[tokio::test]
    async fn test_classic_histogram_quantile() {
        let series = vec![
            bucket_series("1", "a"),
            bucket_series("2", "a"),
            bucket_series("+Inf", "a"),
            bucket_series("1", "b"),
            bucket_series("+Inf", "b"),
            bucket_series("bogus", "b"),
        ];
        let mock = MockOperator::new(
            series,
            vec![vec![step(0, &[(0, 10.0), (1, 20.0), (2, 20.0), (3, 4.0), (4, 4.0), (5, 1.0)])]],
        );
        let opts = QueryOptions::new(0, 0, Duration::ZERO);
        let q = Arc::new(NumberLiteralOperator::new(0.75, &opts));
        let op = HistogramOperator::new(q, mock, 10);
        let ctx = CancellationToken::new();

        let out_series = op.series(&ctx).await.unwrap();
        assert_eq!(
            &*out_series,
            &[Labels::from_pairs([("instance", "a")]), Labels::from_pairs([("instance", "b")])]
        );

        let steps = collect(&op).await.unwrap();
        assert_eq!(steps[0].sample_ids, vec![0, 1]);
        assert_eq!(steps[0].samples, vec![1.5, 0.75]);
    }

    #[tokio::test]
    async fn test_native_histogram_quantile() {
        let h = FloatHistogram::new(
            0.0,
            vec![HistogramBucket {
                lower: 0.0,
                upper: 10.0,
                count: 4.0,
            }],
        )
        .unwrap();
        let mut sv = StepVector::new(0);
        sv.append_histogram(0, h);
        let mock = MockOperator::new(vec![Labels::from_pairs([("__name__", "latency")])], vec![vec![sv]]);
        let opts = QueryOptions::new(0, 0, Duration::ZERO);
        let q = Arc::new(NumberLiteralOperator::new(0.5, &opts));
        let op = HistogramOperator::new(q, mock, 10);

        let steps = collect(&op).await.unwrap();
        assert_eq!(steps[0].samples, vec![5.0]);
        assert!(steps[0].histograms.is_empty());
    }
}

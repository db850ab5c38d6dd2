//! Reduction of the series dimension by a group key.

mod accumulator;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::accumulator::Accumulator;
use super::model::{StepVector, VectorOperator};
use super::pool::VectorPool;
use super::{check_cancelled, ExecutionError, ExecutionResult};
use crate::labels::{Labels, METRIC_NAME};
use crate::metrics;
use crate::query::ast::AggregateOp;

/// Aggregates the samples of each step by the labels in `grouping` (`by`),
/// or by every other label (`without`).
pub struct AggregateOperator {
    next: Arc<dyn VectorOperator>,
    /// Scalar parameter of topk, bottomk and quantile
    param: Option<Arc<dyn VectorOperator>>,
    op: AggregateOp,
    without: bool,
    grouping: Vec<String>,
    pool: Arc<VectorPool>,
    table: OnceCell<GroupTable>,
    accumulators: Mutex<Vec<Accumulator>>,
}

struct GroupTable {
    series: Arc<[Labels]>,
    /// Group index of every input series, by input sample ID.
    groups: Vec<usize>,
}

impl AggregateOperator {
    pub fn new(
        next: Arc<dyn VectorOperator>,
        param: Option<Arc<dyn VectorOperator>>,
        op: AggregateOp,
        without: bool,
        grouping: Vec<String>,
        steps_batch: usize,
    ) -> ExecutionResult<Self> {
        if Accumulator::new(op).is_none() {
            return Err(ExecutionError::UnsupportedAggregation(op.name().to_string()));
        }
        if op.takes_param() && param.is_none() {
            return Err(ExecutionError::InvalidArgument(format!(
                "{} requires a parameter",
                op.name()
            )));
        }
        Ok(Self {
            next,
            param,
            op,
            without,
            grouping,
            pool: Arc::new(VectorPool::new(steps_batch)),
            table: OnceCell::new(),
            accumulators: Mutex::new(Vec::new()),
        })
    }

    fn selects_series(&self) -> bool {
        matches!(self.op, AggregateOp::Topk | AggregateOp::Bottomk)
    }

    fn group_key(&self, labels: &Labels) -> Labels {
        if self.without {
            let mut drop: Vec<&str> = self.grouping.iter().map(String::as_str).collect();
            drop.push(METRIC_NAME);
            labels.without(&drop)
        } else {
            labels.keep(&self.grouping)
        }
    }

    async fn table(&self, ctx: &CancellationToken) -> ExecutionResult<&GroupTable> {
        self.table
            .get_or_try_init(|| async {
                let input = self.next.series(ctx).await?;

                let mut index: HashMap<Labels, usize> = HashMap::new();
                let mut keys = Vec::new();
                let mut groups = Vec::with_capacity(input.len());
                for labels in input.iter() {
                    let key = self.group_key(labels);
                    let next_id = keys.len();
                    let id = *index.entry(key.clone()).or_insert_with(|| {
                        keys.push(key);
                        next_id
                    });
                    groups.push(id);
                }
                debug!(
                    op = self.op.name(),
                    input = input.len(),
                    groups = keys.len(),
                    "built aggregation groups"
                );

                let series: Arc<[Labels]> = if self.selects_series() {
                    Arc::clone(&input)
                } else {
                    Arc::from(keys)
                };
                self.pool.set_step_size(series.len());
                Ok::<_, ExecutionError>(GroupTable { series, groups })
            })
            .await
    }

    /// Pulls one batch of the parameter operator and returns its value per step.
    async fn param_values(&self, ctx: &CancellationToken, steps: usize) -> ExecutionResult<Vec<f64>> {
        let mut values = vec![f64::NAN; steps];
        let Some(param) = &self.param else {
            return Ok(values);
        };
        if let Some(batch) = param.next(ctx).await? {
            for (value, sv) in values.iter_mut().zip(&batch) {
                if let Some(v) = sv.samples.first() {
                    *value = *v;
                }
            }
            param.pool().put_vectors(batch);
        }
        Ok(values)
    }
}

#[async_trait]
impl VectorOperator for AggregateOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        let table = self.table(ctx).await?;

        let Some(mut input) = self.next.next(ctx).await? else {
            return Ok(None);
        };
        let params = self.param_values(ctx, input.len()).await?;

        let mut accumulators = self.accumulators.lock().await;
        if accumulators.is_empty() {
            let num_groups = table.groups.iter().max().map_or(0, |m| m + 1);
            let Some(acc) = Accumulator::new(self.op) else {
                return Err(ExecutionError::UnsupportedAggregation(self.op.name().to_string()));
            };
            *accumulators = vec![acc; num_groups];
        }

        let input_pool = self.next.pool();
        let mut batch = self.pool.get_vector_batch();
        for (sv, param) in input.drain(..).zip(params) {
            for acc in accumulators.iter_mut() {
                acc.reset();
            }
            for (id, v) in sv.sample_ids.iter().zip(&sv.samples) {
                accumulators[table.groups[*id as usize]].add(*id, *v);
            }
            for (id, h) in sv.histogram_ids.iter().zip(&sv.histograms) {
                accumulators[table.groups[*id as usize]].add_histogram(h);
            }

            let mut out = self.pool.get_step_vector(sv.t);
            for (group_id, acc) in accumulators.iter_mut().enumerate() {
                acc.emit(group_id as u64, param, &mut out);
            }
            batch.push(out);
            input_pool.put_step_vector(sv);
        }
        input_pool.put_vectors(input);

        metrics::record_batch("aggregate", batch.len());
        Ok(Some(batch))
    }

    async fn series(&self, ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        Ok(Arc::clone(&self.table(ctx).await?.series))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        let kw = if self.without { "without" } else { "by" };
        let mut children = vec![Arc::clone(&self.next)];
        if let Some(param) = &self.param {
            children.push(Arc::clone(param));
        }
        (
            format!("[*aggregate] {} {} ({})", self.op.name(), kw, self.grouping.join(", ")),
            children,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scan::{NumberLiteralOperator, VectorSelectorOperator};
    use crate::execution::QueryOptions;
    use crate::labels::Matcher;
    use crate::testutil::{collect, fixture, step, MockOperator};
    use std::collections::HashSet;
    use std::time::Duration;

    fn input_series() -> Vec<Labels> {
        vec![
            Labels::from_pairs([("__name__", "m"), ("job", "api"), ("instance", "a")]),
            Labels::from_pairs([("__name__", "m"), ("job", "api"), ("instance", "b")]),
            Labels::from_pairs([("__name__", "m"), ("job", "db"), ("instance", "c")]),
        ]
    }

    fn aggregate(op: AggregateOp, without: bool, grouping: &[&str], mock: Arc<MockOperator>) -> AggregateOperator {
        AggregateOperator::new(
            mock,
            None,
            op,
            without,
            grouping.iter().map(|s| s.to_string()).collect(),
            10,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sum_by_job() {
        let mock = MockOperator::new(
            input_series(),
            vec![vec![
                step(0, &[(0, 1.0), (1, 2.0), (2, 4.0)]),
                step(1000, &[(1, 3.0), (2, 5.0)]),
            ]],
        );
        let op = aggregate(AggregateOp::Sum, false, &["job"], mock);
        let ctx = CancellationToken::new();

        let series = op.series(&ctx).await.unwrap();
        assert_eq!(
            &*series,
            &[Labels::from_pairs([("job", "api")]), Labels::from_pairs([("job", "db")])]
        );

        let steps = collect(&op).await.unwrap();
        assert_eq!(steps[0].sample_ids, vec![0, 1]);
        assert_eq!(steps[0].samples, vec![3.0, 4.0]);
        assert_eq!(steps[1].samples, vec![3.0, 5.0]);
    }

    #[tokio::test]
    async fn test_without_drops_metric_name() {
        let mock = MockOperator::new(input_series(), vec![vec![step(0, &[(0, 1.0), (1, 2.0), (2, 4.0)])]]);
        let op = aggregate(AggregateOp::Count, true, &["instance"], mock);
        let ctx = CancellationToken::new();

        let series = op.series(&ctx).await.unwrap();
        assert_eq!(series.len(), 2);
        assert!(series.iter().all(|l| l.get("__name__").is_none()));
        let steps = collect(&op).await.unwrap();
        assert_eq!(steps[0].samples, vec![2.0, 1.0]);
    }

    #[tokio::test]
    async fn test_group_keys_match_input_groups() {
        let storage = fixture().await;
        let opts = QueryOptions::new(0, 60_000, Duration::from_secs(20)).with_steps_batch(2);
        let selector = Arc::new(VectorSelectorOperator::new(
            storage,
            vec![Matcher::equal("__name__", "http_requests_total")],
            &opts,
        ));
        let op = AggregateOperator::new(selector, None, AggregateOp::Sum, false, vec!["job".into()], 2).unwrap();
        let ctx = CancellationToken::new();

        let series = op.series(&ctx).await.unwrap();
        let jobs: HashSet<_> = series.iter().map(|l| l.get("job").unwrap().to_string()).collect();
        assert_eq!(jobs, HashSet::from(["api".to_string(), "db".to_string()]));

        let steps = collect(&op).await.unwrap();
        assert_eq!(steps.len(), 4);
        for sv in &steps {
            let i = (sv.t / 10_000) as f64;
            for (id, v) in sv.sample_ids.iter().zip(&sv.samples) {
                let expected = if series[*id as usize].get("job") == Some("api") { 3.0 * i } else { 4.0 * i };
                assert_eq!(*v, expected);
            }
        }
    }

    #[tokio::test]
    async fn test_topk_keeps_input_series() {
        let mock = MockOperator::new(input_series(), vec![vec![step(0, &[(0, 1.0), (1, 2.0), (2, 4.0)])]]);
        let opts = QueryOptions::new(0, 0, Duration::ZERO);
        let k = Arc::new(NumberLiteralOperator::new(1.0, &opts));
        let op = AggregateOperator::new(mock, Some(k), AggregateOp::Topk, false, vec!["job".into()], 10).unwrap();
        let ctx = CancellationToken::new();

        assert_eq!(op.series(&ctx).await.unwrap().len(), 3);
        let steps = collect(&op).await.unwrap();
        assert_eq!(steps[0].sample_ids, vec![1, 2]);
        assert_eq!(steps[0].samples, vec![2.0, 4.0]);
    }

    #[tokio::test]
    async fn test_rejected_at_construction() {
        let mock = MockOperator::new(input_series(), vec![]);
        let result = AggregateOperator::new(mock.clone(), None, AggregateOp::CountValues, false, vec![], 10);
        assert!(matches!(result, Err(ExecutionError::UnsupportedAggregation(_))));

        let result = AggregateOperator::new(mock, None, AggregateOp::Quantile, false, vec![], 10);
        assert!(matches!(result, Err(ExecutionError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_child_error_propagates() {
        let mock = MockOperator::failing(ExecutionError::Cancelled);
        let op = aggregate(AggregateOp::Sum, false, &[], mock);
        assert!(matches!(collect(&op).await, Err(ExecutionError::Cancelled)));
    }
}

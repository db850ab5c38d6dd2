use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionResult, QueryOptions};
use crate::labels::Labels;

/// A constant scalar: one sample with ID 0 at every step.
pub struct NumberLiteralOperator {
    value: f64,
    maxt: i64,
    step: i64,
    steps_batch: usize,
    series: Arc<[Labels]>,
    pool: Arc<VectorPool>,
    current_step: Mutex<i64>,
}

impl NumberLiteralOperator {
    pub fn new(value: f64, opts: &QueryOptions) -> Self {
        Self {
            value,
            maxt: opts.end,
            step: opts.step_ms(),
            steps_batch: opts.steps_batch,
            series: Arc::from(vec![Labels::empty()]),
            pool: Arc::new(VectorPool::with_size(opts.steps_batch, 1)),
            current_step: Mutex::new(opts.start),
        }
    }
}

#[async_trait]
impl VectorOperator for NumberLiteralOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        let mut ts = self.current_step.lock().await;
        if *ts > self.maxt {
            return Ok(None);
        }

        let mut batch = self.pool.get_vector_batch();
        while batch.len() < self.steps_batch && *ts <= self.maxt {
            let mut sv = self.pool.get_step_vector(*ts);
            sv.append_sample(0, self.value);
            batch.push(sv);
            *ts += self.step;
        }
        Ok(Some(batch))
    }

    async fn series(&self, _ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        Ok(Arc::clone(&self.series))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        (format!("[*numberLiteral] {}", self.value), vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::collect;
    use std::time::Duration;

    #[tokio::test]
    async fn test_one_sample_per_step() {
        let opts = QueryOptions::new(0, 25_000, Duration::from_secs(10)).with_steps_batch(2);
        let op = NumberLiteralOperator::new(0.5, &opts);
        let ctx = CancellationToken::new();

        assert_eq!(op.next(&ctx).await.unwrap().unwrap().len(), 2);
        let rest = collect(&op).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].t, 20_000);
        assert_eq!(rest[0].sample_ids, vec![0]);
        assert_eq!(rest[0].samples, vec![0.5]);

        let series = op.series(&ctx).await.unwrap();
        assert_eq!(series.len(), 1);
        assert!(series[0].is_empty());
    }
}

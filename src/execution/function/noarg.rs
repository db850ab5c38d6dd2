use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::functions::{no_arg_function, NoArgFunctionCall};
use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionError, ExecutionResult, QueryOptions};
use crate::labels::Labels;

/// A function of the step timestamp alone, such as `time()` or `pi()`.
pub struct NoArgFunctionOperator {
    name: String,
    call: NoArgFunctionCall,
    maxt: i64,
    step: i64,
    steps_batch: usize,
    series: Arc<[Labels]>,
    pool: Arc<VectorPool>,
    current_step: Mutex<i64>,
}

impl NoArgFunctionOperator {
    pub fn new(name: &str, opts: &QueryOptions) -> ExecutionResult<Self> {
        let call = no_arg_function(name).ok_or_else(|| ExecutionError::UnknownFunction(name.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            call,
            maxt: opts.end,
            step: opts.step_ms(),
            steps_batch: opts.steps_batch,
            series: Arc::from(vec![Labels::empty()]),
            pool: Arc::new(VectorPool::with_size(opts.steps_batch, 1)),
            current_step: Mutex::new(opts.start),
        })
    }
}

#[async_trait]
impl VectorOperator for NoArgFunctionOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        let mut ts = self.current_step.lock().await;
        if *ts > self.maxt {
            return Ok(None);
        }

        let mut batch = self.pool.get_vector_batch();
        while batch.len() < self.steps_batch && *ts <= self.maxt {
            let mut sv = self.pool.get_step_vector(*ts);
            sv.append_sample(0, (self.call)(*ts));
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
        (format!("[*noArgFunctionOperator] {}()", self.name), vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::collect;
    use std::time::Duration;

    #[tokio::test]
    async fn test_time_per_step() {
        let opts = QueryOptions::new(0, 10_000, Duration::from_millis(5000)).with_steps_batch(3);
        let op = NoArgFunctionOperator::new("time", &opts).unwrap();

        let steps = collect(&op).await.unwrap();
        let values: Vec<f64> = steps.iter().flat_map(|sv| sv.samples.clone()).collect();
        assert_eq!(values, vec![0.0, 5.0, 10.0]);
        assert!(steps.iter().all(|sv| sv.sample_ids == vec![0]));

        let series = op.series(&CancellationToken::new()).await.unwrap();
        assert_eq!(&*series, &[Labels::empty()]);
    }

    #[tokio::test]
    async fn test_unknown_no_arg_function() {
        let opts = QueryOptions::new(0, 0, Duration::ZERO);
        assert!(matches!(
            NoArgFunctionOperator::new("abs", &opts),
            Err(ExecutionError::UnknownFunction(_))
        ));
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionResult};
use crate::labels::Labels;

/// `scalar(v)`: the value of a single-element vector, NaN otherwise.
pub struct ScalarFunctionOperator {
    next: Arc<dyn VectorOperator>,
    series: Arc<[Labels]>,
    pool: Arc<VectorPool>,
}

impl ScalarFunctionOperator {
    pub fn new(next: Arc<dyn VectorOperator>, steps_batch: usize) -> Self {
        Self {
            next,
            series: Arc::from(vec![Labels::empty()]),
            pool: Arc::new(VectorPool::with_size(steps_batch, 1)),
        }
    }
}

#[async_trait]
impl VectorOperator for ScalarFunctionOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        let Some(mut input) = self.next.next(ctx).await? else {
            return Ok(None);
        };

        let input_pool = self.next.pool();
        let mut batch = self.pool.get_vector_batch();
        for sv in input.drain(..) {
            let mut out = self.pool.get_step_vector(sv.t);
            let value = match sv.samples.as_slice() {
                [v] => *v,
                _ => f64::NAN,
            };
            out.append_sample(0, value);
            batch.push(out);
            input_pool.put_step_vector(sv);
        }
        input_pool.put_vectors(input);
        Ok(Some(batch))
    }

    async fn series(&self, _ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        Ok(Arc::clone(&self.series))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        ("[*scalarFunctionOperator]".to_string(), vec![Arc::clone(&self.next)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{collect, step, MockOperator};

    #[tokio::test]
    async fn test_single_sample_passes_through() {
        let mock = MockOperator::new(
            vec![Labels::from_pairs([("job", "a")]), Labels::from_pairs([("job", "b")])],
            vec![vec![
                step(0, &[(0, 4.0)]),
                step(1000, &[]),
                step(2000, &[(0, 1.0), (1, 2.0)]),
            ]],
        );
        let op = ScalarFunctionOperator::new(mock, 10);

        let steps = collect(&op).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].samples, vec![4.0]);
        assert!(steps[1].samples[0].is_nan());
        assert!(steps[2].samples[0].is_nan());
        assert!(steps.iter().all(|sv| sv.sample_ids == vec![0]));
    }

    #[tokio::test]
    async fn test_exhausted_child() {
        let mock = MockOperator::new(vec![], vec![]);
        let op = ScalarFunctionOperator::new(mock, 10);
        assert!(op.next(&CancellationToken::new()).await.unwrap().is_none());
        assert_eq!(&*op.series(&CancellationToken::new()).await.unwrap(), &[Labels::empty()]);
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionResult};
use crate::labels::{Labels, MatchOp, METRIC_NAME};
use crate::query::ast::{Call, Expr};

/// `absent(v)`: 1 at every step where `v` has no samples.
pub struct AbsentOperator {
    next: Arc<dyn VectorOperator>,
    series: Arc<[Labels]>,
    pool: Arc<VectorPool>,
}

impl AbsentOperator {
    pub fn new(next: Arc<dyn VectorOperator>, call: &Call, steps_batch: usize) -> Self {
        Self {
            next,
            series: Arc::from(vec![absent_labels(call)]),
            pool: Arc::new(VectorPool::with_size(steps_batch, 1)),
        }
    }
}

/// Labels of the synthetic series: the equality matchers of a selector
/// argument. A name matched more than once is left out.
fn absent_labels(call: &Call) -> Labels {
    let mut arg = call.args.first();
    while let Some(Expr::Paren(inner)) = arg {
        arg = Some(inner.as_ref());
    }
    let matchers = match arg {
        Some(Expr::VectorSelector(vs)) => &vs.matchers,
        Some(Expr::MatrixSelector(ms)) => &ms.vs.matchers,
        _ => return Labels::empty(),
    };

    let mut labels = Labels::empty();
    let mut seen = HashSet::new();
    let mut repeated = HashSet::new();
    for m in matchers {
        if m.name == METRIC_NAME {
            continue;
        }
        if !seen.insert(m.name.as_str()) {
            repeated.insert(m.name.as_str());
        }
        if m.op == MatchOp::Equal {
            labels.set(m.name.clone(), m.value.clone());
        }
    }
    labels.without(&repeated.into_iter().collect::<Vec<_>>())
}

#[async_trait]
impl VectorOperator for AbsentOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        let Some(mut input) = self.next.next(ctx).await? else {
            return Ok(None);
        };

        let input_pool = self.next.pool();
        let mut batch = self.pool.get_vector_batch();
        for sv in input.drain(..) {
            let mut out = self.pool.get_step_vector(sv.t);
            if sv.is_empty() {
                out.append_sample(0, 1.0);
            }
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
        ("[*absentOperator]".to_string(), vec![Arc::clone(&self.next)])
    }
}

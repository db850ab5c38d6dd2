use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use super::functions::{instant_vector_function, FunctionCall};
use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionError, ExecutionResult};
use crate::labels::Labels;
use crate::query::ast::{Call, ValueType};

/// Applies a function to every sample of its vector argument, in place.
/// Other arguments are scalars, broadcast to all samples of a step.
pub struct FunctionOperator {
    name: &'static str,
    text: String,
    call: FunctionCall,
    next_ops: Vec<Arc<dyn VectorOperator>>,
    vector_index: usize,
    series: OnceCell<Arc<[Labels]>>,
    /// Scalar arguments per step of the current batch, in argument order
    scalar_points: Mutex<Vec<Vec<f64>>>,
}

impl FunctionOperator {
    pub fn new(call: &Call, next_ops: Vec<Arc<dyn VectorOperator>>, steps_batch: usize) -> ExecutionResult<Self> {
        let name = call.func.name;
        let func = instant_vector_function(name).ok_or_else(|| ExecutionError::UnknownFunction(name.to_string()))?;

        let vector_index = call
            .args
            .iter()
            .position(|a| a.value_type() == ValueType::Vector)
            .unwrap_or(0);
        match call.args.get(vector_index).map(|a| a.value_type()) {
            Some(ValueType::Vector) | Some(ValueType::Scalar) if vector_index < next_ops.len() => {}
            _ => return Err(ExecutionError::NotImplemented(call.to_string())),
        }

        let scalars = next_ops.len() - 1;
        Ok(Self {
            name,
            text: call.to_string(),
            call: func,
            next_ops,
            vector_index,
            series: OnceCell::new(),
            scalar_points: Mutex::new(vec![vec![f64::NAN; scalars]; steps_batch]),
        })
    }
}

#[async_trait]
impl VectorOperator for FunctionOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        self.series(ctx).await?;

        let Some(mut vectors) = self.next_ops[self.vector_index].next(ctx).await? else {
            return Ok(None);
        };

        let mut scalar_points = self.scalar_points.lock().await;
        let scalars = self.next_ops.len() - 1;
        if scalar_points.len() < vectors.len() {
            scalar_points.resize(vectors.len(), vec![f64::NAN; scalars]);
        }

        let scalar_ops = self
            .next_ops
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.vector_index)
            .map(|(_, op)| op);
        for (scalar_index, op) in scalar_ops.enumerate() {
            let batch = op.next(ctx).await?;
            for (step, points) in scalar_points.iter_mut().take(vectors.len()).enumerate() {
                points[scalar_index] = batch
                    .as_ref()
                    .and_then(|b| b.get(step))
                    .and_then(|sv| sv.samples.first().copied())
                    .unwrap_or(f64::NAN);
            }
            if let Some(batch) = batch {
                op.pool().put_vectors(batch);
            }
        }

        for (sv, args) in vectors.iter_mut().zip(scalar_points.iter()) {
            sv.map_samples(|v| (self.call)(v, None, args));
            sv.map_histograms(|h| (self.call)(0.0, Some(h), args));
        }
        Ok(Some(vectors))
    }

    async fn series(&self, ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        let series = self
            .series
            .get_or_try_init(|| async {
                if self.name == "vector" {
                    return Ok(Arc::from(vec![Labels::empty()]));
                }
                let input = self.next_ops[self.vector_index].series(ctx).await?;
                Ok::<_, ExecutionError>(input.iter().map(Labels::drop_metric_name).collect())
            })
            .await?;
        Ok(Arc::clone(series))
    }

    fn pool(&self) -> Arc<VectorPool> {
        self.next_ops[self.vector_index].pool()
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        (format!("[*functionOperator] {}", self.text), self.next_ops.clone())
    }
}

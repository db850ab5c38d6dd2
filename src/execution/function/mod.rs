//! Operators evaluating built-in function calls.
//!
//! Most functions map each sample of their vector argument to a new value
//! and share [`FunctionOperator`]. Functions whose output shape differs from
//! their input get dedicated operators.

mod absent;
pub mod functions;
mod histogram;
mod noarg;
mod operator;
mod relabel;
mod scalar;

use std::sync::Arc;

use tracing::debug;

use super::model::VectorOperator;
use super::{ExecutionError, ExecutionResult, QueryOptions};
use crate::query::ast::Call;

pub use absent::AbsentOperator;
pub use histogram::HistogramOperator;
pub use noarg::NoArgFunctionOperator;
pub use operator::FunctionOperator;
pub use relabel::RelabelFunctionOperator;
pub use scalar::ScalarFunctionOperator;

/// Builds the operator for `call`. `next_ops` holds one operator per
/// argument that is not a string literal, in argument order.
pub fn new_function_operator(
    call: &Call,
    next_ops: Vec<Arc<dyn VectorOperator>>,
    opts: &QueryOptions,
) -> ExecutionResult<Arc<dyn VectorOperator>> {
    let name = call.func.name;
    debug!(function = name, args = next_ops.len(), "building function operator");

    let op: Arc<dyn VectorOperator> = match name {
        "scalar" => {
            let [next] = operands(call, next_ops)?;
            Arc::new(ScalarFunctionOperator::new(next, opts.steps_batch))
        }
        "label_join" | "label_replace" => {
            let [next] = operands(call, next_ops)?;
            Arc::new(RelabelFunctionOperator::new(next, call)?)
        }
        "absent" => {
            let [next] = operands(call, next_ops)?;
            Arc::new(AbsentOperator::new(next, call, opts.steps_batch))
        }
        "histogram_quantile" => {
            let [scalar, vector] = operands(call, next_ops)?;
            Arc::new(HistogramOperator::new(scalar, vector, opts.steps_batch))
        }
        _ if next_ops.is_empty() => Arc::new(NoArgFunctionOperator::new(name, opts)?),
        _ => Arc::new(FunctionOperator::new(call, next_ops, opts.steps_batch)?),
    };
    Ok(op)
}

/// Takes exactly `N` operands for a function with a fixed shape.
fn operands<const N: usize>(
    call: &Call,
    next_ops: Vec<Arc<dyn VectorOperator>>,
) -> ExecutionResult<[Arc<dyn VectorOperator>; N]> {
    next_ops.try_into().map_err(|ops: Vec<Arc<dyn VectorOperator>>| {
        ExecutionError::InvalidArgument(format!(
            "{} expects {} operand(s), got {}",
            call.func.name,
            N,
            ops.len()
        ))
    })
}

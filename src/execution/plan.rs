//! Compiles an expression into a tree of vector operators.

use std::sync::Arc;

use tracing::debug;

use super::aggregate::AggregateOperator;
use super::concurrent::concurrent;
use super::function::new_function_operator;
use super::model::VectorOperator;
use super::scan::{MatrixSelectorOperator, NumberLiteralOperator, VectorSelectorOperator};
use super::{ExecutionError, ExecutionResult, QueryOptions};
use crate::query::ast::{Call, Expr, MatrixSelector};
use crate::storage::Queryable;

/// Builds the operator tree for `expr`. Performs no I/O: storage is first
/// read when the root is pulled.
pub fn new(expr: &Expr, storage: Arc<dyn Queryable>, opts: &QueryOptions) -> ExecutionResult<Arc<dyn VectorOperator>> {
    // Every batch must cover at least one step.
    if opts.steps_batch == 0 {
        return Err(ExecutionError::InvalidArgument("steps batch must be at least 1".to_string()));
    }
    debug!(
        expr = %expr,
        start = opts.start,
        end = opts.end,
        steps = opts.num_steps(),
        "building execution plan"
    );
    Builder { storage, opts }.new_operator(expr)
}

struct Builder<'a> {
    storage: Arc<dyn Queryable>,
    opts: &'a QueryOptions,
}

impl Builder<'_> {
    fn new_operator(&self, expr: &Expr) -> ExecutionResult<Arc<dyn VectorOperator>> {
        match expr {
            Expr::Aggregate(a) => {
                let next = self.new_operator(&a.expr)?;
                let param = a.param.as_deref().map(|p| self.new_operator(p)).transpose()?;
                let aggregate = AggregateOperator::new(
                    next,
                    param,
                    a.op,
                    a.without,
                    a.grouping.clone(),
                    self.opts.steps_batch,
                )?;
                Ok(self.wrap(Arc::new(aggregate)))
            }
            Expr::VectorSelector(vs) => {
                let selector = VectorSelectorOperator::new(Arc::clone(&self.storage), vs.matchers.clone(), self.opts);
                Ok(self.wrap(Arc::new(selector)))
            }
            Expr::Call(call) => match matrix_argument(call) {
                Some(ms) => {
                    let selector = MatrixSelectorOperator::new(
                        Arc::clone(&self.storage),
                        ms.vs.matchers.clone(),
                        self.opts,
                        ms.range,
                        call.func.name,
                    )?;
                    Ok(self.wrap(Arc::new(selector)))
                }
                None => {
                    let next_ops = call
                        .args
                        .iter()
                        .filter(|a| !matches!(unwrap_parens(a), Expr::StringLiteral(_)))
                        .map(|a| self.new_operator(a))
                        .collect::<ExecutionResult<Vec<_>>>()?;
                    let function = new_function_operator(call, next_ops, self.opts)?;
                    Ok(self.wrap(function))
                }
            },
            Expr::NumberLiteral(v) => Ok(Arc::new(NumberLiteralOperator::new(*v, self.opts))),
            Expr::Paren(inner) => self.new_operator(inner),
            Expr::MatrixSelector(_) | Expr::StringLiteral(_) | Expr::Binary(_) | Expr::Subquery(_) => {
                Err(ExecutionError::UnsupportedExpression(expr.to_string()))
            }
        }
    }

    fn wrap(&self, op: Arc<dyn VectorOperator>) -> Arc<dyn VectorOperator> {
        if self.opts.disable_concurrency {
            op
        } else {
            concurrent(op)
        }
    }
}

fn unwrap_parens(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(inner) => unwrap_parens(inner),
        other => other,
    }
}

fn matrix_argument(call: &Call) -> Option<&MatrixSelector> {
    call.args.iter().find_map(|a| match unwrap_parens(a) {
        Expr::MatrixSelector(ms) => Some(ms),
        _ => None,
    })
}

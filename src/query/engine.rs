use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::execution::options::{DEFAULT_LOOKBACK_DELTA, DEFAULT_STEPS_BATCH};
use crate::execution::{explain, plan, ExecutionError, ExecutionResult, QueryOptions, VectorOperator};
use crate::labels::Labels;
use crate::metrics;
use crate::query::ast::{Expr, ValueType};
use crate::storage::{FloatHistogram, Queryable};

/// Error type for query evaluation
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Query execution failed: {0}")]
    Execution(#[from] ExecutionError),
    #[error("Query timeout after {0:?}")]
    Timeout(Duration),
}

/// Configuration for the query engine
#[derive(Debug, Clone)]
pub struct EngineOpts {
    /// Steps covered by one batch
    pub steps_batch: usize,
    pub lookback_delta: Duration,
    /// Timeout for a whole query evaluation
    pub timeout: Duration,
    pub disable_concurrency: bool,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            steps_batch: DEFAULT_STEPS_BATCH,
            lookback_delta: DEFAULT_LOOKBACK_DELTA,
            timeout: Duration::from_secs(30),
            disable_concurrency: false,
        }
    }
}

/// One output series of a range or instant query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSeries {
    pub labels: Labels,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub floats: Vec<(i64, f64)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub histograms: Vec<(i64, FloatHistogram)>,
}

/// Evaluated value of a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryResult {
    Matrix(Vec<RangeSeries>),
    Scalar(Vec<(i64, f64)>),
}

/// Builds executable queries over a storage.
pub struct Engine {
    storage: Arc<dyn Queryable>,
    opts: EngineOpts,
}

impl Engine {
    pub fn new(storage: Arc<dyn Queryable>, opts: EngineOpts) -> Self {
        Self { storage, opts }
    }

    /// Prepares `expr` for evaluation at every step in `[start, end]`.
    pub fn new_range_query(
        &self,
        expr: &Expr,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Query, QueryError> {
        self.new_query(expr, QueryOptions::range(start, end, step))
    }

    pub fn new_instant_query(&self, expr: &Expr, t: DateTime<Utc>) -> Result<Query, QueryError> {
        self.new_query(expr, QueryOptions::instant(t))
    }

    fn new_query(&self, expr: &Expr, opts: QueryOptions) -> Result<Query, QueryError> {
        let mut opts = opts
            .with_steps_batch(self.opts.steps_batch)
            .with_lookback_delta(self.opts.lookback_delta);
        opts.disable_concurrency = self.opts.disable_concurrency;

        let root = plan::new(expr, Arc::clone(&self.storage), &opts)?;
        Ok(Query {
            id: Uuid::new_v4(),
            text: expr.to_string(),
            value_type: expr.value_type(),
            root,
            timeout: self.opts.timeout,
        })
    }
}

/// A planned query. Each query is evaluated once.
pub struct Query {
    id: Uuid,
    text: String,
    value_type: ValueType,
    root: Arc<dyn VectorOperator>,
    timeout: Duration,
}

impl Query {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Renders the operator tree, one node per line.
    pub fn explain(&self) -> String {
        explain(self.root.as_ref())
    }

    /// Pulls the plan to exhaustion. Background producers are stopped
    /// before returning, whatever the outcome.
    pub async fn exec(&self, ctx: &CancellationToken) -> Result<QueryResult, QueryError> {
        let started = Instant::now();
        info!(id = %self.id, query = %self.text, "executing query");

        let ctx = ctx.child_token();
        let result = tokio::select! {
            result = self.collect(&ctx) => result.map_err(QueryError::from),
            _ = tokio::time::sleep(self.timeout) => Err(QueryError::Timeout(self.timeout)),
        };
        ctx.cancel();

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => {
                metrics::record_query(elapsed_ms);
                info!(id = %self.id, elapsed_ms, "query finished");
            }
            Err(e) => {
                metrics::record_query_failure(failure_reason(e));
                warn!(id = %self.id, error = %e, "query failed");
            }
        }
        result
    }

    async fn collect(&self, ctx: &CancellationToken) -> ExecutionResult<QueryResult> {
        let series = self.root.series(ctx).await?;
        let pool = self.root.pool();

        let mut scalars = Vec::new();
        let mut out: Vec<RangeSeries> = series
            .iter()
            .map(|labels| RangeSeries {
                labels: labels.clone(),
                floats: Vec::new(),
                histograms: Vec::new(),
            })
            .collect();

        while let Some(mut batch) = self.root.next(ctx).await? {
            for mut sv in batch.drain(..) {
                if self.value_type == ValueType::Scalar {
                    if let Some(v) = sv.samples.first() {
                        scalars.push((sv.t, *v));
                    }
                } else {
                    for (id, v) in sv.sample_ids.iter().zip(&sv.samples) {
                        if let Some(s) = out.get_mut(*id as usize) {
                            s.floats.push((sv.t, *v));
                        }
                    }
                    for (id, h) in sv.histogram_ids.iter().zip(sv.histograms.drain(..)) {
                        if let Some(s) = out.get_mut(*id as usize) {
                            s.histograms.push((sv.t, h));
                        }
                    }
                }
                pool.put_step_vector(sv);
            }
            pool.put_vectors(batch);
        }

        if self.value_type == ValueType::Scalar {
            return Ok(QueryResult::Scalar(scalars));
        }
        out.retain(|s| !s.floats.is_empty() || !s.histograms.is_empty());
        Ok(QueryResult::Matrix(out))
    }
}

fn failure_reason(e: &QueryError) -> &'static str {
    match e {
        QueryError::Timeout(_) => "timeout",
        QueryError::Execution(ExecutionError::Cancelled) => "cancelled",
        QueryError::Execution(ExecutionError::Storage(_)) => "storage",
        QueryError::Execution(_) => "execution",
    }
}

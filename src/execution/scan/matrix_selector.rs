use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use super::range_functions::{keeps_metric_name, range_function, RangeFunction, RangeWindow};
use super::{load_series, matchers_text, LoadedSeries};
use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionError, ExecutionResult, QueryOptions};
use crate::labels::{Labels, Matcher};
use crate::metrics;
use crate::query::ast::fmt_duration;
use crate::storage::{Queryable, Value};

/// Applies a range function to the window `(t - range, t]` of every matching
/// series at every step.
pub struct MatrixSelectorOperator {
    storage: Arc<dyn Queryable>,
    matchers: Vec<Matcher>,
    func_name: String,
    func: RangeFunction,
    mint: i64,
    maxt: i64,
    step: i64,
    range: i64,
    steps_batch: usize,
    pool: Arc<VectorPool>,
    loaded: OnceCell<(LoadedSeries, Arc<[Labels]>)>,
    state: Mutex<MatrixState>,
}

struct MatrixState {
    current_step: i64,
    /// Float samples of the window being evaluated, reused across series.
    window: Vec<(i64, f64)>,
}

impl MatrixSelectorOperator {
    pub fn new(
        storage: Arc<dyn Queryable>,
        matchers: Vec<Matcher>,
        opts: &QueryOptions,
        range: Duration,
        func_name: &str,
    ) -> ExecutionResult<Self> {
        let func = range_function(func_name)
            .ok_or_else(|| ExecutionError::UnknownFunction(func_name.to_string()))?;
        Ok(Self {
            storage,
            matchers,
            func_name: func_name.to_string(),
            func,
            mint: opts.start,
            maxt: opts.end,
            step: opts.step_ms(),
            range: range.as_millis() as i64,
            steps_batch: opts.steps_batch,
            pool: Arc::new(VectorPool::new(opts.steps_batch)),
            loaded: OnceCell::new(),
            state: Mutex::new(MatrixState {
                current_step: opts.start,
                window: Vec::new(),
            }),
        })
    }

    async fn load(&self, ctx: &CancellationToken) -> ExecutionResult<&(LoadedSeries, Arc<[Labels]>)> {
        self.loaded
            .get_or_try_init(|| async {
                let loaded = load_series(
                    ctx,
                    self.storage.as_ref(),
                    &self.matchers,
                    (self.mint - self.range + 1).min(self.maxt),
                    self.maxt,
                )
                .await?;
                let keep_name = keeps_metric_name(&self.func_name);
                let series: Arc<[Labels]> = loaded
                    .labels
                    .iter()
                    .map(|l| if keep_name { l.clone() } else { l.drop_metric_name() })
                    .collect();
                self.pool.set_step_size(series.len());
                metrics::record_series_loaded("matrix_selector", series.len());
                Ok::<_, ExecutionError>((loaded, series))
            })
            .await
    }
}

#[async_trait]
impl VectorOperator for MatrixSelectorOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        let (loaded, _) = self.load(ctx).await?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.current_step > self.maxt {
            return Ok(None);
        }

        let mut batch = self.pool.get_vector_batch();
        let mut ts = state.current_step;
        while batch.len() < self.steps_batch && ts <= self.maxt {
            let mut sv = self.pool.get_step_vector(ts);
            let window_start = ts - self.range;
            for (series_id, points) in loaded.points.iter().enumerate() {
                let from = points.partition_point(|p| p.t <= window_start);
                let to = points.partition_point(|p| p.t <= ts);
                state.window.clear();
                state.window.extend(points[from..to].iter().filter_map(|p| match p.value {
                    Value::Float(v) => Some((p.t, v)),
                    Value::Histogram(_) => None,
                }));
                let window = RangeWindow {
                    samples: &state.window,
                    step_time: ts,
                    range: self.range,
                };
                if let Some(v) = (self.func)(&window) {
                    sv.append_sample(series_id as u64, v);
                }
            }
            batch.push(sv);
            ts += self.step;
        }
        state.current_step = ts;

        metrics::record_batch("matrix_selector", batch.len());
        Ok(Some(batch))
    }

    async fn series(&self, ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        let (_, series) = self.load(ctx).await?;
        Ok(Arc::clone(series))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        (
            format!(
                "[*matrixSelector] {}({}[{}])",
                self.func_name,
                matchers_text(&self.matchers),
                fmt_duration(&Duration::from_millis(self.range as u64))
            ),
            vec![],
        )
    }
}

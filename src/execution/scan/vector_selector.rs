use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use super::{load_series, matchers_text, LoadedSeries};
use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionError, ExecutionResult, QueryOptions};
use crate::labels::{Labels, Matcher};
use crate::metrics;
use crate::storage::{Queryable, Value};

/// Emits, for every step, the latest sample of each matching series within
/// the lookback window `(t - lookback, t]`.
pub struct VectorSelectorOperator {
    storage: Arc<dyn Queryable>,
    matchers: Vec<Matcher>,
    mint: i64,
    maxt: i64,
    step: i64,
    lookback: i64,
    steps_batch: usize,
    pool: Arc<VectorPool>,
    loaded: OnceCell<(LoadedSeries, Arc<[Labels]>)>,
    state: Mutex<SelectorState>,
}

struct SelectorState {
    current_step: i64,
    /// Per series, the number of points with a timestamp at or before the current step.
    cursors: Vec<usize>,
}

impl VectorSelectorOperator {
    pub fn new(storage: Arc<dyn Queryable>, matchers: Vec<Matcher>, opts: &QueryOptions) -> Self {
        Self {
            storage,
            matchers,
            mint: opts.start,
            maxt: opts.end,
            step: opts.step_ms(),
            lookback: opts.lookback_ms(),
            steps_batch: opts.steps_batch,
            pool: Arc::new(VectorPool::new(opts.steps_batch)),
            loaded: OnceCell::new(),
            state: Mutex::new(SelectorState {
                current_step: opts.start,
                cursors: Vec::new(),
            }),
        }
    }

    async fn load(&self, ctx: &CancellationToken) -> ExecutionResult<&(LoadedSeries, Arc<[Labels]>)> {
        self.loaded
            .get_or_try_init(|| async {
                let loaded = load_series(
                    ctx,
                    self.storage.as_ref(),
                    &self.matchers,
                    (self.mint - self.lookback + 1).min(self.maxt),
                    self.maxt,
                )
                .await?;
                let series: Arc<[Labels]> = Arc::from(loaded.labels.clone());
                self.pool.set_step_size(series.len());
                metrics::record_series_loaded("vector_selector", series.len());
                Ok::<_, ExecutionError>((loaded, series))
            })
            .await
    }
}

#[async_trait]
impl VectorOperator for VectorSelectorOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        let (loaded, _) = self.load(ctx).await?;

        let mut state = self.state.lock().await;
        if state.current_step > self.maxt {
            return Ok(None);
        }
        if state.cursors.len() != loaded.points.len() {
            state.cursors = vec![0; loaded.points.len()];
        }

        let mut batch = self.pool.get_vector_batch();
        let mut ts = state.current_step;
        while batch.len() < self.steps_batch && ts <= self.maxt {
            let mut sv = self.pool.get_step_vector(ts);
            for (series_id, points) in loaded.points.iter().enumerate() {
                let cursor = &mut state.cursors[series_id];
                while *cursor < points.len() && points[*cursor].t <= ts {
                    *cursor += 1;
                }
                let Some(point) = cursor.checked_sub(1).map(|i| &points[i]) else {
                    continue;
                };
                if point.t <= ts - self.lookback {
                    continue;
                }
                match &point.value {
                    Value::Float(v) => sv.append_sample(series_id as u64, *v),
                    Value::Histogram(h) => sv.append_histogram(series_id as u64, h.clone()),
                }
            }
            batch.push(sv);
            ts += self.step;
        }
        state.current_step = ts;

        metrics::record_batch("vector_selector", batch.len());
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
            format!("[*vectorSelector] {}", matchers_text(&self.matchers)),
            vec![],
        )
    }
}

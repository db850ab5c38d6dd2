//! Helpers shared by the unit tests of the execution modules.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::execution::{check_cancelled, ExecutionError, ExecutionResult, StepVector, VectorOperator, VectorPool};
use crate::labels::Labels;
use crate::storage::MemTable;

/// Builds a step vector holding the given float samples.
pub(crate) fn step(t: i64, samples: &[(u64, f64)]) -> StepVector {
    let mut sv = StepVector::new(t);
    for &(id, v) in samples {
        sv.append_sample(id, v);
    }
    sv
}

/// An operator replaying scripted batches.
pub(crate) struct MockOperator {
    series: Arc<[Labels]>,
    batches: Mutex<VecDeque<Vec<StepVector>>>,
    error: std::sync::Mutex<Option<ExecutionError>>,
    pool: Arc<VectorPool>,
    pub next_calls: AtomicUsize,
    pub series_calls: AtomicUsize,
}

impl MockOperator {
    pub fn new(series: Vec<Labels>, batches: Vec<Vec<StepVector>>) -> Arc<Self> {
        Arc::new(Self {
            series: Arc::from(series),
            batches: Mutex::new(batches.into()),
            error: std::sync::Mutex::new(None),
            pool: Arc::new(VectorPool::new(10)),
            next_calls: AtomicUsize::new(0),
            series_calls: AtomicUsize::new(0),
        })
    }

    /// An operator whose first `next` fails with `err`.
    pub fn failing(err: ExecutionError) -> Arc<Self> {
        let op = Self::new(vec![], vec![]);
        *op.error.lock().unwrap() = Some(err);
        op
    }
}

#[async_trait]
impl VectorOperator for MockOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        self.next_calls.fetch_add(1, Ordering::SeqCst);
        let err = self.error.lock().unwrap().take();
        if let Some(err) = err {
            return Err(err);
        }
        Ok(self.batches.lock().await.pop_front())
    }

    async fn series(&self, ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        check_cancelled(ctx)?;
        self.series_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.series))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        ("[*mockOperator]".to_string(), vec![])
    }
}

/// Pulls `op` to exhaustion and returns every step vector.
pub(crate) async fn collect(op: &dyn VectorOperator) -> ExecutionResult<Vec<StepVector>> {
    let ctx = CancellationToken::new();
    let mut out = Vec::new();
    while let Some(batch) = op.next(&ctx).await? {
        out.extend(batch);
    }
    Ok(out)
}

/// Three `http_requests_total` counters and an `up` gauge, sampled every 10s
/// from 0 to 120s.
pub(crate) async fn fixture() -> Arc<MemTable> {
    let memtable = MemTable::new(10_000);
    let series = [
        (Labels::from_pairs([("__name__", "http_requests_total"), ("job", "api"), ("instance", "a")]), 1.0),
        (Labels::from_pairs([("__name__", "http_requests_total"), ("job", "api"), ("instance", "b")]), 2.0),
        (Labels::from_pairs([("__name__", "http_requests_total"), ("job", "db"), ("instance", "c")]), 4.0),
    ];
    for (labels, per_sample) in &series {
        memtable
            .insert_floats(labels, (0..=12).map(|i| (i * 10_000, i as f64 * per_sample)))
            .await
            .unwrap();
    }
    memtable
        .insert_floats(
            &Labels::from_pairs([("__name__", "up"), ("job", "api")]),
            (0..=12).map(|i| (i * 10_000, 1.0)),
        )
        .await
        .unwrap();
    Arc::new(memtable)
}

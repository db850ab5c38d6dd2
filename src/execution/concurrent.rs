use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::model::{StepVector, VectorOperator};
use super::pool::VectorPool;
use super::{check_cancelled, ExecutionError, ExecutionResult};
use crate::labels::Labels;

type Batch = ExecutionResult<Option<Vec<StepVector>>>;

/// Runs the wrapped operator in a background task so that it produces its
/// next batch while the consumer processes the previous one.
pub struct ConcurrencyOperator {
    next: Arc<dyn VectorOperator>,
    buffer: usize,
    state: Mutex<ProducerState>,
}

#[derive(Default)]
struct ProducerState {
    rx: Option<mpsc::Receiver<Batch>>,
    handle: Option<JoinHandle<()>>,
    done: bool,
}

/// Wraps `next` with a one-batch-ahead producer.
pub fn concurrent(next: Arc<dyn VectorOperator>) -> Arc<dyn VectorOperator> {
    Arc::new(ConcurrencyOperator::new(next, 1))
}

impl ConcurrencyOperator {
    pub fn new(next: Arc<dyn VectorOperator>, buffer: usize) -> Self {
        Self {
            next,
            buffer: buffer.max(1),
            state: Mutex::new(ProducerState::default()),
        }
    }

    fn spawn_producer(&self, ctx: CancellationToken) -> (mpsc::Receiver<Batch>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let next = Arc::clone(&self.next);
        let handle = tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => Err(ExecutionError::Cancelled),
                    batch = next.next(&ctx) => batch,
                };
                let last = !matches!(batch, Ok(Some(_)));
                let sent = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => false,
                    res = tx.send(batch) => res.is_ok(),
                };
                if !sent || last {
                    break;
                }
            }
            debug!("concurrency producer exited");
        });
        (rx, handle)
    }
}

#[async_trait]
impl VectorOperator for ConcurrencyOperator {
    async fn next(&self, ctx: &CancellationToken) -> Batch {
        check_cancelled(ctx)?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.done {
            return Ok(None);
        }
        if state.rx.is_none() {
            let (rx, handle) = self.spawn_producer(ctx.clone());
            state.handle = Some(handle);
            state.rx = Some(rx);
        }
        let Some(rx) = state.rx.as_mut() else {
            return Ok(None);
        };

        let received = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ExecutionError::Cancelled),
            received = rx.recv() => received,
        };
        match received {
            Some(Ok(Some(batch))) => Ok(Some(batch)),
            Some(Ok(None)) => {
                state.done = true;
                Ok(None)
            }
            Some(Err(e)) => {
                state.done = true;
                Err(e)
            }
            None => {
                // The producer stopped without sending a terminal result.
                state.done = true;
                check_cancelled(ctx)?;
                match state.handle.take() {
                    Some(handle) => match handle.await {
                        Err(e) => Err(ExecutionError::Producer(e.to_string())),
                        Ok(()) => Err(ExecutionError::Producer("producer stopped early".to_string())),
                    },
                    None => Ok(None),
                }
            }
        }
    }

    async fn series(&self, ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        self.next.series(ctx).await
    }

    fn pool(&self) -> Arc<VectorPool> {
        self.next.pool()
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        (
            format!("[*concurrencyOperator(buff={})]", self.buffer),
            vec![Arc::clone(&self.next)],
        )
    }
}

impl Drop for ConcurrencyOperator {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().handle.take() {
            handle.abort();
        }
    }
}

//! Leaf operators reading from storage, plus constant scalars.

pub mod literal;
pub mod matrix_selector;
pub mod range_functions;
pub mod vector_selector;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{check_cancelled, ExecutionResult};
use crate::labels::{Labels, Matcher};
use crate::storage::{Point, Queryable};

pub use literal::NumberLiteralOperator;
pub use matrix_selector::MatrixSelectorOperator;
pub use vector_selector::VectorSelectorOperator;

/// Series fetched once from storage for the whole query window.
pub(crate) struct LoadedSeries {
    pub labels: Vec<Labels>,
    pub points: Vec<Vec<Point>>,
}

pub(crate) async fn load_series(
    ctx: &CancellationToken,
    storage: &dyn Queryable,
    matchers: &[Matcher],
    mint: i64,
    maxt: i64,
) -> ExecutionResult<LoadedSeries> {
    check_cancelled(ctx)?;
    let selected = storage.select(mint, maxt, matchers).await?;
    debug!(series = selected.len(), mint, maxt, "selected series from storage");

    let mut labels = Vec::with_capacity(selected.len());
    let mut points = Vec::with_capacity(selected.len());
    for s in selected {
        labels.push(s.labels);
        points.push(s.points);
    }
    Ok(LoadedSeries { labels, points })
}

pub(crate) fn matchers_text(matchers: &[Matcher]) -> String {
    let parts: Vec<String> = matchers.iter().map(|m| m.to_string()).collect();
    format!("{{{}}}", parts.join(", "))
}

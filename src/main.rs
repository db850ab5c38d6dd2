use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vecql::labels::Labels;
use vecql::metrics;
use vecql::query::ast::Expr;
use vecql::query::engine::{Engine, EngineOpts};
use vecql::storage::MemTable;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true)
        .init();

    // Initialize metrics
    let metrics_addr = SocketAddr::from(([127, 0, 0, 1], 9090));
    if let Err(e) = metrics::init_metrics(metrics_addr) {
        eprintln!("Failed to initialize metrics: {}", e);
    } else {
        info!("Metrics server listening on {}", metrics_addr);
    }

    let storage = MemTable::new(100_000);
    for (job, instance, rate) in [("api", "a", 1.5), ("api", "b", 3.0), ("db", "c", 0.5)] {
        let labels = Labels::from_pairs([("__name__", "http_requests_total"), ("job", job), ("instance", instance)]);
        storage
            .insert_floats(&labels, (0..=60).map(|i| (i * 15_000, i as f64 * 15.0 * rate)))
            .await?;
    }
    info!(points = storage.size().await, "loaded demo series");

    let engine = Engine::new(Arc::new(storage), EngineOpts::default());
    let expr = Expr::aggregate(
        "sum",
        Expr::call(
            "rate",
            vec![Expr::range("http_requests_total", vec![], Duration::from_secs(60))],
        )?,
        &["job"],
        false,
    )?;
    let start = Utc.timestamp_opt(300, 0).single().ok_or("invalid start time")?;
    let end = Utc.timestamp_opt(900, 0).single().ok_or("invalid end time")?;
    let query = engine.new_range_query(&expr, start, end, Duration::from_secs(60))?;

    info!(id = %query.id(), "running demo query");
    println!("{}", expr);
    print!("{}", query.explain());
    let result = query.exec(&CancellationToken::new()).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

//! Stream consumer: binary entrypoint.
//! Loads configuration, starts logging/metrics and keeps the stream
//! subscription alive until the process is stopped.

use anyhow::Context;
use polarity_stream::config::AppConfig;
use polarity_stream::metrics::Metrics;
use polarity_stream::{build_pipeline, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();

    telemetry::init_tracing();

    // Missing credentials are the only reason not to start.
    let cfg = AppConfig::load().context("loading configuration")?;
    tracing::info!(
        track = ?cfg.stream.track,
        datasource = %cfg.delivery.datasource,
        max_wait_secs = cfg.flush.max_wait.as_secs(),
        max_records = cfg.flush.max_records,
        max_bytes = cfg.flush.max_bytes,
        "configuration loaded"
    );

    let metrics = Metrics::init()?;
    let _metrics_server = match cfg.metrics_addr {
        Some(addr) => Some(metrics.serve(addr).await?),
        None => None,
    };

    let manager = build_pipeline(&cfg)?;
    let stats = manager
        .run_until_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!(
        delivered = stats.records_delivered,
        dropped = stats.records_dropped,
        "stopped"
    );
    Ok(())
}

mod auth;
mod catalog;
mod config;
mod error;
mod evaluation;
mod handlers;
mod invoker;
mod metrics;
mod run;
mod template;
mod timeseries;
mod traces;

use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("evalrun=info".parse()?),
        )
        .init();

    let config = Arc::new(config::Config::from_env());
    config.print_banner();

    let catalog = Arc::new(match &config.catalog_path {
        Some(path) => catalog::Catalog::load_yaml(path)?,
        None => catalog::Catalog::new(),
    });

    let invoker = Arc::new(invoker::HttpInvoker::new(
        config.model_api_base.clone(),
        config.model_api_key.clone(),
        config.model_providers.clone(),
    )?);
    let limiter = invoker::ModelCallLimiter::new(config.max_concurrent_model_calls);
    let timeseries = Arc::new(timeseries::TimeSeriesSink::new(config.metrics_bucket_secs));
    let metrics_store = metrics::Metrics::new();

    let controller = Arc::new(run::RunController::new(
        catalog.clone(),
        invoker,
        limiter,
        metrics_store.clone(),
        timeseries.clone(),
        config.max_parallel_workers,
    ));

    let state = Arc::new(handlers::AppState {
        config: config.clone(),
        catalog,
        controller,
        traces: Arc::new(traces::TraceStore::new()),
        timeseries,
        metrics: metrics_store,
        started_at: chrono::Utc::now(),
    });

    let app = handlers::router(state);
    let addr = format!("0.0.0.0:{}", config.port);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, draining...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Shutdown complete");
    Ok(())
}

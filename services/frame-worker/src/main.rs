use anyhow::{Context, Result};
use frame_worker::{
    Config, ConversionPipeline, FfmpegExtractor, FrameWorker, S3ObjectStore, SqsQueue,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        queue = %config.sqs.queue_name,
        bucket = %config.s3.bucket,
        "Starting frame worker"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let queue = SqsQueue::new(&config.sqs).await;
    let store = S3ObjectStore::new(&config.s3).await;
    let extractor = FfmpegExtractor::new(config.extractor.clone());

    if let Err(e) = extractor.check_availability().await {
        warn!(error = %e, "Frame extraction tool is not available; conversions will fail");
    }

    let pipeline = ConversionPipeline::new(store, extractor, config.scratch_root());

    let mut worker = FrameWorker::new(queue, pipeline, config.sqs.queue_name.clone())
        .with_receive_error_backoff(config.receive_error_backoff());
    if let Some(ref dead_letter) = config.sqs.dead_letter_queue_name {
        worker = worker.with_dead_letter_queue(dead_letter.clone());
    }
    let worker = Arc::new(worker);

    // Spawn worker task
    let runner = worker.clone();
    let mut worker_handle = tokio::spawn(async move { runner.run().await });

    info!("Frame worker started successfully");

    tokio::select! {
        result = &mut worker_handle => {
            // The loop only ends on its own when the queue cannot be resolved
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("Frame worker stopped"),
                Err(e) => Err(e).context("Frame worker task failed"),
            };
        }
        _ = shutdown_signal() => {}
    }

    info!("Shutting down frame worker");

    // Let the message in flight finish
    worker.shutdown();
    match worker_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Frame worker error"),
        Err(e) => error!(error = %e, "Frame worker task failed"),
    }

    info!("Frame worker stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

use std::sync::Arc;

use anyhow::Context;
use genq_cloud::{LocalStorage, ObjectStorage, S3Storage};
use genq_comfyui::api::ComfyUIApi;
use genq_comfyui::client::ComfyUIClient;
use genq_core::workflow_graph::NodeCostTable;
use genq_worker::config::{StorageConfig, WorkerConfig};
use genq_worker::poller::JobPoller;
use genq_worker::processor::JobProcessor;
use genq_worker::workflow::WorkflowTemplate;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genq_worker=info,genq_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        comfyui = %config.comfyui_api_url,
        template = %config.workflow_template_path.display(),
        timeout_secs = config.generation_timeout.as_secs(),
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = genq_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    genq_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    genq_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    // --- Workflow and cost model ---
    let template = WorkflowTemplate::load(&config.workflow_template_path)?;
    let costs = NodeCostTable::default()
        .with_weight_overrides(config.node_weight_overrides.clone())
        .context("Invalid NODE_WEIGHT_OVERRIDES")?
        .with_label_overrides(config.stage_label_overrides.clone());

    // --- Storage ---
    let storage: Arc<dyn ObjectStorage> = match config.storage.clone() {
        StorageConfig::S3 {
            bucket,
            endpoint,
            public_base_url,
        } => Arc::new(S3Storage::connect(bucket, endpoint, public_base_url).await),
        StorageConfig::Local {
            path,
            public_base_url,
        } => {
            tracing::info!(path = %path.display(), "Using local storage");
            Arc::new(LocalStorage::new(path, public_base_url))
        }
    };

    let processor = JobProcessor::new(
        pool.clone(),
        ComfyUIApi::new(config.comfyui_api_url.clone()),
        ComfyUIClient::new(config.comfyui_ws_url.clone()),
        template,
        costs,
        storage,
        config.generation_timeout,
    );
    let poller = JobPoller::new(pool, processor, config.poll_interval);

    // --- Shutdown ---
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    poller.run(cancel).await;
    tracing::info!("Worker stopped");
    Ok(())
}

//! End-to-end processing of one generation job.
//!
//! Render the workflow, submit it to ComfyUI, track its progress into the
//! job row, then upload the outputs and record the outcome.

use std::sync::Arc;
use std::time::Duration;

use genq_cloud::{content_type_for, object_key, ObjectStorage, StorageError};
use genq_comfyui::api::{output_images, ComfyUIApi, ComfyUIApiError};
use genq_comfyui::client::{ComfyUIClient, ComfyUIClientError};
use genq_comfyui::execution::{run_execution, ExecutionError, ExecutionOutcome};
use genq_core::error::CoreError;
use genq_core::progress::{ChannelSink, ProgressTracker, ProgressUpdate};
use genq_core::types::DbId;
use genq_core::workflow_graph::{ExecutionGraph, NodeCostTable, WeightedGraph};
use genq_db::models::job::{GenerationJob, GenerationParams};
use genq_db::repositories::job_repo::ProgressRecord;
use genq_db::repositories::JobRepo;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::workflow::WorkflowTemplate;

/// Why a job failed. The `Display` text is stored as the job's error.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Invalid job parameters: {0}")]
    InvalidParameters(#[from] serde_json::Error),

    #[error("Invalid workflow: {0}")]
    Workflow(#[from] CoreError),

    #[error("Could not connect to ComfyUI: {0}")]
    Connect(#[from] ComfyUIClientError),

    #[error("ComfyUI request failed: {0}")]
    Api(#[from] ComfyUIApiError),

    #[error("Lost connection to ComfyUI: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation timed out after {0}s")]
    Timeout(u64),

    #[error("ComfyUI reported no output images")]
    NoOutputs,

    #[error("Upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Runs jobs against one ComfyUI instance, one at a time.
pub struct JobProcessor {
    pool: PgPool,
    api: ComfyUIApi,
    client: ComfyUIClient,
    template: WorkflowTemplate,
    costs: NodeCostTable,
    storage: Arc<dyn ObjectStorage>,
    timeout: Duration,
}

impl JobProcessor {
    pub fn new(
        pool: PgPool,
        api: ComfyUIApi,
        client: ComfyUIClient,
        template: WorkflowTemplate,
        costs: NodeCostTable,
        storage: Arc<dyn ObjectStorage>,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            api,
            client,
            template,
            costs,
            storage,
            timeout,
        }
    }

    /// Process a job already marked `Processing` and record its outcome.
    ///
    /// Only a failure to write the outcome itself is returned; everything
    /// else ends up on the job row.
    pub async fn handle(&self, job: &GenerationJob) -> Result<(), sqlx::Error> {
        match self.process(job).await {
            Ok(urls) => {
                tracing::info!(job_id = job.id, outputs = urls.len(), "Job completed");
                JobRepo::complete(&self.pool, job.id, &urls).await
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Job failed");
                JobRepo::fail(&self.pool, job.id, &e.to_string()).await
            }
        }
    }

    /// Run the job and return the public URLs of its outputs.
    pub async fn process(&self, job: &GenerationJob) -> Result<Vec<String>, ProcessError> {
        let params: GenerationParams = serde_json::from_value(job.parameters.clone())?;
        let rendered = self.template.render(&params);
        let graph = WeightedGraph::new(
            ExecutionGraph::from_workflow(&rendered.workflow)?,
            self.costs.clone(),
        );
        tracing::debug!(
            job_id = job.id,
            seed = rendered.seed,
            nodes = graph.node_count(),
            total_weight = graph.total_weight(),
            "Workflow rendered",
        );

        // Connect before submitting so no event for the prompt is missed.
        let mut conn = self.client.connect().await?;
        let submitted = self
            .api
            .submit_workflow(&rendered.workflow, &conn.client_id)
            .await?;
        let prompt_id = submitted.prompt_id;
        tracing::info!(
            job_id = job.id,
            prompt_id = %prompt_id,
            queue_position = submitted.number,
            "Workflow submitted to ComfyUI",
        );
        JobRepo::set_prompt_id(&self.pool, job.id, &prompt_id).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_progress_writer(self.pool.clone(), job.id, rx);
        let mut tracker = ProgressTracker::new(prompt_id.as_str(), graph, ChannelSink::new(tx));

        let result = tokio::time::timeout(
            self.timeout,
            run_execution(&mut conn.ws_stream, &mut tracker),
        )
        .await;
        let started = tracker.is_started();

        // Dropping the tracker closes the channel; wait for the last write.
        drop(tracker);
        if let Err(e) = writer.await {
            tracing::warn!(job_id = job.id, error = %e, "Progress writer task failed");
        }
        if let Err(e) = conn.ws_stream.close(None).await {
            tracing::debug!(job_id = job.id, error = %e, "Error closing ComfyUI WebSocket");
        }

        match result {
            Ok(Ok(ExecutionOutcome::Completed)) => {}
            Ok(Ok(ExecutionOutcome::Failed { error })) => {
                return Err(ProcessError::Generation(error));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => {
                self.abandon(job.id, &prompt_id, started).await;
                return Err(ProcessError::Timeout(self.timeout.as_secs()));
            }
        }

        self.upload_outputs(job.id, &prompt_id).await
    }

    /// Download every output image of a finished prompt and upload it.
    async fn upload_outputs(
        &self,
        job_id: DbId,
        prompt_id: &str,
    ) -> Result<Vec<String>, ProcessError> {
        let history = self.api.get_history(prompt_id).await?;
        let images = output_images(&history, prompt_id);
        if images.is_empty() {
            return Err(ProcessError::NoOutputs);
        }

        let mut urls = Vec::with_capacity(images.len());
        for image in &images {
            let bytes = self.api.download_output(image).await?;
            let key = object_key(job_id, &image.filename);
            let url = self
                .storage
                .put(&key, bytes, content_type_for(&image.filename))
                .await?;
            tracing::debug!(job_id, key = %key, url = %url, "Output uploaded");
            urls.push(url);
        }
        Ok(urls)
    }

    /// Stop a prompt that ran past the timeout.
    ///
    /// The prompt is removed from the queue; if it already started, the
    /// running execution is interrupted as well.
    async fn abandon(&self, job_id: DbId, prompt_id: &str, started: bool) {
        if let Err(e) = self.api.cancel_execution(prompt_id).await {
            tracing::warn!(job_id, prompt_id, error = %e, "Failed to dequeue timed-out prompt");
        }
        if started {
            if let Err(e) = self.api.interrupt().await {
                tracing::warn!(job_id, prompt_id, error = %e, "Failed to interrupt timed-out prompt");
            }
        }
    }
}

/// Persist tracker updates for `job_id` until the channel closes.
///
/// Updates that queue up behind a slow write are coalesced; only the most
/// recent one is written.
fn spawn_progress_writer(
    pool: PgPool,
    job_id: DbId,
    mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut update) = rx.recv().await {
            while let Ok(newer) = rx.try_recv() {
                update = newer;
            }
            let record = progress_record(&update);
            if let Err(e) = JobRepo::update_progress(&pool, job_id, &record).await {
                tracing::warn!(job_id, error = %e, "Failed to persist progress");
            }
        }
    })
}

fn progress_record(update: &ProgressUpdate) -> ProgressRecord<'_> {
    let secs = |v: i64| i32::try_from(v.max(0)).unwrap_or(i32::MAX);
    ProgressRecord {
        percent: i16::from(update.progress_percent),
        stage: &update.stage,
        elapsed_secs: secs(update.elapsed_secs),
        estimated_total_secs: secs(update.estimated_total_secs),
        estimated_remaining_secs: secs(update.estimated_remaining_secs),
    }
}

//! Generation job entity and its parameter payload.

use genq_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::status::StatusId;

/// A row from the `generation_jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationJob {
    pub id: DbId,
    pub status_id: StatusId,
    pub parameters: serde_json::Value,
    pub prompt_id: Option<String>,
    pub progress_percent: i16,
    pub progress_stage: Option<String>,
    pub elapsed_secs: i32,
    pub estimated_total_secs: i32,
    pub estimated_remaining_secs: i32,
    pub result_urls: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

/// User-supplied generation parameters stored in `generation_jobs.parameters`.
///
/// Only `prompt` is required; everything else falls back to the values
/// already present in the workflow template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub steps: Option<u32>,
}

//! Workflow template rendering.
//!
//! The template is a ComfyUI API-format workflow loaded once at startup.
//! Each job gets a copy with its prompt, size, seed and step count written
//! into the matching node inputs.

use std::path::Path;

use genq_core::error::CoreError;
use genq_core::workflow_graph::ExecutionGraph;
use genq_db::models::job::GenerationParams;
use rand::Rng;
use serde_json::Value;

/// Node types whose `seed`/`noise_seed` and `steps` inputs are set per job.
const SAMPLER_TYPES: &[&str] = &["KSampler", "KSamplerAdvanced", "SamplerCustom"];

const TEXT_ENCODE_TYPE: &str = "CLIPTextEncode";
const LATENT_TYPE: &str = "EmptyLatentImage";

/// Largest seed drawn when a job does not pin one. Kept within the range a
/// JSON number survives in JavaScript clients.
const MAX_RANDOM_SEED: u64 = (1 << 53) - 1;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow template {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Workflow template is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

/// A loaded workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    workflow: Value,
}

/// One job's workflow, ready to submit.
#[derive(Debug, Clone)]
pub struct RenderedWorkflow {
    pub workflow: Value,
    /// Seed written into the sampler nodes.
    pub seed: u64,
}

impl WorkflowTemplate {
    /// Read and validate a template file.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let raw = std::fs::read_to_string(path).map_err(|source| WorkflowError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_value(serde_json::from_str(&raw)?)
    }

    /// Validate a template already in memory.
    ///
    /// The template must parse as an execution graph and contain at least
    /// one text-encode node to receive the prompt.
    pub fn from_value(workflow: Value) -> Result<Self, WorkflowError> {
        let graph = ExecutionGraph::from_workflow(&workflow)?;
        if !graph.iter().any(|(_, node)| node.type_tag == TEXT_ENCODE_TYPE) {
            return Err(CoreError::Validation(format!(
                "Workflow template has no {TEXT_ENCODE_TYPE} node for the prompt"
            ))
            .into());
        }
        Ok(Self { workflow })
    }

    /// Write `params` into a copy of the template.
    ///
    /// Text-encode nodes are taken in node-id order: the first receives the
    /// prompt and the second the negative prompt. Values absent from
    /// `params` keep whatever the template holds, except the seed, which is
    /// drawn at random.
    pub fn render(&self, params: &GenerationParams) -> RenderedWorkflow {
        let seed = params
            .seed
            .unwrap_or_else(|| rand::rng().random_range(0..=MAX_RANDOM_SEED));

        let mut workflow = self.workflow.clone();
        let mut text_encoders = 0usize;

        for node_id in ordered_node_ids(&workflow) {
            let Some(node) = workflow.get_mut(&node_id) else {
                continue;
            };
            let class_type = node
                .get("class_type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
                continue;
            };

            match class_type.as_str() {
                TEXT_ENCODE_TYPE => {
                    match text_encoders {
                        0 => {
                            inputs.insert("text".into(), Value::from(params.prompt.as_str()));
                        }
                        1 => {
                            if let Some(negative) = &params.negative_prompt {
                                inputs.insert("text".into(), Value::from(negative.as_str()));
                            }
                        }
                        _ => {}
                    }
                    text_encoders += 1;
                }
                LATENT_TYPE => {
                    if let Some(width) = params.width {
                        inputs.insert("width".into(), Value::from(width));
                    }
                    if let Some(height) = params.height {
                        inputs.insert("height".into(), Value::from(height));
                    }
                }
                t if SAMPLER_TYPES.contains(&t) => {
                    let seed_key = if inputs.contains_key("noise_seed") {
                        "noise_seed"
                    } else {
                        "seed"
                    };
                    inputs.insert(seed_key.into(), Value::from(seed));
                    // SamplerCustom takes its steps from a separate scheduler node.
                    if let Some(steps) = params.steps.filter(|_| inputs.contains_key("steps")) {
                        inputs.insert("steps".into(), Value::from(steps));
                    }
                }
                _ => {}
            }
        }

        RenderedWorkflow { workflow, seed }
    }
}

/// Node ids sorted numerically, non-numeric ids last.
fn ordered_node_ids(workflow: &Value) -> Vec<String> {
    let mut ids: Vec<String> = workflow
        .as_object()
        .map(|nodes| nodes.keys().cloned().collect())
        .unwrap_or_default();
    ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), id.clone()));
    ids
}

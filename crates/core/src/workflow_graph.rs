//! Execution graph model for ComfyUI workflows.
//!
//! A submitted workflow is a flat map of node id to node descriptor. Each
//! node carries a type tag (`class_type` in ComfyUI's API format) which
//! selects its relative execution cost and a human-readable stage label
//! from a [`NodeCostTable`]. The progress tracker only ever looks nodes up
//! through a [`WeightedGraph`], which never fails: missing nodes and
//! unknown types degrade to a weight of 1 and a fallback label.

use std::collections::HashMap;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Separator between parent and child segments of a composite node id
/// (e.g. `"74:62"` for a node expanded from a sub-graph).
pub const COMPOSITE_ID_SEPARATOR: char = ':';

/// Weight assigned to node types that are absent from the cost table.
pub const DEFAULT_NODE_WEIGHT: u32 = 1;

/// Stage label used when a node has no usable type tag.
pub const PLACEHOLDER_STAGE_LABEL: &str = "Processing...";

/// Built-in relative execution costs, keyed by ComfyUI `class_type`.
///
/// Samplers dominate wall-clock time on typical text-to-image graphs;
/// model loading is the next largest cost on a cold server.
const BUILTIN_WEIGHTS: &[(&str, u32)] = &[
    ("KSampler", 60),
    ("KSamplerAdvanced", 60),
    ("SamplerCustom", 60),
    ("SamplerCustomAdvanced", 60),
    ("CheckpointLoaderSimple", 15),
    ("UNETLoader", 15),
    ("DualCLIPLoader", 6),
    ("CLIPLoader", 5),
    ("VAELoader", 3),
    ("LoraLoader", 4),
    ("UpscaleModelLoader", 3),
    ("ImageUpscaleWithModel", 12),
    ("VAEDecode", 8),
    ("VAEEncode", 4),
    ("CLIPTextEncode", 2),
    ("EmptyLatentImage", 1),
    ("LoadImage", 1),
    ("SaveImage", 3),
];

/// Built-in stage labels, keyed by ComfyUI `class_type`.
const BUILTIN_LABELS: &[(&str, &str)] = &[
    ("KSampler", "Generating image"),
    ("KSamplerAdvanced", "Generating image"),
    ("SamplerCustom", "Generating image"),
    ("SamplerCustomAdvanced", "Generating image"),
    ("CheckpointLoaderSimple", "Loading model"),
    ("UNETLoader", "Loading model"),
    ("DualCLIPLoader", "Loading text encoders"),
    ("CLIPLoader", "Loading text encoder"),
    ("VAELoader", "Loading VAE"),
    ("LoraLoader", "Applying LoRA"),
    ("UpscaleModelLoader", "Loading upscaler"),
    ("ImageUpscaleWithModel", "Upscaling image"),
    ("VAEDecode", "Decoding image"),
    ("VAEEncode", "Encoding image"),
    ("CLIPTextEncode", "Encoding prompt"),
    ("EmptyLatentImage", "Preparing latent"),
    ("LoadImage", "Loading input image"),
    ("SaveImage", "Saving image"),
];

// ---------------------------------------------------------------------------
// Node ids
// ---------------------------------------------------------------------------

/// Return the owning node id of a possibly composite id.
///
/// `"74:62"` belongs to node `"74"`; plain ids are returned unchanged.
pub fn normalize_node_id(node_id: &str) -> &str {
    match node_id.find(COMPOSITE_ID_SEPARATOR) {
        Some(idx) => &node_id[..idx],
        None => node_id,
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// One processing step of a workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeDescriptor {
    /// The node's type (ComfyUI `class_type`). Empty when the workflow
    /// entry did not declare one.
    pub type_tag: String,
    /// The node's declared inputs, kept verbatim.
    pub declared_inputs: serde_json::Map<String, serde_json::Value>,
}

/// Immutable description of a submitted workflow: node id -> descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionGraph {
    nodes: HashMap<String, NodeDescriptor>,
}

impl ExecutionGraph {
    /// Build a graph directly from node descriptors.
    pub fn new(nodes: HashMap<String, NodeDescriptor>) -> Self {
        Self { nodes }
    }

    /// Build a graph from a ComfyUI API-format workflow:
    /// `{"<id>": {"class_type": "...", "inputs": {...}}, ...}`.
    ///
    /// Entries without a `class_type` are kept with an empty type tag.
    /// Only a non-object top level is rejected.
    pub fn from_workflow(workflow: &serde_json::Value) -> Result<Self, CoreError> {
        let obj = workflow
            .as_object()
            .ok_or_else(|| CoreError::Validation("Workflow must be a JSON object".into()))?;

        let nodes = obj
            .iter()
            .map(|(id, entry)| {
                let type_tag = entry
                    .get("class_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let declared_inputs = entry
                    .get("inputs")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .unwrap_or_default();
                (
                    id.clone(),
                    NodeDescriptor {
                        type_tag,
                        declared_inputs,
                    },
                )
            })
            .collect();

        Ok(Self { nodes })
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Look up a node by id, normalizing composite ids first.
    pub fn node(&self, node_id: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(normalize_node_id(node_id))
    }

    /// Iterate over `(node_id, descriptor)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeDescriptor)> {
        self.nodes.iter()
    }
}

// ---------------------------------------------------------------------------
// Cost table
// ---------------------------------------------------------------------------

/// Hand-tuned per-type weights and stage labels.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCostTable {
    weights: HashMap<String, u32>,
    labels: HashMap<String, String>,
}

impl Default for NodeCostTable {
    fn default() -> Self {
        Self {
            weights: BUILTIN_WEIGHTS
                .iter()
                .map(|(t, w)| (t.to_string(), *w))
                .collect(),
            labels: BUILTIN_LABELS
                .iter()
                .map(|(t, l)| (t.to_string(), l.to_string()))
                .collect(),
        }
    }
}

impl NodeCostTable {
    /// Merge weight overrides into the table.
    ///
    /// Weights must be positive; a zero weight is rejected so that the
    /// total weight of a non-empty graph is never zero.
    pub fn with_weight_overrides(
        mut self,
        overrides: impl IntoIterator<Item = (String, u32)>,
    ) -> Result<Self, CoreError> {
        for (type_tag, weight) in overrides {
            if weight == 0 {
                return Err(CoreError::Validation(format!(
                    "Weight for node type '{type_tag}' must be positive"
                )));
            }
            self.weights.insert(type_tag, weight);
        }
        Ok(self)
    }

    /// Set or replace the stage label for a node type.
    pub fn with_label(mut self, type_tag: impl Into<String>, label: impl Into<String>) -> Self {
        self.labels.insert(type_tag.into(), label.into());
        self
    }

    /// Merge label overrides into the table.
    pub fn with_label_overrides(
        self,
        overrides: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        overrides
            .into_iter()
            .fold(self, |table, (type_tag, label)| table.with_label(type_tag, label))
    }

    /// Weight of a node type; unknown types weigh [`DEFAULT_NODE_WEIGHT`].
    pub fn weight(&self, type_tag: &str) -> u32 {
        self.weights
            .get(type_tag)
            .copied()
            .unwrap_or(DEFAULT_NODE_WEIGHT)
    }

    /// Stage label of a node type.
    ///
    /// Falls back to the raw type tag, or to [`PLACEHOLDER_STAGE_LABEL`]
    /// when the tag is empty.
    pub fn label(&self, type_tag: &str) -> String {
        if let Some(label) = self.labels.get(type_tag) {
            return label.clone();
        }
        if type_tag.trim().is_empty() {
            PLACEHOLDER_STAGE_LABEL.to_string()
        } else {
            type_tag.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Weighted graph
// ---------------------------------------------------------------------------

/// A graph bound to a cost table, with its total weight computed once.
#[derive(Debug, Clone)]
pub struct WeightedGraph {
    graph: ExecutionGraph,
    costs: NodeCostTable,
    total_weight: u64,
}

impl WeightedGraph {
    pub fn new(graph: ExecutionGraph, costs: NodeCostTable) -> Self {
        let total_weight = graph
            .iter()
            .map(|(_, node)| u64::from(costs.weight(&node.type_tag)))
            .sum();
        Self {
            graph,
            costs,
            total_weight,
        }
    }

    /// Sum of node weights across the whole graph.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Type tag of a node, or `None` if the node is not in the graph.
    pub fn type_of(&self, node_id: &str) -> Option<&str> {
        self.graph.node(node_id).map(|n| n.type_tag.as_str())
    }

    /// Weight of a node; nodes outside the graph weigh [`DEFAULT_NODE_WEIGHT`].
    pub fn weight_of(&self, node_id: &str) -> u32 {
        match self.type_of(node_id) {
            Some(type_tag) => self.costs.weight(type_tag),
            None => DEFAULT_NODE_WEIGHT,
        }
    }

    /// Stage label of a node; nodes outside the graph get the placeholder.
    pub fn stage_label_of(&self, node_id: &str) -> String {
        self.costs.label(self.type_of(node_id).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Typed view of the JSON frames ComfyUI pushes over its WebSocket.
//!
//! Every frame is `{"type": "<kind>", "data": {...}}`. Only the kinds that
//! matter for tracking a prompt are modelled; anything else (custom-node
//! broadcasts, system monitors) fails to parse and is skipped upstream.

use serde::de::IgnoredAny;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    /// Queue broadcast. Its content is not needed.
    Status(IgnoredAny),
    ExecutionStart(PromptRef),
    ExecutionCached(CachedNodes),
    /// `node: None` means the prompt has finished.
    Executing(ExecutingNode),
    /// Sampler step counter.
    Progress(StepCounter),
    /// Sent for output nodes only.
    Executed(NodeOutput),
    ExecutionSuccess(PromptRef),
    ExecutionInterrupted(Interruption),
    ExecutionError(ExecutionFailure),
}

/// Payload that only names the prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedNodes {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingNode {
    pub node: Option<String>,
    /// Missing on old ComfyUI builds.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepCounter {
    pub value: u32,
    pub max: u32,
    /// `prompt_id` and `node` are only sent by newer builds.
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeOutput {
    pub node: String,
    pub prompt_id: String,
    /// Images, text or whatever the node returned, untouched.
    #[serde(default)]
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interruption {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionFailure {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

impl ExecutionFailure {
    /// One line for the job's error column, e.g.
    /// `RuntimeError: out of memory (node 5, KSampler)`.
    pub fn describe(&self) -> String {
        let message = self.exception_message.trim();
        let mut out = if self.exception_type.is_empty() {
            message.to_string()
        } else {
            format!("{}: {message}", self.exception_type)
        };
        match (&self.node_id, &self.node_type) {
            (Some(id), Some(ty)) => out.push_str(&format!(" (node {id}, {ty})")),
            (Some(id), None) => out.push_str(&format!(" (node {id})")),
            _ => {}
        }
        out
    }
}

/// Parse one text frame.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

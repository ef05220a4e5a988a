//! Translation of ComfyUI WebSocket messages into tracker events.
//!
//! ComfyUI only sends `executed` for output nodes; every other node's
//! completion is implied by the next `executing` message. The translator
//! remembers the node currently executing for its prompt and closes it
//! when the next one starts or the prompt finishes.

use genq_core::progress::{ExecutionEvent, ExecutionEventKind};

use crate::messages::ComfyUIMessage;

/// Stateful translator bound to one submitted prompt.
#[derive(Debug, Clone)]
pub struct MessageTranslator {
    prompt_id: String,
    executing: Option<String>,
}

impl MessageTranslator {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            executing: None,
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Turn one message into zero or more tracker events.
    ///
    /// Messages for other prompts are passed through with their own prompt
    /// id (the tracker ignores them) and never touch translator state.
    pub fn translate(&mut self, message: &ComfyUIMessage) -> Vec<ExecutionEvent> {
        match message {
            ComfyUIMessage::Status(_) => Vec::new(),

            ComfyUIMessage::ExecutionStart(data) => {
                if self.owns(&data.prompt_id) {
                    self.executing = None;
                }
                vec![ExecutionEvent::new(
                    &data.prompt_id,
                    ExecutionEventKind::ExecutionStarted,
                )]
            }

            ComfyUIMessage::ExecutionCached(data) => vec![ExecutionEvent::new(
                &data.prompt_id,
                ExecutionEventKind::NodesCached(data.nodes.clone()),
            )],

            ComfyUIMessage::Executing(data) => {
                // Older builds omit the prompt id; assume it is ours.
                let prompt_id = data
                    .prompt_id
                    .clone()
                    .unwrap_or_else(|| self.prompt_id.clone());
                if !self.owns(&prompt_id) {
                    return match &data.node {
                        Some(node) => vec![ExecutionEvent::new(
                            prompt_id,
                            ExecutionEventKind::NodeExecuting(node.clone()),
                        )],
                        None => vec![ExecutionEvent::new(
                            prompt_id,
                            ExecutionEventKind::ExecutionCompleted,
                        )],
                    };
                }

                let mut events = self.close_executing(data.node.as_deref());
                match &data.node {
                    Some(node) => {
                        self.executing = Some(node.clone());
                        events.push(self.event(ExecutionEventKind::NodeExecuting(node.clone())));
                    }
                    None => events.push(self.event(ExecutionEventKind::ExecutionCompleted)),
                }
                events
            }

            ComfyUIMessage::Progress(data) => {
                let kind = ExecutionEventKind::StepProgress {
                    current: data.value,
                    max: data.max,
                    node_id: data.node.clone(),
                };
                vec![match &data.prompt_id {
                    Some(prompt_id) => ExecutionEvent::new(prompt_id, kind),
                    None => ExecutionEvent::unaddressed(kind),
                }]
            }

            ComfyUIMessage::Executed(data) => {
                if self.owns(&data.prompt_id)
                    && self.executing.as_deref() == Some(data.node.as_str())
                {
                    self.executing = None;
                }
                vec![ExecutionEvent::new(
                    &data.prompt_id,
                    ExecutionEventKind::NodeExecuted(data.node.clone()),
                )]
            }

            ComfyUIMessage::ExecutionSuccess(data) => {
                let mut events = if self.owns(&data.prompt_id) {
                    self.close_executing(None)
                } else {
                    Vec::new()
                };
                events.push(ExecutionEvent::new(
                    &data.prompt_id,
                    ExecutionEventKind::ExecutionCompleted,
                ));
                events
            }

            ComfyUIMessage::ExecutionInterrupted(data) => {
                let message = match &data.node_id {
                    Some(node) => format!("Execution interrupted at node {node}"),
                    None => "Execution interrupted".to_string(),
                };
                vec![ExecutionEvent::new(
                    &data.prompt_id,
                    ExecutionEventKind::ExecutionError { message },
                )]
            }

            ComfyUIMessage::ExecutionError(data) => vec![ExecutionEvent::new(
                &data.prompt_id,
                ExecutionEventKind::ExecutionError {
                    message: data.describe(),
                },
            )],
        }
    }

    // ---- private helpers ----

    fn owns(&self, prompt_id: &str) -> bool {
        prompt_id == self.prompt_id
    }

    fn event(&self, kind: ExecutionEventKind) -> ExecutionEvent {
        ExecutionEvent::new(&self.prompt_id, kind)
    }

    /// Report the currently executing node as done, unless `next` is the
    /// same node being re-announced.
    fn close_executing(&mut self, next: Option<&str>) -> Vec<ExecutionEvent> {
        match self.executing.take() {
            Some(prev) if Some(prev.as_str()) != next => {
                vec![self.event(ExecutionEventKind::NodeExecuted(prev))]
            }
            Some(prev) => {
                self.executing = Some(prev);
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

//! Per-submission WebSocket processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them into
//! typed [`ComfyUIMessage`] variants, translates them into tracker events
//! and drives a [`ProgressTracker`] until the prompt completes or fails.
//!
//! The loop has no timeout of its own; callers wrap it in
//! `tokio::time::timeout` and give up on the submission when it expires.

use futures::{Stream, StreamExt};
use genq_core::progress::{EventDisposition, ProgressSink, ProgressTracker};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::messages::parse_message;
use crate::translate::MessageTranslator;

/// How a submission ended, as reported by ComfyUI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// ComfyUI reported the prompt finished.
    Completed,
    /// ComfyUI reported an execution error or interruption.
    Failed { error: String },
}

/// Transport failures that end the loop before ComfyUI reports an outcome.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The socket closed (or the stream ended) mid-execution.
    #[error("WebSocket closed before prompt {0} finished")]
    ConnectionClosed(String),

    /// Reading from the socket failed.
    #[error("WebSocket receive error: {0}")]
    Receive(#[from] tungstenite::Error),
}

/// Process WebSocket messages until the tracked prompt reaches an outcome.
///
/// Each text frame is parsed via [`parse_message`]; unparseable frames are
/// logged and skipped. Binary frames (preview images) are ignored.
pub async fn run_execution<St, S>(
    ws_stream: &mut St,
    tracker: &mut ProgressTracker<S>,
) -> Result<ExecutionOutcome, ExecutionError>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    S: ProgressSink,
{
    let mut translator = MessageTranslator::new(tracker.submission_id());

    while let Some(msg_result) = ws_stream.next().await {
        match msg_result? {
            Message::Text(text) => {
                if let Some(outcome) = handle_text_message(&text, &mut translator, tracker) {
                    return Ok(outcome);
                }
            }
            Message::Binary(_) => {
                tracing::trace!(
                    prompt_id = %translator.prompt_id(),
                    "Ignoring binary message (preview image)",
                );
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Handled automatically by tungstenite.
            }
            Message::Close(frame) => {
                tracing::info!(prompt_id = %translator.prompt_id(), ?frame, "ComfyUI WebSocket closed");
                break;
            }
            Message::Frame(_) => {}
        }
    }

    Err(ExecutionError::ConnectionClosed(
        translator.prompt_id().to_string(),
    ))
}

/// Feed one text frame through the translator and tracker.
///
/// Returns the outcome once the tracker completes or the prompt fails.
fn handle_text_message<S: ProgressSink>(
    text: &str,
    translator: &mut MessageTranslator,
    tracker: &mut ProgressTracker<S>,
) -> Option<ExecutionOutcome> {
    let message = match parse_message(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, raw_message = %text, "Skipping unrecognised ComfyUI message");
            return None;
        }
    };

    for event in translator.translate(&message) {
        match tracker.handle(event) {
            EventDisposition::Ignored => {}
            EventDisposition::Progress(update) => {
                tracing::debug!(
                    prompt_id = %translator.prompt_id(),
                    percent = update.progress_percent,
                    stage = %update.stage,
                    eta_secs = update.estimated_remaining_secs,
                    "Generation progress",
                );
            }
            EventDisposition::Completed(update) => {
                tracing::info!(
                    prompt_id = %translator.prompt_id(),
                    elapsed_secs = update.elapsed_secs,
                    "Execution completed",
                );
                return Some(ExecutionOutcome::Completed);
            }
            EventDisposition::Failed(error) => {
                tracing::error!(
                    prompt_id = %translator.prompt_id(),
                    error = %error,
                    "Execution error",
                );
                return Some(ExecutionOutcome::Failed { error });
            }
        }
    }

    None
}

//! HTTP side of a ComfyUI instance: queueing prompts, dequeuing and
//! interrupting them, and fetching their outputs once finished.

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone)]
pub struct ComfyUIApi {
    http: reqwest::Client,
    base_url: String,
}

/// Body of a successful `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position at submission time.
    #[serde(default)]
    pub number: i32,
}

/// An image written by an output node, as listed in `/history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx answer. `body` is kept verbatim; for rejected prompts it
    /// holds ComfyUI's `node_errors` report.
    #[error("ComfyUI answered {status}: {body}")]
    Status { status: u16, body: String },
}

impl ComfyUIApi {
    /// * `api_url` - e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Queue a workflow. `client_id` must be the id the WebSocket was
    /// opened with, or ComfyUI sends the prompt's events to nobody.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let request = self
            .http
            .post(self.endpoint("prompt"))
            .json(&json!({ "prompt": workflow, "client_id": client_id }));
        read_json(send(request).await?).await
    }

    /// Drop a prompt that has not started yet.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let request = self
            .http
            .post(self.endpoint("queue"))
            .json(&json!({ "delete": [prompt_id] }));
        send(request).await.map(drop)
    }

    /// Stop whatever is executing right now; ComfyUI offers no per-prompt
    /// interrupt.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        send(self.http.post(self.endpoint("interrupt")))
            .await
            .map(drop)
    }

    /// `GET /history/{prompt_id}`: per-node outputs keyed by prompt id.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        let request = self.http.get(self.endpoint(&format!("history/{prompt_id}")));
        read_json(send(request).await?).await
    }

    /// Raw bytes of an output image, via `GET /view`.
    pub async fn download_output(&self, image: &OutputImage) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.http.get(self.endpoint("view")).query(&[
            ("filename", image.filename.as_str()),
            ("subfolder", image.subfolder.as_str()),
            ("type", image.folder_type.as_str()),
        ]);
        let bytes = send(request).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

/// Send a request and turn non-2xx answers into [`ComfyUIApiError::Status`].
async fn send(request: RequestBuilder) -> Result<Response, ComfyUIApiError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = match response.text().await {
        Ok(text) => text,
        Err(e) => format!("<body unavailable: {e}>"),
    };
    Err(ComfyUIApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ComfyUIApiError> {
    Ok(response.json::<T>().await?)
}

/// Collect the `output`-folder images listed in a `/history/{prompt_id}`
/// response.
///
/// Preview images (`type: "temp"`) are skipped. Node order follows the
/// numeric node id so results are stable across calls.
pub fn output_images(history: &Value, prompt_id: &str) -> Vec<OutputImage> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };

    let mut node_ids: Vec<&String> = outputs.keys().collect();
    node_ids.sort_by_key(|id| (id.parse::<u64>().unwrap_or(u64::MAX), id.to_string()));

    node_ids
        .into_iter()
        .filter_map(|id| outputs[id].get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|img| serde_json::from_value::<OutputImage>(img.clone()).ok())
        .filter(|img| img.folder_type == "output")
        .collect()
}

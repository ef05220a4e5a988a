//! WebSocket side of a ComfyUI instance.

use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type ComfyUIStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens event sockets against one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// An open event socket and the client id ComfyUI knows it by.
pub struct ComfyUIConnection {
    /// Prompts must be submitted with this id for their events to arrive
    /// on `ws_stream`.
    pub client_id: String,
    pub ws_stream: ComfyUIStream,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("WebSocket handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
}

impl ComfyUIClient {
    /// * `ws_url` - e.g. `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url: ws_url.trim_end_matches('/').to_string(),
        }
    }

    /// Open a socket under a fresh UUID v4 client id.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (ws_stream, _response) = connect_async(self.socket_url(&client_id))
            .await
            .map_err(|source| ComfyUIClientError::Handshake {
                url: self.ws_url.clone(),
                source,
            })?;

        tracing::info!(client_id = %client_id, url = %self.ws_url, "Connected to ComfyUI");
        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }

    fn socket_url(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={client_id}", self.ws_url)
    }
}

// ABOUTME: RpcChannel abstraction over the four server transports plus shared request bookkeeping.
// ABOUTME: PendingRequests routes responses arriving on a reader task back to the awaiting caller.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

pub use self::http::HttpChannel;
pub use self::sse::SseChannel;
pub use self::stdio::StdioChannel;
pub use self::websocket::WebSocketChannel;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered HTTP {status}: {body}")]
    HttpStatus {
        status: ::http::StatusCode,
        body: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("'{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("channel is not open")]
    NotOpen,

    #[error("channel closed before a response arrived")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(err))
    }
}

/// A bidirectional JSON-RPC pipe to one server.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Establish the underlying transport. Called once before any request.
    async fn open(&self) -> Result<(), TransportError>;

    /// Send a request and wait for the response carrying the same id.
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError>;

    /// Release the transport. Safe to call on a channel that never opened.
    async fn close(&self) -> Result<(), TransportError>;
}

type Waiters = HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>;

/// In-flight requests keyed by JSON-RPC id.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingRequests {
    waiters: Arc<Mutex<Waiters>>,
}

impl PendingRequests {
    /// Register interest in a response. The guard unregisters the id when dropped,
    /// so an abandoned request leaves nothing behind.
    pub(crate) fn register(&self, id: RequestId) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), tx);
        PendingResponse {
            id,
            rx,
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// Deliver a response to its waiter. Returns false when nobody is waiting.
    pub(crate) fn resolve(&self, response: JsonRpcResponse) -> bool {
        match self.lock().remove(&response.id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; each sees `TransportError::Closed`.
    pub(crate) fn fail_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<JsonRpcResponse>,
    waiters: Arc<Mutex<Waiters>>,
}

impl PendingResponse {
    pub(crate) async fn wait(mut self) -> Result<JsonRpcResponse, TransportError> {
        (&mut self.rx).await.map_err(|_| TransportError::Closed)
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&self.id);
        }
    }
}

/// Dispatch one decoded frame. Responses go to their waiters; a server-initiated request
/// yields the answer the caller must send back.
pub(crate) fn route_incoming(
    server_id: &str,
    pending: &PendingRequests,
    message: crate::protocol::IncomingMessage,
) -> Option<JsonRpcResponse> {
    use crate::protocol::{IncomingMessage, answer_server_request};

    match message {
        IncomingMessage::Response(response) => {
            let id = response.id.clone();
            if !pending.resolve(response) {
                tracing::debug!(server = %server_id, id = %id, "response for unknown or abandoned request");
            }
            None
        }
        IncomingMessage::Request(request) => {
            tracing::debug!(server = %server_id, method = %request.method, "server request");
            Some(answer_server_request(&request))
        }
        IncomingMessage::Notification(notification) => {
            tracing::debug!(server = %server_id, method = %notification.method, "server notification");
            None
        }
    }
}

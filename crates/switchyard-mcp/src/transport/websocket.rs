// ABOUTME: WebSocket transport: one JSON-RPC message per text frame over a ws:// or wss:// connection.
// ABOUTME: Requests the "mcp" subprotocol; a reader task routes frames until the socket closes.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{PendingRequests, RpcChannel, TransportError, route_incoming};
use crate::protocol::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct OpenSocket {
    sink: Arc<Mutex<WsSink>>,
    reader: JoinHandle<()>,
}

pub struct WebSocketChannel {
    server_id: String,
    url: String,
    pending: PendingRequests,
    socket: Mutex<Option<OpenSocket>>,
}

impl WebSocketChannel {
    pub fn new(server_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            url: url.into(),
            pending: PendingRequests::default(),
            socket: Mutex::new(None),
        }
    }

    async fn sink(&self) -> Result<Arc<Mutex<WsSink>>, TransportError> {
        self.socket
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.sink))
            .ok_or(TransportError::NotOpen)
    }
}

async fn send_json<T: serde::Serialize>(sink: &Mutex<WsSink>, message: &T) -> Result<(), TransportError> {
    let text = serde_json::to_string(message)?;
    sink.lock().await.send(Message::text(text)).await?;
    Ok(())
}

#[async_trait]
impl RpcChannel for WebSocketChannel {
    async fn open(&self) -> Result<(), TransportError> {
        let mut slot = self.socket.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            ::http::header::SEC_WEBSOCKET_PROTOCOL,
            ::http::HeaderValue::from_static("mcp"),
        );
        let (stream, _response) = connect_async(request).await?;
        let (sink, mut source) = stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let reader = {
            let server_id = self.server_id.clone();
            let pending = self.pending.clone();
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(server = %server_id, error = %e, "websocket read failed");
                            break;
                        }
                    };
                    let message = match IncomingMessage::parse(text.as_str()) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(server = %server_id, error = %e, "unparseable websocket frame");
                            continue;
                        }
                    };
                    if let Some(reply) = route_incoming(&server_id, &pending, message)
                        && let Err(e) = send_json(&sink, &reply).await
                    {
                        tracing::warn!(server = %server_id, error = %e, "failed to answer server request");
                    }
                }
                tracing::debug!(server = %server_id, "websocket closed");
                pending.fail_all();
            })
        };

        tracing::debug!(server = %self.server_id, url = %self.url, "websocket connected");
        *slot = Some(OpenSocket { sink, reader });
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let sink = self.sink().await?;
        let waiter = self.pending.register(request.id.clone());
        send_json(&sink, &request).await?;
        waiter.wait().await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        let sink = self.sink().await?;
        send_json(&sink, &notification).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(socket) = self.socket.lock().await.take() else {
            return Ok(());
        };
        let result = socket.sink.lock().await.close().await;
        socket.reader.abort();
        self.pending.fail_all();
        result.map_err(TransportError::from)
    }
}

// ABOUTME: SSE transport: responses arrive on a long-lived event stream, requests are POSTed separately.
// ABOUTME: The server announces the POST target in an "endpoint" event before anything else.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use super::{PendingRequests, RpcChannel, TransportError, route_incoming};
use crate::protocol::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::sse::SseDecoder;

struct OpenStream {
    endpoint: Url,
    reader: JoinHandle<()>,
}

pub struct SseChannel {
    server_id: String,
    url: String,
    http: reqwest::Client,
    pending: PendingRequests,
    stream: Mutex<Option<OpenStream>>,
}

impl SseChannel {
    pub fn new(server_id: impl Into<String>, url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            server_id: server_id.into(),
            url: url.into(),
            http,
            pending: PendingRequests::default(),
            stream: Mutex::new(None),
        }
    }

    async fn endpoint(&self) -> Result<Url, TransportError> {
        self.stream
            .lock()
            .await
            .as_ref()
            .map(|s| s.endpoint.clone())
            .ok_or(TransportError::NotOpen)
    }

    async fn post<T: serde::Serialize>(&self, body: &T) -> Result<(), TransportError> {
        let endpoint = self.endpoint().await?;
        post_json(&self.http, endpoint, body).await
    }
}

async fn post_json<T: serde::Serialize>(
    http: &reqwest::Client,
    endpoint: Url,
    body: &T,
) -> Result<(), TransportError> {
    let response = http.post(endpoint).json(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::HttpStatus { status, body });
    }
    Ok(())
}

#[async_trait]
impl RpcChannel for SseChannel {
    async fn open(&self) -> Result<(), TransportError> {
        let mut slot = self.stream.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus { status, body });
        }
        let base = response.url().clone();

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Result<Url, String>>();
        let reader = {
            let server_id = self.server_id.clone();
            let pending = self.pending.clone();
            let http = self.http.clone();
            let mut body = response.bytes_stream();
            tokio::spawn(async move {
                let mut decoder = SseDecoder::new();
                let mut endpoint_tx = Some(endpoint_tx);
                let mut endpoint: Option<Url> = None;

                while let Some(chunk) = body.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            tracing::warn!(server = %server_id, error = %e, "event stream read failed");
                            break;
                        }
                    };
                    for event in decoder.push(&chunk) {
                        if event.event == "endpoint" {
                            let resolved = base.join(event.data.trim()).map_err(|e| e.to_string());
                            if let Ok(url) = &resolved {
                                endpoint = Some(url.clone());
                            }
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(resolved);
                            }
                            continue;
                        }
                        if event.event != "message" {
                            continue;
                        }
                        let message = match IncomingMessage::parse(&event.data) {
                            Ok(message) => message,
                            Err(e) => {
                                tracing::warn!(server = %server_id, error = %e, "unparseable event data");
                                continue;
                            }
                        };
                        if let Some(reply) = route_incoming(&server_id, &pending, message)
                            && let Some(target) = endpoint.clone()
                            && let Err(e) = post_json(&http, target, &reply).await
                        {
                            tracing::warn!(server = %server_id, error = %e, "failed to answer server request");
                        }
                    }
                }
                tracing::debug!(server = %server_id, "event stream ended");
                pending.fail_all();
            })
        };

        let endpoint = match endpoint_rx.await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(e)) => {
                reader.abort();
                return Err(TransportError::Protocol(format!("invalid endpoint event: {}", e)));
            }
            Err(_) => {
                reader.abort();
                return Err(TransportError::Protocol(
                    "event stream ended before announcing an endpoint".into(),
                ));
            }
        };

        tracing::debug!(server = %self.server_id, endpoint = %endpoint, "sse stream open");
        *slot = Some(OpenStream { endpoint, reader });
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let waiter = self.pending.register(request.id.clone());
        self.post(&request).await?;
        waiter.wait().await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        self.post(&notification).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.lock().await.take() {
            stream.reader.abort();
            self.pending.fail_all();
        }
        Ok(())
    }
}

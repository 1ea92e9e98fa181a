// ABOUTME: Streamable HTTP transport: every message is a POST; the reply is JSON or a short event stream.
// ABOUTME: Tracks the Mcp-Session-Id header and ends the session with DELETE on close.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use tokio::sync::RwLock;

use super::{RpcChannel, TransportError};
use crate::protocol::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::sse::SseDecoder;

pub const SESSION_HEADER: &str = "mcp-session-id";

pub struct HttpChannel {
    server_id: String,
    url: String,
    http: reqwest::Client,
    session: RwLock<Option<String>>,
}

impl HttpChannel {
    pub fn new(server_id: impl Into<String>, url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            server_id: server_id.into(),
            url: url.into(),
            http,
            session: RwLock::new(None),
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.read().await.clone()
    }

    async fn post<T: serde::Serialize>(&self, body: &T) -> Result<reqwest::Response, TransportError> {
        let mut builder = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session.read().await.as_deref() {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus { status, body });
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session.write().await;
            if slot.as_deref() != Some(session) {
                tracing::debug!(server = %self.server_id, session = %session, "session assigned");
                *slot = Some(session.to_string());
            }
        }
        Ok(response)
    }

    /// Read an event-stream reply until the response for `id` shows up.
    async fn read_streamed(
        &self,
        response: reqwest::Response,
        id: &RequestId,
    ) -> Result<JsonRpcResponse, TransportError> {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            for event in decoder.push(&chunk?) {
                if event.event != "message" {
                    continue;
                }
                match IncomingMessage::parse(&event.data) {
                    Ok(IncomingMessage::Response(response)) if &response.id == id => return Ok(response),
                    Ok(other) => {
                        tracing::debug!(server = %self.server_id, message = ?other, "ignoring streamed message");
                    }
                    Err(e) => {
                        tracing::warn!(server = %self.server_id, error = %e, "unparseable event data");
                    }
                }
            }
        }
        Err(TransportError::Closed)
    }
}

fn is_event_stream(content_type: Option<&HeaderValue>) -> bool {
    content_type
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

#[async_trait]
impl RpcChannel for HttpChannel {
    async fn open(&self) -> Result<(), TransportError> {
        // Nothing to establish until the first POST
        Ok(())
    }

    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let response = self.post(&request).await?;
        if is_event_stream(response.headers().get(CONTENT_TYPE)) {
            return self.read_streamed(response, &request.id).await;
        }

        let value: serde_json::Value = response.json().await?;
        match IncomingMessage::from_value(value)? {
            IncomingMessage::Response(response) if response.id == request.id => Ok(response),
            other => Err(TransportError::Protocol(format!(
                "expected response to request {}, got {:?}",
                request.id, other
            ))),
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        self.post(&notification).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        let response = self
            .http
            .delete(&self.url)
            .header(SESSION_HEADER, &session)
            .send()
            .await?;
        let status = response.status();
        // Servers may refuse client-initiated termination
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            tracing::debug!(server = %self.server_id, %status, "session ended");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::HttpStatus { status, body })
        }
    }
}

// ABOUTME: ServerClient trait plus McpClient, the protocol client that runs over any RpcChannel.
// ABOUTME: Connector turns a ServerDescriptor into a fresh, unconnected client for each attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use switchyard_core::{ServerDescriptor, ToolResult, ToolSpec, TransportParams};

use crate::protocol::{
    InitializeResult, JsonRpcNotification, JsonRpcRequest, ListToolsResult, initialize_params,
};
use crate::transport::{
    HttpChannel, RpcChannel, SseChannel, StdioChannel, TransportError, WebSocketChannel,
};

/// Operations the registry and aggregator need from one server.
#[async_trait]
pub trait ServerClient: Send + Sync {
    /// Open the transport and complete the protocol handshake.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub struct McpClient<C> {
    server_id: String,
    channel: C,
    next_id: AtomicU64,
    request_timeout: Option<Duration>,
    server_info: Mutex<Option<InitializeResult>>,
}

impl<C: RpcChannel> McpClient<C> {
    pub fn new(server_id: impl Into<String>, channel: C) -> Self {
        Self {
            server_id: server_id.into(),
            channel,
            next_id: AtomicU64::new(1),
            request_timeout: None,
            server_info: Mutex::new(None),
        }
    }

    /// Bound every request by `timeout`. Without one, requests wait indefinitely.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Handshake result, available once connected.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.lock().await.clone()
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let exchange = self.channel.request(request);

        let response = match self.request_timeout {
            Some(after) => tokio::time::timeout(after, exchange)
                .await
                .map_err(|_| TransportError::Timeout {
                    method: method.to_string(),
                    after,
                })??,
            None => exchange.await?,
        };

        if let Some(error) = response.error {
            return Err(TransportError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl<C: RpcChannel> ServerClient for McpClient<C> {
    async fn connect(&self) -> Result<(), TransportError> {
        self.channel.open().await?;

        let raw = self
            .call("initialize", Some(initialize_params(&self.server_id)))
            .await?;
        let info: InitializeResult = serde_json::from_value(raw)?;
        tracing::debug!(
            server = %self.server_id,
            remote = %info.server_info.name,
            protocol = %info.protocol_version,
            "handshake complete"
        );
        *self.server_info.lock().await = Some(info);

        self.channel
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult = serde_json::from_value(self.call("tools/list", params).await?)?;
            tools.extend(page.tools.into_iter().map(ToolSpec::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, TransportError> {
        let raw = self
            .call(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.close().await
    }
}

/// Builds clients from descriptors. Each call yields an independent, unconnected client.
pub trait Connector: Send + Sync {
    fn client_for(&self, descriptor: &ServerDescriptor) -> Arc<dyn ServerClient>;
}

/// Connector for the four built-in transports.
#[derive(Debug, Clone, Default)]
pub struct TransportConnector {
    http: reqwest::Client,
    request_timeout: Option<Duration>,
}

impl TransportConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn wrap<C: RpcChannel + 'static>(&self, id: &str, channel: C) -> Arc<dyn ServerClient> {
        Arc::new(McpClient::new(id, channel).with_request_timeout(self.request_timeout))
    }
}

impl Connector for TransportConnector {
    fn client_for(&self, descriptor: &ServerDescriptor) -> Arc<dyn ServerClient> {
        let id = descriptor.id();
        match descriptor.transport() {
            TransportParams::Stdio { command, args, env } => self.wrap(
                id,
                StdioChannel::new(id, command.clone(), args.clone(), env.clone()),
            ),
            TransportParams::WebSocket { url } => self.wrap(id, WebSocketChannel::new(id, url.clone())),
            TransportParams::Sse { url } => self.wrap(id, SseChannel::new(id, url.clone(), self.http.clone())),
            TransportParams::Http { url } => self.wrap(id, HttpChannel::new(id, url.clone(), self.http.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcResponse, RequestId};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Channel that answers requests from a script and records what it saw.
    #[derive(Default)]
    struct ScriptedChannel {
        replies: StdMutex<VecDeque<Value>>,
        requests: StdMutex<Vec<JsonRpcRequest>>,
        notifications: StdMutex<Vec<String>>,
        stall: bool,
    }

    impl ScriptedChannel {
        fn with_replies(replies: Vec<Value>) -> Self {
            Self {
                replies: StdMutex::new(replies.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RpcChannel for ScriptedChannel {
        async fn open(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            let id = request.id.clone();
            self.requests.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Value::Null);
            if let Some(message) = reply.get("error_message").and_then(|m| m.as_str()) {
                return Ok(JsonRpcResponse::failure(id, -32000, message));
            }
            Ok(JsonRpcResponse::success(id, reply))
        }

        async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
            self.notifications.lock().unwrap().push(notification.method);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn connect_performs_handshake_then_notifies() {
        let channel = ScriptedChannel::with_replies(vec![json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "files", "version": "1.0"}
        })]);
        let client = McpClient::new("files", channel);
        client.connect().await.unwrap();

        let requests = client.channel.requests.lock().unwrap();
        assert_eq!(requests[0].method, "initialize");
        assert_eq!(requests[0].params.as_ref().unwrap()["clientInfo"]["name"], "switchyard-files");
        assert_eq!(
            *client.channel.notifications.lock().unwrap(),
            vec!["notifications/initialized".to_string()]
        );
        drop(requests);
        assert_eq!(client.server_info().await.unwrap().server_info.name, "files");
    }

    #[tokio::test]
    async fn list_tools_follows_cursor() {
        let channel = ScriptedChannel::with_replies(vec![
            json!({"tools": [{"name": "a"}], "nextCursor": "page2"}),
            json!({"tools": [{"name": "b", "description": "second"}]}),
        ]);
        let client = McpClient::new("s", channel);
        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let requests = client.channel.requests.lock().unwrap();
        assert!(requests[0].params.is_none());
        assert_eq!(requests[1].params.as_ref().unwrap()["cursor"], "page2");
        assert_eq!(requests[1].id, RequestId::Number(2));
    }

    #[tokio::test]
    async fn call_tool_surfaces_rpc_errors() {
        let channel = ScriptedChannel::with_replies(vec![json!({"error_message": "no such tool"})]);
        let client = McpClient::new("s", channel);
        let err = client.call_tool("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc { ref message, .. } if message == "no such tool"));
    }

    #[tokio::test]
    async fn call_tool_parses_result() {
        let channel = ScriptedChannel::with_replies(vec![json!({
            "content": [{"type": "text", "text": "42"}]
        })]);
        let client = McpClient::new("s", channel);
        let result = client.call_tool("answer", json!({"q": "?"})).await.unwrap();
        assert_eq!(result.text_content(), "42");
        let requests = client.channel.requests.lock().unwrap();
        assert_eq!(requests[0].params.as_ref().unwrap()["arguments"]["q"], "?");
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_bounds_stalled_calls() {
        let channel = ScriptedChannel {
            stall: true,
            ..Default::default()
        };
        let client = McpClient::new("slow", channel).with_request_timeout(Some(Duration::from_secs(5)));
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { ref method, .. } if method == "tools/list"));
    }
}

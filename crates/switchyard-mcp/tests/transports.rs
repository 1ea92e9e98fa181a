// ABOUTME: End-to-end checks of each transport against small local servers.
// ABOUTME: Covers stdio (sh script), streamable HTTP and SSE (axum), and WebSocket (tungstenite).

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use switchyard_core::ServerDescriptor;
use switchyard_mcp::{Connector, ServerClient, TransportConnector};

/// Answer a request the way a minimal server with one "echo" tool would.
fn answer(message: &Value) -> Option<Value> {
    let id = message.get("id")?.clone();
    let result = match message["method"].as_str()? {
        "initialize" => json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock", "version": "0.0.1"}
        }),
        "tools/list" => json!({
            "tools": [{
                "name": "echo",
                "description": "Echo the text argument",
                "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
            }]
        }),
        "tools/call" => json!({
            "content": [{"type": "text", "text": message["params"]["arguments"]["text"].clone()}]
        }),
        _ => return Some(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "unknown"}})),
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn exercise(client: Arc<dyn ServerClient>) {
    client.connect().await.unwrap();
    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    let result = client.call_tool("echo", json!({"text": "hello"})).await.unwrap();
    assert_eq!(result.text_content(), "hello");
    client.close().await.unwrap();
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[cfg(unix)]
#[tokio::test]
async fn stdio_round_trip_against_shell_server() {
    let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"sh","version":"0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hello"}]}}\n' "$id" ;;
  esac
done
"#;
    let descriptor = ServerDescriptor::stdio("shell", "sh", ["-c", script]);
    exercise(TransportConnector::new().client_for(&descriptor)).await;
}

#[cfg(unix)]
#[tokio::test]
async fn stdio_spawn_failure_is_reported() {
    let descriptor = ServerDescriptor::stdio("ghost", "/definitely/not/a/binary", Vec::<String>::new());
    let client = TransportConnector::new().client_for(&descriptor);
    let err = client.connect().await.unwrap_err();
    assert!(err.to_string().contains("/definitely/not/a/binary"));
}

#[derive(Clone, Default)]
struct HttpLog {
    sessions: Arc<Mutex<Vec<Option<String>>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

async fn http_post(State(log): State<HttpLog>, headers: HeaderMap, body: axum::Json<Value>) -> Response {
    let session = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    log.sessions.lock().unwrap().push(session);

    let Some(reply) = answer(&body.0) else {
        return StatusCode::ACCEPTED.into_response();
    };
    if body.0["method"] == "tools/call" {
        // Streamed reply: a notification first, then the response
        let stream = format!(
            "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
            reply
        );
        return ([("content-type", "text/event-stream")], stream).into_response();
    }
    ([("mcp-session-id", "session-42")], axum::Json(reply)).into_response()
}

async fn http_delete(State(log): State<HttpLog>, headers: HeaderMap) -> StatusCode {
    if let Some(session) = headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) {
        log.deleted.lock().unwrap().push(session.to_string());
    }
    StatusCode::NO_CONTENT
}

#[tokio::test]
async fn streamable_http_tracks_session_and_reads_streamed_replies() {
    let log = HttpLog::default();
    let app = Router::new()
        .route("/mcp", post(http_post).delete(http_delete))
        .with_state(log.clone());
    let base = serve(app).await;

    let descriptor = ServerDescriptor::http("remote", format!("{}/mcp", base));
    exercise(TransportConnector::new().client_for(&descriptor)).await;

    let sessions = log.sessions.lock().unwrap().clone();
    assert_eq!(sessions[0], None);
    assert!(sessions[1..].iter().all(|s| s.as_deref() == Some("session-42")));
    assert_eq!(*log.deleted.lock().unwrap(), vec!["session-42".to_string()]);
}

#[tokio::test]
async fn streamable_http_error_status_surfaces() {
    let app = Router::new().route("/mcp", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let base = serve(app).await;
    let descriptor = ServerDescriptor::http("broken", format!("{}/mcp", base));
    let err = TransportConnector::new()
        .client_for(&descriptor)
        .connect()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));
}

type EventSender = mpsc::UnboundedSender<Event>;

#[derive(Clone, Default)]
struct SseState {
    tx: Arc<Mutex<Option<EventSender>>>,
}

async fn sse_stream(
    State(state): State<SseState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(Event::default().event("endpoint").data("/messages?session=1"))
        .unwrap();
    *state.tx.lock().unwrap() = Some(tx);
    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(Ok);
    Sse::new(stream)
}

async fn sse_message(State(state): State<SseState>, body: axum::Json<Value>) -> StatusCode {
    if let Some(reply) = answer(&body.0)
        && let Some(tx) = state.tx.lock().unwrap().as_ref()
    {
        let _ = tx.send(Event::default().event("message").data(reply.to_string()));
    }
    StatusCode::ACCEPTED
}

#[tokio::test]
async fn sse_uses_announced_endpoint() {
    let app = Router::new()
        .route("/sse", get(sse_stream))
        .route("/messages", post(sse_message))
        .with_state(SseState::default());
    let base = serve(app).await;

    let descriptor = ServerDescriptor::sse("thinking", format!("{}/sse", base));
    exercise(TransportConnector::new().client_for(&descriptor)).await;
}

#[tokio::test]
async fn websocket_round_trip() {
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as WsResponse};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |_req: &Request, mut resp: WsResponse| {
            resp.headers_mut()
                .insert("sec-websocket-protocol", "mcp".parse().unwrap());
            Ok::<_, ErrorResponse>(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else { continue };
            let message: Value = serde_json::from_str(text.as_str()).unwrap();
            if let Some(reply) = answer(&message) {
                ws.send(Message::text(reply.to_string())).await.unwrap();
            }
        }
    });

    let descriptor = ServerDescriptor::websocket("search", format!("ws://{}", addr));
    exercise(TransportConnector::new().client_for(&descriptor)).await;
}

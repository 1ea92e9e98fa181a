// ABOUTME: OpenAI-compatible chat completions adapter implementing the GenerationEngine trait.
// ABOUTME: Serves both OpenAI and Fireworks, which differ only in endpoint and response_format shape.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use switchyard_core::{ConversationTurn, Role, ToolCallRequest, ToolSpec};
use switchyard_mcp::sse::SseDecoder;

use crate::runtime::{
    EngineError, FinishReason, Generation, GenerationConfig, GenerationEngine, GenerationRequest,
    Usage,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const FIREWORKS_BASE_URL: &str = "https://api.fireworks.ai/inference";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
const DEFAULT_FIREWORKS_MODEL: &str = "accounts/fireworks/models/llama-v3p1-70b-instruct";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TEMPERATURE: f32 = 0.1;

/// Which dialect of the chat completions API to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    OpenAi,
    /// Structured output is requested as `{"type": "json_object", "schema": ...}`.
    Fireworks,
}

pub struct OpenAiEngine {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    flavor: ApiFlavor,
}

impl OpenAiEngine {
    /// Required: `OPENAI_API_KEY`
    /// Optional: `OPENAI_BASE_URL` (defaults to https://api.openai.com)
    /// Optional: `OPENAI_MODEL` (defaults to gpt-4o)
    pub fn from_env() -> Result<Self, EngineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EngineError::ProviderError("OPENAI_API_KEY not set".to_string()))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| OPENAI_BASE_URL.to_string());
        let model =
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_OPENAI_MODEL.to_string());
        Ok(Self::new(api_key, base_url, model))
    }

    /// Same as `from_env` with the `FIREWORKS_` prefix and the Fireworks flavor.
    pub fn fireworks_from_env() -> Result<Self, EngineError> {
        let api_key = std::env::var("FIREWORKS_API_KEY")
            .map_err(|_| EngineError::ProviderError("FIREWORKS_API_KEY not set".to_string()))?;
        let base_url =
            std::env::var("FIREWORKS_BASE_URL").unwrap_or_else(|_| FIREWORKS_BASE_URL.to_string());
        let model = std::env::var("FIREWORKS_MODEL")
            .unwrap_or_else(|_| DEFAULT_FIREWORKS_MODEL.to_string());
        Ok(Self::new(api_key, base_url, model).with_flavor(ApiFlavor::Fireworks))
    }

    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            flavor: ApiFlavor::OpenAi,
        }
    }

    pub fn with_flavor(mut self, flavor: ApiFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn default_model(flavor: ApiFlavor) -> &'static str {
        match flavor {
            ApiFlavor::OpenAi => DEFAULT_OPENAI_MODEL,
            ApiFlavor::Fireworks => DEFAULT_FIREWORKS_MODEL,
        }
    }

    /// Build the JSON request body for the Chat Completions API.
    pub fn build_request_body(&self, request: &GenerationRequest) -> Value {
        let config = &request.config;
        let messages: Vec<Value> = request.messages.iter().map(turn_to_message).collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        });

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_definition).collect());
            body["tool_choice"] = json!("auto");
        }

        if let Some(format) = &config.response_format {
            body["response_format"] = match self.flavor {
                ApiFlavor::OpenAi => json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": format.name,
                        "strict": format.strict,
                        "schema": format.schema,
                    }
                }),
                ApiFlavor::Fireworks => json!({
                    "type": "json_object",
                    "schema": format.schema,
                }),
            };
        }

        if config.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }

        body
    }

    /// Parse a non-streamed Chat Completions response.
    pub fn parse_response(response_body: &Value) -> Result<Generation, EngineError> {
        let choice = response_body
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| {
                EngineError::InvalidResponse("missing or empty choices array".to_string())
            })?;

        let message = choice.get("message").ok_or_else(|| {
            EngineError::InvalidResponse("missing message in choice".to_string())
        })?;

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();

        let tool_calls = match message.get("tool_calls").and_then(|t| t.as_array()) {
            Some(calls) => calls
                .iter()
                .map(parse_tool_call)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(FinishReason::from_wire)
            .unwrap_or(FinishReason::Stop);

        let usage = response_body
            .get("usage")
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

        Ok(Generation {
            content,
            tool_calls,
            usage,
            finish_reason,
        })
    }

    async fn read_stream(response: reqwest::Response) -> Result<Generation, EngineError> {
        let mut decoder = SseDecoder::new();
        let mut accumulator = StreamAccumulator::default();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| EngineError::ProviderError(format!("stream read failed: {}", e)))?;
            for event in decoder.push(&chunk) {
                if event.data.trim() == "[DONE]" {
                    return Ok(accumulator.finish());
                }
                let value: Value = serde_json::from_str(&event.data).map_err(|e| {
                    EngineError::InvalidResponse(format!("bad stream chunk: {}", e))
                })?;
                accumulator.apply(&value);
            }
        }

        Ok(accumulator.finish())
    }
}

fn turn_to_message(turn: &ConversationTurn) -> Value {
    match turn.role {
        Role::Assistant if !turn.tool_calls.is_empty() => {
            let calls: Vec<Value> = turn
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments }
                    })
                })
                .collect();
            let content = if turn.content.is_empty() {
                Value::Null
            } else {
                Value::String(turn.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        Role::Tool => json!({
            "role": "tool",
            "content": turn.content,
            "tool_call_id": turn.tool_call_id.clone().unwrap_or_default(),
        }),
        role => json!({ "role": role.label(), "content": turn.content }),
    }
}

fn tool_definition(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn parse_tool_call(tool_call: &Value) -> Result<ToolCallRequest, EngineError> {
    let id = tool_call
        .get("id")
        .and_then(|i| i.as_str())
        .unwrap_or_default();
    let function = tool_call.get("function").ok_or_else(|| {
        EngineError::InvalidResponse("tool_call missing function".to_string())
    })?;
    let name = function
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| EngineError::InvalidResponse("function missing name".to_string()))?;
    // Some backends send arguments as an object instead of JSON text
    let arguments = match function.get("arguments") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    };
    Ok(ToolCallRequest::new(id, name, arguments))
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds streamed deltas into one Generation. Tool calls arrive keyed by index,
/// with their arguments split across many chunks.
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    calls: BTreeMap<u64, PartialCall>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
}

impl StreamAccumulator {
    fn apply(&mut self, chunk: &Value) {
        if let Some(usage) = chunk
            .get("usage")
            .filter(|u| !u.is_null())
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
        {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return;
        };

        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            self.finish_reason = Some(FinishReason::from_wire(reason));
        }

        let Some(delta) = choice.get("delta") else {
            return;
        };
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            self.content.push_str(text);
        }
        for call in delta
            .get("tool_calls")
            .and_then(|t| t.as_array())
            .into_iter()
            .flatten()
        {
            let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let partial = self.calls.entry(index).or_default();
            if let Some(id) = call.get("id").and_then(|i| i.as_str()) {
                partial.id = id.to_string();
            }
            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                    partial.name.push_str(name);
                }
                if let Some(args) = function.get("arguments").and_then(|a| a.as_str()) {
                    partial.arguments.push_str(args);
                }
            }
        }
    }

    fn finish(self) -> Generation {
        let tool_calls: Vec<ToolCallRequest> = self
            .calls
            .into_values()
            .map(|c| ToolCallRequest::new(c.id, c.name, c.arguments))
            .collect();
        let finish_reason = self.finish_reason.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
        Generation {
            content: self.content,
            tool_calls,
            usage: self.usage,
            finish_reason,
        }
    }
}

#[async_trait]
impl GenerationEngine for OpenAiEngine {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        let body = self.build_request_body(&request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        tracing::debug!(
            provider = %self.provider_name(),
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "chat completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ProviderError(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngineError::ProviderError(format!(
                "Unauthorized: check the {} API key",
                self.provider_name()
            )));
        }

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(EngineError::ProviderError(format!(
                "API error {}: {}",
                status, error_body
            )));
        }

        if request.config.stream {
            return Self::read_stream(response).await;
        }

        let response_body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(format!("failed to parse JSON: {}", e)))?;

        Self::parse_response(&response_body)
    }

    fn provider_name(&self) -> &str {
        match self.flavor {
            ApiFlavor::OpenAi => "openai",
            ApiFlavor::Fireworks => "fireworks",
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ResponseFormat;

    fn engine() -> OpenAiEngine {
        OpenAiEngine::new(
            "test-key".to_string(),
            "https://api.openai.com/".to_string(),
            "gpt-4o".to_string(),
        )
    }

    fn request(config: GenerationConfig) -> GenerationRequest {
        GenerationRequest {
            messages: vec![
                ConversationTurn::system("You are a researcher."),
                ConversationTurn::user("find X"),
                ConversationTurn::assistant_tool_calls(
                    "",
                    vec![ToolCallRequest::new("call_1", "search", "{\"q\":\"X\"}")],
                ),
                ConversationTurn::tool("call_1", "{\"content\":[]}"),
            ],
            tools: vec![ToolSpec::new(
                "search",
                "Search the web",
                json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            )],
            config,
        }
    }

    #[test]
    fn engine_creation() {
        let engine = engine();
        assert_eq!(engine.provider_name(), "openai");
        assert_eq!(engine.model_name(), "gpt-4o");
        assert_eq!(engine.base_url, "https://api.openai.com");
    }

    #[test]
    fn builds_request_body_with_defaults_and_tools() {
        let body = engine().build_request_body(&request(GenerationConfig::default()));

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 2048);
        assert!((body["temperature"].as_f64().unwrap() - 0.1).abs() < 1e-6);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert!(body.get("stream").is_none());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{\"q\":\"X\"}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn response_format_follows_flavor() {
        let config = GenerationConfig::structured(ResponseFormat::json_schema(
            "plan",
            json!({"type": "object"}),
        ));

        let openai = engine().build_request_body(&request(config.clone()));
        assert_eq!(openai["response_format"]["type"], "json_schema");
        assert_eq!(openai["response_format"]["json_schema"]["name"], "plan");
        assert_eq!(openai["response_format"]["json_schema"]["strict"], true);

        let fireworks = engine()
            .with_flavor(ApiFlavor::Fireworks)
            .build_request_body(&request(config));
        assert_eq!(fireworks["response_format"]["type"], "json_object");
        assert_eq!(fireworks["response_format"]["schema"]["type"], "object");
    }

    #[test]
    fn omits_tools_when_none_are_offered() {
        let mut req = request(GenerationConfig::default());
        req.tools.clear();
        let body = engine().build_request_body(&req);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn parses_tool_call_response() {
        let response = json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_a", "type": "function", "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}},
                        {"id": "call_b", "type": "function", "function": {"name": "fetch", "arguments": {"url": "x"}}}
                    ]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });

        let generation = OpenAiEngine::parse_response(&response).unwrap();
        assert!(generation.wants_tools());
        assert_eq!(generation.content, "");
        assert_eq!(generation.tool_calls.len(), 2);
        assert_eq!(generation.tool_calls[0].name, "search");
        assert_eq!(generation.tool_calls[1].arguments, "{\"url\":\"x\"}");
        assert_eq!(generation.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn parses_text_response() {
        let response = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "Here is the answer."},
                "finish_reason": "stop"
            }]
        });
        let generation = OpenAiEngine::parse_response(&response).unwrap();
        assert_eq!(generation.content, "Here is the answer.");
        assert_eq!(generation.finish_reason, FinishReason::Stop);
        assert!(!generation.wants_tools());
    }

    #[test]
    fn rejects_response_without_choices() {
        let result = OpenAiEngine::parse_response(&json!({"choices": []}));
        assert!(matches!(result, Err(EngineError::InvalidResponse(_))));
    }

    #[test]
    fn accumulates_streamed_tool_calls_by_index() {
        let mut acc = StreamAccumulator::default();
        let chunks = [
            json!({"choices": [{"delta": {"content": "Let me "}}]}),
            json!({"choices": [{"delta": {"content": "check."}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "c0", "function": {"name": "search", "arguments": "{\"q\":"}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 1, "id": "c1", "function": {"name": "fetch", "arguments": ""}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"rust\"}"}}]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 1, "function": {"arguments": "{}"}}]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}}),
        ];
        for chunk in &chunks {
            acc.apply(chunk);
        }
        let generation = acc.finish();

        assert_eq!(generation.content, "Let me check.");
        assert_eq!(generation.finish_reason, FinishReason::ToolCalls);
        assert_eq!(generation.tool_calls[0], ToolCallRequest::new("c0", "search", "{\"q\":\"rust\"}"));
        assert_eq!(generation.tool_calls[1], ToolCallRequest::new("c1", "fetch", "{}"));
        assert_eq!(generation.usage.unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn generate_posts_to_chat_completions() {
        use axum::{Json, Router, routing::post};

        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                let model = body["model"].as_str().unwrap_or_default().to_string();
                Json(json!({
                    "choices": [{
                        "message": {"role": "assistant", "content": format!("hello from {}", model)},
                        "finish_reason": "stop"
                    }]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let engine = OpenAiEngine::new("k".into(), format!("http://{}", addr), "mini".into());
        let generation = engine
            .generate(GenerationRequest {
                messages: vec![ConversationTurn::user("hi")],
                tools: vec![],
                config: GenerationConfig::default(),
            })
            .await
            .unwrap();
        assert_eq!(generation.content, "hello from mini");
    }

    #[tokio::test]
    async fn generate_maps_rate_limit() {
        use axum::{Router, http::StatusCode, routing::post};

        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { StatusCode::TOO_MANY_REQUESTS }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let engine = OpenAiEngine::new("k".into(), format!("http://{}", addr), "mini".into());
        let result = engine
            .generate(GenerationRequest {
                messages: vec![ConversationTurn::user("hi")],
                tools: vec![],
                config: GenerationConfig::default(),
            })
            .await;
        assert!(matches!(result, Err(EngineError::RateLimited)));
    }

    #[tokio::test]
    #[cfg(feature = "live-test")]
    async fn openai_engine_live() {
        let engine = OpenAiEngine::from_env().expect("OPENAI_API_KEY must be set");
        let result = engine
            .generate(GenerationRequest {
                messages: vec![ConversationTurn::user("Reply with the word ok.")],
                tools: vec![],
                config: GenerationConfig::default(),
            })
            .await;
        assert!(result.is_ok(), "live test failed: {:?}", result.err());
    }
}

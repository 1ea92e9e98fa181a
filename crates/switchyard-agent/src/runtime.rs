// ABOUTME: Defines the GenerationEngine trait that chat-completion backends implement.
// ABOUTME: Also defines the request/response shapes exchanged with an engine and EngineError.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use switchyard_core::{ConversationTurn, ToolCallRequest, ToolSpec};

/// Ask the engine to answer with JSON matching a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
    pub strict: bool,
}

impl ResponseFormat {
    pub fn json_schema(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            strict: true,
        }
    }
}

/// Per-call knobs. Unset fields fall back to the engine's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub response_format: Option<ResponseFormat>,
    /// Request a streamed completion; the result is assembled before returning.
    #[serde(default)]
    pub stream: bool,
}

impl GenerationConfig {
    pub fn structured(format: ResponseFormat) -> Self {
        Self {
            response_format: Some(format),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ConversationTurn>,
    pub tools: Vec<ToolSpec>,
    pub config: GenerationConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    FunctionCall,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "function_call" => FinishReason::FunctionCall,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// One engine turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

impl Generation {
    /// A plain text answer that ends the turn.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: None,
            finish_reason: FinishReason::Stop,
        }
    }

    /// A turn that asks for tool calls.
    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: String::new(),
            tool_calls: calls,
            usage: None,
            finish_reason: FinishReason::ToolCalls,
        }
    }

    /// True when the engine asked for tools and named at least one.
    pub fn wants_tools(&self) -> bool {
        matches!(
            self.finish_reason,
            FinishReason::ToolCalls | FinishReason::FunctionCall
        ) && !self.tool_calls.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited")]
    RateLimited,
}

/// A chat-completion backend.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError>;

    /// Provider name for logging and display (e.g. "openai", "fireworks").
    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

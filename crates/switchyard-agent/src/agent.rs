// ABOUTME: The Agent: a generation engine, a conversation history, and a set of callable tools.
// ABOUTME: generate() runs the bounded propose, call tools, observe loop and commits turns on success.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use switchyard_core::{
    ConversationTurn, EventBus, EventPayload, ServerDescriptor, ToolCallRequest, ToolResult,
    ToolSpec,
};
use switchyard_mcp::{Aggregator, AggregatorError, ConnectionRegistry, LoadPolicy};

use crate::memory::{Memory, SimpleMemory};
use crate::prompt;
use crate::runtime::{
    EngineError, GenerationConfig, GenerationEngine, GenerationRequest, ResponseFormat,
};
use crate::tools::{
    FunctionTool, RecordingExecutor, ToolCallRecord, ToolError, ToolExecutor, ToolRouter,
};

pub const DEFAULT_MAX_ITERATIONS: usize = 5;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    #[error("tool '{name}' is defined locally and by server '{server_id}'")]
    ToolCollision { name: String, server_id: String },

    #[error("agent '{0}' has no generation engine")]
    MissingEngine(String),

    #[error("agent '{0}' lists servers but has no connection registry")]
    MissingRegistry(String),

    #[error("tool '{tool}' failed: {source}")]
    ToolExecution {
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("no final answer after {max_iterations} iterations")]
    Incomplete { max_iterations: usize },

    #[error("response is not valid structured output: {source}")]
    StructuredOutput {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid agent configuration: {0}")]
    InvalidConfig(String),
}

pub struct AgentBuilder {
    name: String,
    description: String,
    system_prompt: Option<String>,
    engine: Option<Arc<dyn GenerationEngine>>,
    servers: Vec<ServerDescriptor>,
    registry: Option<Arc<ConnectionRegistry>>,
    functions: Vec<Arc<dyn FunctionTool>>,
    max_iterations: usize,
    load_policy: LoadPolicy,
    memory: Option<Box<dyn Memory>>,
    events: Option<EventBus>,
    record_tool_calls: bool,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: None,
            engine: None,
            servers: Vec::new(),
            registry: None,
            functions: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            load_policy: LoadPolicy::default(),
            memory: None,
            events: None,
            record_tool_calls: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replace the default system prompt built from name and description.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn engine(mut self, engine: Arc<dyn GenerationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn servers(mut self, servers: Vec<ServerDescriptor>) -> Self {
        self.servers = servers;
        self
    }

    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn function(mut self, tool: Arc<dyn FunctionTool>) -> Self {
        self.functions.push(tool);
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn load_policy(mut self, policy: LoadPolicy) -> Self {
        self.load_policy = policy;
        self
    }

    pub fn memory(mut self, memory: Box<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Wrap tool execution in a RecordingExecutor.
    pub fn record_tool_calls(mut self, record: bool) -> Self {
        self.record_tool_calls = record;
        self
    }

    /// Connect to the configured servers and assemble the tool catalog.
    pub async fn build(self) -> Result<Agent, AgentError> {
        if self.max_iterations == 0 {
            return Err(AgentError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        let engine = self
            .engine
            .ok_or_else(|| AgentError::MissingEngine(self.name.clone()))?;

        let aggregator = if self.servers.is_empty() {
            None
        } else {
            let registry = self
                .registry
                .ok_or_else(|| AgentError::MissingRegistry(self.name.clone()))?;
            let aggregator = Aggregator::load(registry, &self.servers, self.load_policy).await?;
            Some(Arc::new(aggregator))
        };

        let router = match ToolRouter::new(aggregator.clone(), self.functions) {
            Ok(router) => router,
            Err(err) => {
                if let Some(aggregator) = &aggregator {
                    aggregator.close().await;
                }
                return Err(match err {
                    ToolError::Collision { name, server_id } => {
                        AgentError::ToolCollision { name, server_id }
                    }
                    other => AgentError::InvalidConfig(other.to_string()),
                });
            }
        };

        let (executor, recorder): (Arc<dyn ToolExecutor>, _) = if self.record_tool_calls {
            let recorder = Arc::new(RecordingExecutor::new(Arc::new(router)));
            (Arc::clone(&recorder) as Arc<dyn ToolExecutor>, Some(recorder))
        } else {
            (Arc::new(router) as Arc<dyn ToolExecutor>, None)
        };

        let system_prompt = self
            .system_prompt
            .unwrap_or_else(|| prompt::agent_system_prompt(&self.name, &self.description));

        tracing::info!(
            agent = %self.name,
            tools = executor.specs().len(),
            max_iterations = self.max_iterations,
            "agent ready"
        );

        Ok(Agent {
            name: self.name,
            description: self.description,
            system_prompt,
            engine,
            aggregator,
            executor,
            recorder,
            memory: Mutex::new(
                self.memory
                    .unwrap_or_else(|| Box::new(SimpleMemory::new()) as Box<dyn Memory>),
            ),
            max_iterations: self.max_iterations,
            events: self.events,
        })
    }
}

pub struct Agent {
    name: String,
    description: String,
    system_prompt: String,
    engine: Arc<dyn GenerationEngine>,
    aggregator: Option<Arc<Aggregator>>,
    executor: Arc<dyn ToolExecutor>,
    recorder: Option<Arc<RecordingExecutor>>,
    /// Held for the whole of one generate call, so calls on one agent run one at a time.
    memory: Mutex<Box<dyn Memory>>,
    max_iterations: usize,
    events: Option<EventBus>,
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// The merged catalog offered to the engine: server tools, then local functions.
    pub fn list_tools(&self) -> Vec<ToolSpec> {
        self.executor.specs()
    }

    pub fn aggregator(&self) -> Option<&Arc<Aggregator>> {
        self.aggregator.as_ref()
    }

    /// Recorded tool calls; empty unless recording was enabled at build time.
    pub fn tool_call_records(&self) -> Vec<ToolCallRecord> {
        self.recorder
            .as_ref()
            .map(|r| r.records())
            .unwrap_or_default()
    }

    pub async fn history(&self) -> Vec<ConversationTurn> {
        self.memory.lock().await.get().to_vec()
    }

    pub async fn reset(&self) {
        self.memory.lock().await.clear();
    }

    /// Release this agent's server connections. Local function tools are unaffected.
    pub async fn close(&self) {
        if let Some(aggregator) = &self.aggregator {
            aggregator.close().await;
        }
    }

    /// Run the tool loop for one prompt and return the full history afterwards.
    ///
    /// The turns of this call are committed to history only when the engine produces a
    /// final answer. On any error the history is left as it was before the call.
    pub async fn generate(
        &self,
        prompt: &str,
        config: Option<GenerationConfig>,
    ) -> Result<Vec<ConversationTurn>, AgentError> {
        let mut memory = self.memory.lock().await;
        tracing::info!(agent = %self.name, "agent task started");
        self.publish(EventPayload::AgentTaskStarted {
            task: prompt.to_string(),
        });

        match self
            .run_loop(&mut **memory, prompt, config.unwrap_or_default())
            .await
        {
            Ok(()) => {
                let history = memory.get().to_vec();
                let response = history
                    .last()
                    .map(|t| t.content.clone())
                    .unwrap_or_default();
                tracing::info!(agent = %self.name, turns = history.len(), "agent task finished");
                self.publish(EventPayload::AgentTaskFinished {
                    task: prompt.to_string(),
                    response,
                });
                Ok(history)
            }
            Err(err) => {
                let tool = match &err {
                    AgentError::ToolExecution { tool, .. } => Some(tool.clone()),
                    _ => None,
                };
                tracing::warn!(agent = %self.name, error = %err, "agent task failed");
                self.publish(EventPayload::AgentError {
                    error: err.to_string(),
                    tool,
                });
                Err(err)
            }
        }
    }

    /// Like `generate`, returning only the final assistant text.
    pub async fn generate_str(
        &self,
        prompt: &str,
        config: Option<GenerationConfig>,
    ) -> Result<String, AgentError> {
        let history = self.generate(prompt, config).await?;
        Ok(history
            .last()
            .map(|t| t.content.clone())
            .unwrap_or_default())
    }

    /// Ask for JSON matching `format` and parse the final text into `T`.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        prompt: &str,
        format: ResponseFormat,
    ) -> Result<T, AgentError> {
        let raw = self
            .generate_str(prompt, Some(GenerationConfig::structured(format)))
            .await?;
        serde_json::from_str(&raw).map_err(|source| AgentError::StructuredOutput { raw, source })
    }

    async fn run_loop(
        &self,
        memory: &mut dyn Memory,
        prompt: &str,
        config: GenerationConfig,
    ) -> Result<(), AgentError> {
        let tools = self.executor.specs();
        let mut pending = vec![ConversationTurn::user(prompt)];

        for iteration in 1..=self.max_iterations {
            let mut messages = Vec::with_capacity(memory.get().len() + pending.len() + 1);
            messages.push(ConversationTurn::system(self.system_prompt.clone()));
            messages.extend_from_slice(memory.get());
            messages.extend(pending.iter().cloned());

            let generation = self
                .engine
                .generate(GenerationRequest {
                    messages,
                    tools: tools.clone(),
                    config: config.clone(),
                })
                .await?;

            if let Some(usage) = generation.usage {
                tracing::debug!(
                    agent = %self.name,
                    iteration,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "engine usage"
                );
            }

            if !generation.wants_tools() {
                pending.push(ConversationTurn::assistant(generation.content));
                memory.extend(pending);
                return Ok(());
            }

            tracing::debug!(
                agent = %self.name,
                iteration,
                calls = generation.tool_calls.len(),
                "engine requested tools"
            );
            pending.push(ConversationTurn::assistant_tool_calls(
                generation.content,
                generation.tool_calls.clone(),
            ));
            // Sequential on purpose: each result turn must follow its request in order
            for call in &generation.tool_calls {
                let result = self.call_tool(call).await?;
                pending.push(ConversationTurn::tool(call.id.clone(), render_result(&result)));
            }
        }

        Err(AgentError::Incomplete {
            max_iterations: self.max_iterations,
        })
    }

    async fn call_tool(&self, call: &ToolCallRequest) -> Result<ToolResult, AgentError> {
        self.publish(EventPayload::AgentToolCall {
            tool: call.name.clone(),
            arguments: call
                .parse_arguments()
                .unwrap_or_else(|_| Value::String(call.arguments.clone())),
        });

        let result = self
            .executor
            .execute(call)
            .await
            .map_err(|source| AgentError::ToolExecution {
                tool: call.name.clone(),
                source,
            })?;
        if result.is_empty() {
            return Err(AgentError::ToolExecution {
                tool: call.name.clone(),
                source: ToolError::EmptyResult(call.name.clone()),
            });
        }

        self.publish(EventPayload::AgentToolResult {
            tool: call.name.clone(),
            result: result.clone(),
        });
        Ok(result)
    }

    fn publish(&self, payload: EventPayload) {
        if let Some(events) = &self.events {
            events.publish(&self.name, payload);
        }
    }
}

/// The tool turn carries the whole result as JSON so non-text parts survive.
fn render_result(result: &ToolResult) -> String {
    serde_json::to_string(result).unwrap_or_else(|_| result.text_content())
}

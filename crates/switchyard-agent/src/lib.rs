// ABOUTME: Agent layer for switchyard: generation engines, the tool-calling agent loop, and orchestration.
// ABOUTME: Agents reach capability servers through switchyard-mcp and report progress on the event bus.

pub mod agent;
pub mod client;
pub mod memory;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod runtime;
pub mod testing;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentError, DEFAULT_MAX_ITERATIONS};
pub use client::create_engine;
pub use memory::{Memory, SimpleMemory};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorError};
pub use runtime::{
    EngineError, FinishReason, Generation, GenerationConfig, GenerationEngine, GenerationRequest,
    ResponseFormat, Usage,
};
pub use tools::{
    FnTool, FunctionTool, RecordingExecutor, ToolCallRecord, ToolError, ToolExecutor, ToolRouter,
};

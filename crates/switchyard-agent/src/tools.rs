// ABOUTME: Local function tools and the ToolExecutor strategy that routes engine tool calls.
// ABOUTME: ToolRouter merges local and server tools; RecordingExecutor wraps any executor with a call log.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use switchyard_core::{ToolCallRequest, ToolResult, ToolSpec};
use switchyard_mcp::{Aggregator, AggregatorError};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool '{0}' returned no content")]
    EmptyResult(String),

    #[error("invalid arguments for tool '{tool}': {source}")]
    InvalidArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },

    #[error("tool name '{name}' is provided by both a local function and server '{server_id}'")]
    Collision { name: String, server_id: String },

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

/// An in-process tool the engine may call.
#[async_trait]
pub trait FunctionTool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError>;
}

type FnHandler = dyn Fn(Value) -> Result<ToolResult, ToolError> + Send + Sync;

/// A FunctionTool backed by a synchronous closure.
pub struct FnTool {
    spec: ToolSpec,
    handler: Box<FnHandler>,
}

impl FnTool {
    pub fn new<F>(spec: ToolSpec, handler: F) -> Self
    where
        F: Fn(Value) -> Result<ToolResult, ToolError> + Send + Sync + 'static,
    {
        Self {
            spec,
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl FunctionTool for FnTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        (self.handler)(arguments)
    }
}

/// Executes the tool calls an engine asks for.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Every tool this executor can run, in the order offered to the engine.
    fn specs(&self) -> Vec<ToolSpec>;

    async fn execute(&self, call: &ToolCallRequest) -> Result<ToolResult, ToolError>;
}

/// Routes a call to a local function tool when one has the name, otherwise to the aggregator.
pub struct ToolRouter {
    functions: Vec<Arc<dyn FunctionTool>>,
    aggregator: Option<Arc<Aggregator>>,
}

impl ToolRouter {
    /// Fails when a function name repeats or shadows a server tool.
    pub fn new(
        aggregator: Option<Arc<Aggregator>>,
        functions: Vec<Arc<dyn FunctionTool>>,
    ) -> Result<Self, ToolError> {
        let mut names = HashSet::new();
        for function in &functions {
            let name = function.spec().name;
            if let Some(owner) = aggregator.as_ref().and_then(|a| a.find_tool(&name)) {
                return Err(ToolError::Collision {
                    name,
                    server_id: owner.server_id.clone(),
                });
            }
            if !names.insert(name.clone()) {
                return Err(ToolError::Collision {
                    name,
                    server_id: "local".to_string(),
                });
            }
        }
        Ok(Self {
            functions,
            aggregator,
        })
    }

    fn function(&self, name: &str) -> Option<&Arc<dyn FunctionTool>> {
        self.functions.iter().find(|f| f.spec().name == name)
    }
}

#[async_trait]
impl ToolExecutor for ToolRouter {
    fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .aggregator
            .iter()
            .flat_map(|a| a.get_all_tools().iter().map(|t| t.spec.clone()))
            .collect();
        specs.extend(self.functions.iter().map(|f| f.spec()));
        specs
    }

    async fn execute(&self, call: &ToolCallRequest) -> Result<ToolResult, ToolError> {
        let arguments = call
            .parse_arguments()
            .map_err(|source| ToolError::InvalidArguments {
                tool: call.name.clone(),
                source,
            })?;

        if let Some(function) = self.function(&call.name) {
            return function.execute(arguments).await;
        }

        match &self.aggregator {
            Some(aggregator) => Ok(aggregator.execute_tool(&call.name, arguments).await?),
            None => Err(ToolError::NotFound(call.name.clone())),
        }
    }
}

/// One observed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decorator that logs every call of the wrapped executor and keeps the records.
pub struct RecordingExecutor {
    inner: Arc<dyn ToolExecutor>,
    records: Mutex<Vec<ToolCallRecord>>,
}

impl RecordingExecutor {
    pub fn new(inner: Arc<dyn ToolExecutor>) -> Self {
        Self {
            inner,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<ToolCallRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    fn specs(&self) -> Vec<ToolSpec> {
        self.inner.specs()
    }

    async fn execute(&self, call: &ToolCallRequest) -> Result<ToolResult, ToolError> {
        let outcome = self.inner.execute(call).await;
        let record = match &outcome {
            Ok(result) => ToolCallRecord {
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
                ok: !result.is_empty() && !result.is_error,
                result: Some(result.clone()),
                error: None,
            },
            Err(e) => ToolCallRecord {
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
                ok: false,
                result: None,
                error: Some(e.to_string()),
            },
        };
        tracing::info!(
            tool = %record.tool,
            args = %record.arguments,
            ok = record.ok,
            result = %record
                .result
                .as_ref()
                .map(|r| r.text_content())
                .or_else(|| record.error.clone())
                .unwrap_or_default(),
            "tool call"
        );
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
        outcome
    }
}

// ABOUTME: Aggregator merges the tool catalogs of several servers into one name-addressed catalog.
// ABOUTME: Tool calls are routed to the owning server's live connection in the shared registry.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use switchyard_core::{DescriptorError, ServerDescriptor, ToolDescriptor, ToolResult};

use crate::registry::{ConnectionError, ConnectionRegistry};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("failed to list tools of server '{server_id}': {source}")]
    Catalog {
        server_id: String,
        #[source]
        source: TransportError,
    },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("no live connection to server '{server_id}' for tool '{tool}'")]
    ConnectionMissing { server_id: String, tool: String },

    #[error("tool '{tool}' on server '{server_id}' failed: {source}")]
    Execution {
        tool: String,
        server_id: String,
        #[source]
        source: TransportError,
    },
}

/// What `load` does when one server cannot be reached or listed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPolicy {
    /// Abort the load on the first failing server.
    #[default]
    Strict,
    /// Log the failure and continue with the remaining servers.
    Permissive,
}

/// A server left out of a permissive load, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedServer {
    pub server_id: String,
    pub reason: String,
}

pub struct Aggregator {
    registry: Arc<ConnectionRegistry>,
    server_ids: Vec<String>,
    tools: Vec<ToolDescriptor>,
    skipped: Vec<SkippedServer>,
}

impl Aggregator {
    /// Connect to every server in order and merge their catalogs. When two servers
    /// expose the same tool name, the server listed first keeps it. A strict load
    /// that fails disconnects every server it had already launched.
    pub async fn load(
        registry: Arc<ConnectionRegistry>,
        descriptors: &[ServerDescriptor],
        policy: LoadPolicy,
    ) -> Result<Self, AggregatorError> {
        let mut aggregator = Self {
            registry,
            server_ids: Vec::new(),
            tools: Vec::new(),
            skipped: Vec::new(),
        };
        let mut seen = HashSet::new();

        for descriptor in descriptors {
            let server_id = descriptor.id().to_string();
            match aggregator.load_one(descriptor).await {
                Ok(specs) => {
                    let total = specs.len();
                    for spec in specs {
                        if !seen.insert(spec.name.clone()) {
                            let owner = aggregator
                                .find_tool(&spec.name)
                                .map(|t| t.server_id.clone())
                                .unwrap_or_default();
                            tracing::warn!(
                                tool = %spec.name,
                                server = %server_id,
                                kept = %owner,
                                "duplicate tool name; keeping the first server's tool"
                            );
                            continue;
                        }
                        aggregator.tools.push(ToolDescriptor {
                            server_id: server_id.clone(),
                            spec,
                        });
                    }
                    tracing::info!(server = %server_id, tools = total, "server catalog loaded");
                    aggregator.server_ids.push(server_id);
                }
                Err(err) => match policy {
                    LoadPolicy::Strict => {
                        tracing::error!(server = %server_id, error = %err, "server load failed");
                        // Launched but unlisted servers are live too
                        if matches!(err, AggregatorError::Catalog { .. }) {
                            aggregator.server_ids.push(server_id);
                        }
                        aggregator.close().await;
                        return Err(err);
                    }
                    LoadPolicy::Permissive => {
                        tracing::warn!(server = %server_id, error = %err, "skipping server");
                        aggregator.skipped.push(SkippedServer {
                            server_id,
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }

        Ok(aggregator)
    }

    async fn load_one(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Vec<switchyard_core::ToolSpec>, AggregatorError> {
        descriptor.validate()?;
        let connection = self.registry.launch(descriptor).await?;
        connection
            .list_tools()
            .await
            .map_err(|source| AggregatorError::Catalog {
                server_id: descriptor.id().to_string(),
                source,
            })
    }

    /// Merged catalog in load order.
    pub fn get_all_tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn find_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Ids of servers whose catalogs were merged, in load order.
    pub fn server_ids(&self) -> &[String] {
        &self.server_ids
    }

    pub fn skipped(&self) -> &[SkippedServer] {
        &self.skipped
    }

    pub async fn execute_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, AggregatorError> {
        let tool = self
            .find_tool(name)
            .ok_or_else(|| AggregatorError::ToolNotFound(name.to_string()))?;
        let connection = self
            .registry
            .get(&tool.server_id)
            .ok_or_else(|| AggregatorError::ConnectionMissing {
                server_id: tool.server_id.clone(),
                tool: name.to_string(),
            })?;

        tracing::debug!(tool = %name, server = %tool.server_id, "executing tool");
        connection
            .call_tool(name, arguments)
            .await
            .map_err(|source| AggregatorError::Execution {
                tool: name.to_string(),
                server_id: tool.server_id.clone(),
                source,
            })
    }

    /// Disconnect every server this aggregator loaded. Failures are logged; the
    /// connections are removed from the registry regardless.
    pub async fn close(&self) {
        for server_id in &self.server_ids {
            if let Err(e) = self.registry.disconnect(server_id).await {
                tracing::warn!(server = %server_id, error = %e, "error while closing server");
            }
        }
    }
}

// ABOUTME: Configuration loading and validation for the switchyard binary.
// ABOUTME: Reads SWITCHYARD_* environment variables and the YAML workflow file of servers and agents.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use switchyard_agent::DEFAULT_MAX_ITERATIONS;
use switchyard_core::ServerDescriptor;
use switchyard_mcp::{LoadPolicy, RetryPolicy};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid number: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("SWITCHYARD_PROVIDER must be 'openai' or 'fireworks', got '{0}'")]
    InvalidProvider(String),

    #[error("SWITCHYARD_LOAD_POLICY must be 'strict' or 'permissive', got '{0}'")]
    InvalidLoadPolicy(String),

    #[error("failed to read workflow file {path}: {source}")]
    WorkflowRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow file {path}: {source}")]
    WorkflowParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("server id '{0}' is declared more than once")]
    DuplicateServer(String),

    #[error("agent name '{0}' is declared more than once")]
    DuplicateAgent(String),

    #[error("agent '{agent}' references undeclared server '{server}'")]
    UnknownServer { agent: String, server: String },
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SwitchyardConfig {
    pub provider: String,
    pub model: Option<String>,
    pub max_iterations: usize,
    pub connect_attempts: u32,
    pub connect_base_delay: Duration,
    pub request_timeout: Option<Duration>,
    pub load_policy: LoadPolicy,
}

impl SwitchyardConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - SWITCHYARD_PROVIDER: generation provider, openai or fireworks (default: openai)
    /// - SWITCHYARD_MODEL: model name (optional)
    /// - SWITCHYARD_MAX_ITERATIONS: agent loop bound (default: 5)
    /// - SWITCHYARD_CONNECT_ATTEMPTS: connection attempts per server (default: 3)
    /// - SWITCHYARD_CONNECT_BASE_DELAY_MS: first retry delay, doubled per attempt (default: 1000)
    /// - SWITCHYARD_REQUEST_TIMEOUT_MS: per-request timeout (optional, unset waits forever)
    /// - SWITCHYARD_LOAD_POLICY: strict or permissive (default: strict)
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = std::env::var("SWITCHYARD_PROVIDER")
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "openai".to_string());
        if provider != "openai" && provider != "fireworks" {
            return Err(ConfigError::InvalidProvider(provider));
        }

        let model = std::env::var("SWITCHYARD_MODEL").ok().filter(|m| !m.is_empty());

        let max_iterations = read_number("SWITCHYARD_MAX_ITERATIONS")?
            .unwrap_or(DEFAULT_MAX_ITERATIONS as u64);
        if max_iterations == 0 {
            return Err(ConfigError::Zero("SWITCHYARD_MAX_ITERATIONS"));
        }

        let defaults = RetryPolicy::default();
        let connect_attempts = read_number("SWITCHYARD_CONNECT_ATTEMPTS")?
            .unwrap_or(u64::from(defaults.max_attempts));
        if connect_attempts == 0 {
            return Err(ConfigError::Zero("SWITCHYARD_CONNECT_ATTEMPTS"));
        }

        let connect_base_delay = read_number("SWITCHYARD_CONNECT_BASE_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay);

        let request_timeout =
            read_number("SWITCHYARD_REQUEST_TIMEOUT_MS")?.map(Duration::from_millis);

        let load_policy = match std::env::var("SWITCHYARD_LOAD_POLICY") {
            Ok(v) if v.eq_ignore_ascii_case("permissive") => LoadPolicy::Permissive,
            Ok(v) if v.is_empty() || v.eq_ignore_ascii_case("strict") => LoadPolicy::Strict,
            Ok(v) => return Err(ConfigError::InvalidLoadPolicy(v)),
            Err(_) => LoadPolicy::Strict,
        };

        Ok(Self {
            provider,
            model,
            max_iterations: max_iterations as usize,
            connect_attempts: u32::try_from(connect_attempts).unwrap_or(u32::MAX),
            connect_base_delay,
            request_timeout,
            load_policy,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts, self.connect_base_delay)
    }
}

fn read_number(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(None),
    }
}

/// One worker agent declared in a workflow file.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

/// The servers and agents a run works with.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    pub agents: Vec<AgentSpec>,
}

impl WorkflowFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::WorkflowRead {
            path: path.to_path_buf(),
            source,
        })?;
        let workflow: Self =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::WorkflowParse {
                path: path.to_path_buf(),
                source,
            })?;
        workflow.validate()?;
        Ok(workflow)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for server in &self.servers {
            if !ids.insert(server.id()) {
                return Err(ConfigError::DuplicateServer(server.id().to_string()));
            }
        }
        let mut names = HashSet::new();
        for agent in &self.agents {
            if !names.insert(agent.name.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
            if let Some(missing) = agent.servers.iter().find(|s| !ids.contains(s.as_str())) {
                return Err(ConfigError::UnknownServer {
                    agent: agent.name.clone(),
                    server: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Descriptors for the agent's servers, in the order the agent lists them.
    pub fn descriptors_for(&self, agent: &AgentSpec) -> Vec<ServerDescriptor> {
        agent
            .servers
            .iter()
            .filter_map(|id| self.servers.iter().find(|s| s.id() == id))
            .cloned()
            .collect()
    }
}

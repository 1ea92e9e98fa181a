// ABOUTME: Describes how to reach a capability server: an identifier plus transport-specific parameters.
// ABOUTME: TransportParams is a closed tagged enum so transport selection is matched exhaustively.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a descriptor is structurally unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("server id must not be empty")]
    EmptyId,

    #[error("server {id}: stdio command must not be empty")]
    EmptyCommand { id: String },

    #[error("server {id}: url '{url}' must start with {expected}")]
    BadScheme {
        id: String,
        url: String,
        expected: &'static str,
    },
}

/// The transport family used to reach a capability server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    WebSocket,
    Sse,
    Http,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::WebSocket => "websocket",
            TransportKind::Sse => "sse",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Transport-specific connection parameters, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportParams {
    /// Launch a subprocess and speak newline-delimited JSON over its stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    #[serde(rename = "ws", alias = "websocket")]
    WebSocket { url: String },
    Sse { url: String },
    #[serde(alias = "streamable-http")]
    Http { url: String },
}

impl TransportParams {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportParams::Stdio { .. } => TransportKind::Stdio,
            TransportParams::WebSocket { .. } => TransportKind::WebSocket,
            TransportParams::Sse { .. } => TransportKind::Sse,
            TransportParams::Http { .. } => TransportKind::Http,
        }
    }
}

/// Immutable description of one capability server.
///
/// Fields are private; a descriptor is built once through one of the
/// constructors (or deserialized from a workflow file) and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    id: String,
    #[serde(flatten)]
    transport: TransportParams,
}

impl ServerDescriptor {
    pub fn new(id: impl Into<String>, transport: TransportParams) -> Self {
        Self {
            id: id.into(),
            transport,
        }
    }

    pub fn stdio<I, S>(id: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            TransportParams::Stdio {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: BTreeMap::new(),
            },
        )
    }

    pub fn websocket(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(id, TransportParams::WebSocket { url: url.into() })
    }

    pub fn sse(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(id, TransportParams::Sse { url: url.into() })
    }

    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(id, TransportParams::Http { url: url.into() })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &TransportParams {
        &self.transport
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Check that the descriptor can plausibly be connected.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.id.trim().is_empty() {
            return Err(DescriptorError::EmptyId);
        }
        match &self.transport {
            TransportParams::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(DescriptorError::EmptyCommand {
                        id: self.id.clone(),
                    });
                }
            }
            TransportParams::WebSocket { url } => {
                check_scheme(&self.id, url, &["ws://", "wss://"], "ws:// or wss://")?
            }
            TransportParams::Sse { url } | TransportParams::Http { url } => {
                check_scheme(&self.id, url, &["http://", "https://"], "http:// or https://")?
            }
        }
        Ok(())
    }
}

fn check_scheme(
    id: &str,
    url: &str,
    allowed: &[&str],
    expected: &'static str,
) -> Result<(), DescriptorError> {
    if allowed.iter().any(|prefix| url.starts_with(prefix)) {
        Ok(())
    } else {
        Err(DescriptorError::BadScheme {
            id: id.to_string(),
            url: url.to_string(),
            expected,
        })
    }
}

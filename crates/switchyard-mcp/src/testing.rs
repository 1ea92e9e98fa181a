// ABOUTME: In-process server doubles for tests: scripted catalogs, failing connects, recorded calls.
// ABOUTME: StaticConnector hands the same StaticServer to every attempt so counters span retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use switchyard_core::{ServerDescriptor, ToolResult, ToolSpec};

use crate::client::{Connector, ServerClient};
use crate::transport::TransportError;

type Handler = Arc<dyn Fn(&str, &Value) -> ToolResult + Send + Sync>;

/// A server double with a fixed tool catalog.
pub struct StaticServer {
    tools: Vec<ToolSpec>,
    handler: Handler,
    failures_left: AtomicU32,
    connect_delay: Option<Duration>,
    fail_close: bool,
    fail_calls: bool,
    fail_list: bool,
    connects: AtomicUsize,
    connect_times: Mutex<Vec<Instant>>,
    calls: Mutex<Vec<(String, Value)>>,
    closed: AtomicBool,
}

impl StaticServer {
    /// By default every tool answers "<name> ok".
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self {
            tools,
            handler: Arc::new(|name: &str, _: &Value| ToolResult::text(format!("{} ok", name))),
            failures_left: AtomicU32::new(0),
            connect_delay: None,
            fail_close: false,
            fail_calls: false,
            fail_list: false,
            connects: AtomicUsize::new(0),
            connect_times: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> ToolResult + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Fail the first `count` connect attempts.
    pub fn failing_connects(self, count: u32) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn failing_calls(mut self) -> Self {
        self.fail_calls = true;
        self
    }

    pub fn failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerClient for StaticServer {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Instant::now());
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Protocol("scripted connect failure".into()));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
        if self.fail_list {
            return Err(TransportError::Protocol("scripted list failure".into()));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, TransportError> {
        let result = (self.handler)(name, &arguments);
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((name.to_string(), arguments));
        if self.fail_calls {
            return Err(TransportError::Rpc {
                code: -32000,
                message: format!("{} exploded", name),
            });
        }
        Ok(result)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(TransportError::Protocol("scripted close failure".into()));
        }
        Ok(())
    }
}

/// A client for an id nobody registered; every connect fails.
struct Unreachable;

#[async_trait]
impl ServerClient for Unreachable {
    async fn connect(&self) -> Result<(), TransportError> {
        Err(TransportError::Protocol("no such server".into()))
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
        Err(TransportError::NotOpen)
    }

    async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<ToolResult, TransportError> {
        Err(TransportError::NotOpen)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Connector that maps server ids to StaticServer doubles.
#[derive(Default)]
pub struct StaticConnector {
    servers: HashMap<String, Arc<StaticServer>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, id: impl Into<String>, server: Arc<StaticServer>) -> Self {
        self.servers.insert(id.into(), server);
        self
    }
}

impl Connector for StaticConnector {
    fn client_for(&self, descriptor: &ServerDescriptor) -> Arc<dyn ServerClient> {
        match self.servers.get(descriptor.id()) {
            Some(server) => Arc::clone(server) as Arc<dyn ServerClient>,
            None => Arc::new(Unreachable),
        }
    }
}

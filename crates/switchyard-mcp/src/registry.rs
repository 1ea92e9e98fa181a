// ABOUTME: ConnectionRegistry owns one live connection per server id, with bounded exponential-backoff retry.
// ABOUTME: Concurrent launches of the same id share a single connection attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;

use switchyard_core::{ServerDescriptor, ToolResult, ToolSpec, TransportKind};

use crate::client::{Connector, ServerClient};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("server '{server_id}' unreachable after {attempts} attempt(s): {source}")]
    Exhausted {
        server_id: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("server '{0}' was disconnected while connecting")]
    Disconnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Wait before attempt `failed_attempt + 1`.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
    }
}

/// A connected server. Obtained from the registry; closed only through the registry.
pub struct Connection {
    server_id: String,
    kind: TransportKind,
    client: Arc<dyn ServerClient>,
    state: Mutex<ConnectionState>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_id", &self.server_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    fn new(server_id: String, kind: TransportKind, client: Arc<dyn ServerClient>) -> Self {
        Self {
            server_id,
            kind,
            client,
            state: Mutex::new(ConnectionState::Connected),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(TransportError::NotOpen),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
        self.ensure_open()?;
        self.client.list_tools().await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, TransportError> {
        self.ensure_open()?;
        self.client.call_tool(name, arguments).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = ConnectionState::Closed;
        self.client.close().await
    }
}

struct Slot {
    cell: OnceCell<Arc<Connection>>,
    state: Mutex<ConnectionState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            state: Mutex::new(ConnectionState::Idle),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Keyed pool of server connections shared by every aggregator in the process.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_retry(connector, RetryPolicy::default())
    }

    pub fn with_retry(connector: Arc<dyn Connector>, retry: RetryPolicy) -> Self {
        Self {
            connector,
            retry,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Return the live connection for the descriptor's id, connecting first if needed.
    /// A failed launch leaves no connection behind; a later launch starts over. The id
    /// keeps reporting `Failed` from `state` until it is disconnected or launched again.
    pub async fn launch(&self, descriptor: &ServerDescriptor) -> Result<Arc<Connection>, ConnectionError> {
        let id = descriptor.id().to_string();
        let slot = Arc::clone(self.slots().entry(id.clone()).or_insert_with(|| Arc::new(Slot::new())));

        let connection = slot
            .cell
            .get_or_try_init(|| self.establish(descriptor, &slot))
            .await?
            .clone();

        // A disconnect may have removed the slot while the handshake ran
        let still_registered = self
            .slots()
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !still_registered {
            if let Err(e) = connection.close().await {
                tracing::debug!(server = %id, error = %e, "close after concurrent disconnect failed");
            }
            return Err(ConnectionError::Disconnected(id));
        }

        Ok(connection)
    }

    async fn establish(
        &self,
        descriptor: &ServerDescriptor,
        slot: &Slot,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let server_id = descriptor.id();
        let max_attempts = self.retry.max_attempts.max(1);
        slot.set_state(ConnectionState::Connecting);

        let mut attempt = 1;
        loop {
            let client = self.connector.client_for(descriptor);
            match client.connect().await {
                Ok(()) => {
                    tracing::info!(server = %server_id, transport = %descriptor.kind(), attempt, "connected");
                    slot.set_state(ConnectionState::Connected);
                    return Ok(Arc::new(Connection::new(
                        server_id.to_string(),
                        descriptor.kind(),
                        client,
                    )));
                }
                Err(err) => {
                    if let Err(close_err) = client.close().await {
                        tracing::debug!(server = %server_id, error = %close_err, "cleanup after failed attempt");
                    }
                    if attempt >= max_attempts {
                        tracing::error!(server = %server_id, attempts = attempt, error = %err, "giving up");
                        slot.set_state(ConnectionState::Failed);
                        return Err(ConnectionError::Exhausted {
                            server_id: server_id.to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(
                        server = %server_id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<Connection>> {
        self.slots().get(server_id).and_then(|slot| slot.cell.get().cloned())
    }

    /// Lifecycle state of a registered id; None when the id is unknown or was disconnected.
    /// Exhausted launches stay visible as `Failed` until `disconnect(id)` forgets them.
    pub fn state(&self, server_id: &str) -> Option<ConnectionState> {
        self.slots().get(server_id).map(|slot| slot.state())
    }

    /// Snapshot of live connections, sorted by id.
    pub fn list_all(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self
            .slots()
            .values()
            .filter_map(|slot| slot.cell.get().cloned())
            .collect();
        connections.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        connections
    }

    /// Close and forget one connection. The entry is removed even when closing fails;
    /// the failure is still returned to the caller.
    pub async fn disconnect(&self, server_id: &str) -> Result<(), TransportError> {
        let Some(slot) = self.slots().remove(server_id) else {
            return Ok(());
        };
        slot.set_state(ConnectionState::Closed);
        match slot.cell.get() {
            Some(connection) => {
                let result = connection.close().await;
                match &result {
                    Ok(()) => tracing::info!(server = %server_id, "disconnected"),
                    Err(e) => tracing::warn!(server = %server_id, error = %e, "close failed; connection dropped anyway"),
                }
                result
            }
            None => Ok(()),
        }
    }

    /// Disconnect everything. Returns the ids whose close failed alongside the error.
    pub async fn disconnect_all(&self) -> Vec<(String, TransportError)> {
        let ids: Vec<String> = self.slots().keys().cloned().collect();
        let closes = ids.into_iter().map(|id| async move {
            let result = self.disconnect(&id).await;
            (id, result)
        });
        futures::future::join_all(closes)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticConnector, StaticServer};
    use serde_json::json;

    fn registry_with(servers: Vec<(&str, Arc<StaticServer>)>, retry: RetryPolicy) -> ConnectionRegistry {
        let mut connector = StaticConnector::new();
        for (id, server) in servers {
            connector = connector.with_server(id, server);
        }
        ConnectionRegistry::with_retry(Arc::new(connector), retry)
    }

    fn echo_server() -> Arc<StaticServer> {
        Arc::new(StaticServer::new(vec![ToolSpec::new("echo", "Echo input", json!({"type": "object"}))]))
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn launch_is_idempotent_per_id() {
        let server = echo_server();
        let registry = registry_with(vec![("echo", Arc::clone(&server))], RetryPolicy::default());
        let descriptor = ServerDescriptor::stdio("echo", "echo-server", Vec::<String>::new());

        let first = registry.launch(&descriptor).await.unwrap();
        let second = registry.launch(&descriptor).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(server.connect_count(), 1);
        assert_eq!(registry.state("echo"), Some(ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_launches_share_one_attempt() {
        let server = Arc::new(
            StaticServer::new(vec![]).with_connect_delay(Duration::from_millis(50)),
        );
        let registry = registry_with(vec![("slow", Arc::clone(&server))], RetryPolicy::default());
        let descriptor = ServerDescriptor::http("slow", "http://localhost:1/mcp");

        let (a, b) = tokio::join!(registry.launch(&descriptor), registry.launch(&descriptor));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff_then_succeeds() {
        let server = Arc::new(StaticServer::new(vec![]).failing_connects(2));
        let registry = registry_with(
            vec![("flaky", Arc::clone(&server))],
            RetryPolicy::new(3, Duration::from_secs(1)),
        );
        let descriptor = ServerDescriptor::websocket("flaky", "ws://localhost:1");

        registry.launch(&descriptor).await.unwrap();

        let times = server.connect_times();
        assert_eq!(times.len(), 3);
        assert_eq!(times[1] - times[0], Duration::from_secs(1));
        assert_eq!(times[2] - times[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_attempts_and_leave_nothing_live() {
        let server = Arc::new(StaticServer::new(vec![]).failing_connects(u32::MAX));
        let registry = registry_with(vec![("down", Arc::clone(&server))], RetryPolicy::new(3, Duration::from_secs(1)));
        let descriptor = ServerDescriptor::sse("down", "http://localhost:1/sse");

        let err = registry.launch(&descriptor).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Exhausted { attempts: 3, .. }));
        assert_eq!(server.connect_count(), 3);

        let times = server.connect_times();
        assert_eq!(times.len(), 3);
        let first_gap = times[1] - times[0];
        let second_gap = times[2] - times[1];
        assert_eq!(first_gap, Duration::from_secs(1));
        assert_eq!(second_gap, Duration::from_secs(2));
        assert!(second_gap > first_gap);

        assert!(registry.get("down").is_none());
        assert!(registry.list_all().is_empty());
        assert_eq!(registry.state("down"), Some(ConnectionState::Failed));
    }

    #[tokio::test]
    async fn disconnect_forgets_a_failed_launch() {
        let server = Arc::new(StaticServer::new(vec![]).failing_connects(u32::MAX));
        let registry = registry_with(vec![("down", server)], RetryPolicy::new(1, Duration::from_millis(1)));
        let descriptor = ServerDescriptor::http("down", "http://localhost:1/mcp");

        assert!(registry.launch(&descriptor).await.is_err());
        assert_eq!(registry.state("down"), Some(ConnectionState::Failed));

        assert!(registry.disconnect("down").await.is_ok());
        assert_eq!(registry.state("down"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_launch_can_be_retried_later() {
        let server = Arc::new(StaticServer::new(vec![]).failing_connects(1));
        let registry = registry_with(vec![("later", Arc::clone(&server))], RetryPolicy::new(1, Duration::from_secs(1)));
        let descriptor = ServerDescriptor::http("later", "http://localhost:1/mcp");

        assert!(registry.launch(&descriptor).await.is_err());
        assert!(registry.launch(&descriptor).await.is_ok());
        assert_eq!(server.connect_count(), 2);
    }

    #[tokio::test]
    async fn disconnect_removes_even_when_close_fails() {
        let server = Arc::new(StaticServer::new(vec![]).failing_close());
        let registry = registry_with(vec![("sticky", Arc::clone(&server))], RetryPolicy::default());
        let descriptor = ServerDescriptor::http("sticky", "http://localhost:1/mcp");

        let connection = registry.launch(&descriptor).await.unwrap();
        assert!(registry.disconnect("sticky").await.is_err());
        assert!(registry.get("sticky").is_none());
        assert_eq!(registry.state("sticky"), None);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.list_tools().await.is_err());
    }

    #[tokio::test]
    async fn disconnect_all_closes_every_connection() {
        let a = echo_server();
        let b = echo_server();
        let registry = registry_with(
            vec![("a", Arc::clone(&a)), ("b", Arc::clone(&b))],
            RetryPolicy::default(),
        );
        registry.launch(&ServerDescriptor::http("a", "http://localhost:1/a")).await.unwrap();
        registry.launch(&ServerDescriptor::http("b", "http://localhost:1/b")).await.unwrap();

        let ids: Vec<_> = registry.list_all().iter().map(|c| c.server_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(registry.disconnect_all().await.is_empty());
        assert!(registry.list_all().is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn disconnect_of_unknown_id_is_a_no_op() {
        let registry = registry_with(vec![], RetryPolicy::default());
        assert!(registry.disconnect("ghost").await.is_ok());
    }
}

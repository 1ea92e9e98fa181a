// ABOUTME: Capability-server client layer for switchyard: transports, connection registry, and aggregation.
// ABOUTME: Servers are reached over stdio, WebSocket, SSE, or streamable HTTP using JSON-RPC 2.0.

pub mod aggregator;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod sse;
pub mod testing;
pub mod transport;

pub use aggregator::{Aggregator, AggregatorError, LoadPolicy, SkippedServer};
pub use client::{Connector, McpClient, ServerClient, TransportConnector};
pub use registry::{Connection, ConnectionError, ConnectionRegistry, ConnectionState, RetryPolicy};
pub use transport::{RpcChannel, TransportError};

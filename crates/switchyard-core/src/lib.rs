// ABOUTME: Core library for switchyard, containing the data model shared by every layer.
// ABOUTME: Server descriptors, tool catalogs, conversation turns, plans, and lifecycle events live here.

pub mod event;
pub mod message;
pub mod plan;
pub mod server;
pub mod tool;

pub use event::{Event, EventBus, EventPayload};
pub use message::{ConversationTurn, Role, ToolCallRequest};
pub use plan::{Plan, PlanDocument, PlanResult, PlanStatus, PlanStep, PlanTask};
pub use server::{DescriptorError, ServerDescriptor, TransportKind, TransportParams};
pub use tool::{ContentPart, ToolDescriptor, ToolResult, ToolSpec};

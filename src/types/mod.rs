//! 类型模块：网关的规范请求/响应、消息、工具与事件类型。
//!
//! # Types Module
//!
//! The canonical, vendor-neutral shapes every other layer speaks. Format adapters
//! translate these to and from wire bodies; the orchestrator only ever sees these.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CanonicalRequest`] | One conversational request, append-only |
//! | [`CanonicalResponse`] | Normalized model reply with usage |
//! | [`Message`] | Chat message with role, text and tool linkage |
//! | [`ToolSpec`] | Tool declaration advertised to models |
//! | [`GatewayEvent`] | Event pushed to the caller stream |

pub mod events;
pub mod message;
pub mod request;
pub mod response;
pub mod tool;

pub use events::GatewayEvent;
pub use message::{Message, MessageRole};
pub use request::{
    CanonicalRequest, ModelRole, ReasoningEffort, ResponseFormat, SamplingParams, ToolChoice,
};
pub use response::{CanonicalResponse, FinishReason, PrimarySignal, Usage};
pub use tool::{ToolCall, ToolInvocation, ToolOutput, ToolResult, ToolSpec};

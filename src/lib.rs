//! # ai-gateway
//!
//! 多厂商 LLM 网关：一个规范请求，多个互不兼容的后端，工具编排与按 TPM 的负载均衡。
//!
//! Provider gateway that satisfies one conversational request by orchestrating calls to
//! several API-incompatible LLM backends and to auxiliary tools, keeping every backend
//! under its rate limit and streaming a single answer back as it is produced.
//!
//! ## Overview
//!
//! Components are layered leaf first:
//!
//! ```text
//! ProviderRegistry → FormatAdapter → ModelSelector → Dispatcher → Orchestrator
//!                                                         ↓
//!                                                   output repair
//! ```
//!
//! - **Canonical shapes**: callers and the orchestrator only see [`CanonicalRequest`],
//!   [`CanonicalResponse`] and [`GatewayEvent`]; vendor wire formats live in [`drivers`].
//! - **Table-driven vendor differences**: a [`ModelFormatProfile`](catalog::ModelFormatProfile)
//!   is looked up once per call from the [`catalog`], never re-derived from model-id strings.
//! - **Explicit rate budget**: one [`RateBudget`](budget::RateBudget) instance is shared by the
//!   selector and the dispatcher; there is no global state.
//! - **Push streaming**: tokens, tool start/end, usage and exactly one terminal event flow
//!   over a bounded channel per conversation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_gateway::{CanonicalRequest, Gateway, GatewayConfig, GatewayEvent};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> ai_gateway::Result<()> {
//!     let config = GatewayConfig::from_path("gateway.yaml")?;
//!     let gateway = Gateway::from_config(config)?;
//!
//!     let mut conversation = gateway.chat(CanonicalRequest::from_prompt("What changed in Rust 1.80?"))?;
//!     while let Some(event) = conversation.next().await {
//!         match event {
//!             GatewayEvent::Token { text } => print!("{}", text),
//!             other if other.is_terminal() => println!("\n{:?}", other),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`registry`] | Provider entries, credentials, per-request scopes |
//! | [`catalog`] | Provider families and per-model format profiles |
//! | [`drivers`] | Format adapters for OpenAI, Anthropic, Gemini, Cohere and Ollama |
//! | [`transport`] | HTTP transport and SSE / NDJSON framing |
//! | [`budget`] | Sliding-window token accounting |
//! | [`routing`] | Role pools and the TPM-aware model selector |
//! | [`dispatch`] | One model call, retry policy, failure classification |
//! | [`orchestrator`] | Multi-iteration tool loop and event stream |
//! | [`repair`] | Output repair for stray tool-call markup and malformed JSON |
//! | [`cache`] | Tool result caching |
//! | [`tokens`] | Pricing and cost estimates |
//! | [`config`] | YAML / JSON configuration |

pub mod budget;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod error_code;
pub mod gateway;
pub mod orchestrator;
pub mod registry;
pub mod repair;
pub mod routing;
pub mod tokens;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::GatewayConfig;
pub use dispatch::Dispatcher;
pub use error_code::FailureKind;
pub use gateway::{Gateway, GatewayBuilder};
pub use orchestrator::{CancelHandle, Conversation, Orchestrator, OrchestratorConfig, ToolCollaborator, ToolRegistry};
pub use registry::{ProviderEntry, ProviderRegistry, RequestScope};
pub use types::{
    CanonicalRequest, CanonicalResponse, FinishReason, GatewayEvent, Message, MessageRole, ModelRole,
    ToolCall, ToolOutput, ToolSpec, Usage,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{DispatchError, Error, ErrorContext};

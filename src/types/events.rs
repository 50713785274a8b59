//! Events pushed to the caller stream

use super::response::FinishReason;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Append-only event stream item. Exactly one `Done` or `Error` ends every conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Answer text, forwarded as the model produces it.
    Token { text: String },

    ToolStart {
        call_id: String,
        name: String,
        arguments: Value,
    },

    ToolEnd {
        call_id: String,
        name: String,
        summary: String,
        is_error: bool,
        took_ms: u64,
    },

    /// Usage of one model call.
    Usage {
        provider_id: String,
        model_id: String,
        input_tokens: u64,
        output_tokens: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_estimate: Option<f64>,
    },

    Done { finish_reason: FinishReason },

    Error { kind: String, message: String },
}

impl GatewayEvent {
    pub fn token(text: impl Into<String>) -> Self {
        GatewayEvent::Token { text: text.into() }
    }

    pub fn done(finish_reason: FinishReason) -> Self {
        GatewayEvent::Done { finish_reason }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayEvent::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GatewayEvent::Done { .. } | GatewayEvent::Error { .. })
    }
}

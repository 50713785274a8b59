//! 格式适配层 — 规范请求与各厂商线格式之间的双向翻译
//!
//! Format adapters translate one [`CanonicalRequest`] into each vendor family's wire
//! body and normalize vendor responses (success, error and stream frames) back into
//! [`CanonicalResponse`] pieces. Adapters are stateless; [`adapter_for`] picks one by
//! [`ProviderFamily`] table lookup.
//!
//! Shared rules enforced here for every family:
//! - tools on a profile without tool support fail with [`Error::Capability`] before any I/O;
//! - the structured-output hint is emitted only when the profile supports it **and** the
//!   call declares no tools (when the profile marks the two exclusive);
//! - the reasoning parameter is emitted only when the profile supports it;
//! - unknown response fields are ignored.

pub mod anthropic;
pub mod cohere;
pub mod gemini;
pub mod ollama;
pub mod openai;

use crate::catalog::{MessageShape, ModelFormatProfile, ProviderFamily};
use crate::repair::json::parse_lenient;
use crate::transport::Framing;
use crate::types::{
    CanonicalRequest, CanonicalResponse, FinishReason, Message, MessageRole, ToolChoice, Usage,
};
use crate::{Error, ErrorContext, Result};
use serde_json::Value;

pub use anthropic::AnthropicAdapter;
pub use cohere::CohereAdapter;
pub use gemini::GeminiAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/// A translated request, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct WirePayload {
    /// Path relative to the provider endpoint (may carry a query string).
    pub path: String,
    /// Vendor headers other than authentication.
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub stream: bool,
}

/// A complete (non-streamed) vendor response body.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub body: Value,
}

impl WireResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Parse raw bytes; a non-JSON body becomes a JSON string.
    pub fn from_bytes(status: u16, bytes: &[u8]) -> Self {
        let body = serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()));
        Self { status, body }
    }
}

/// One normalized piece of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    /// A tool call opened; arguments follow as fragments.
    ToolCallStart {
        index: u32,
        id: Option<String>,
        name: String,
    },
    ToolCallArgs {
        index: u32,
        fragment: String,
    },
    /// A tool call delivered whole in one frame.
    ToolCallComplete {
        index: u32,
        id: Option<String>,
        name: String,
        arguments: Value,
    },
    Usage(Usage),
    Finish(FinishReason),
    /// The vendor reported an error inside the stream.
    Error {
        code: Option<String>,
        message: String,
    },
}

pub trait FormatAdapter: Send + Sync + std::fmt::Debug {
    fn family(&self) -> ProviderFamily;

    /// How streamed bodies are framed.
    fn framing(&self) -> Framing {
        Framing::Sse
    }

    /// Translate a canonical request into the vendor wire body.
    fn to_wire(
        &self,
        profile: &ModelFormatProfile,
        request: &CanonicalRequest,
        model: &str,
        stream: bool,
    ) -> Result<WirePayload>;

    /// Normalize a complete vendor body (success or error). Usage is always filled.
    fn from_wire(&self, response: &WireResponse) -> CanonicalResponse;

    /// Normalize one stream frame. Frames that carry nothing of interest yield no deltas.
    fn parse_stream_event(&self, data: &str) -> Result<Vec<StreamDelta>>;

    /// Inverse of [`Self::to_wire`]'s body: read a vendor-shaped request back into canonical form.
    fn decode_request(&self, body: &Value) -> Result<CanonicalRequest>;

    /// Vendor error code carried by an error body, if any.
    fn error_code(&self, body: &Value) -> Option<String> {
        body.pointer("/error/code")
            .or_else(|| body.pointer("/error/type"))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// Human-readable error message carried by an error body.
    fn error_message(&self, body: &Value) -> String {
        body.pointer("/error/message")
            .or_else(|| body.get("message"))
            .or_else(|| body.get("error").filter(|e| e.is_string()))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| truncate(&body.to_string(), 500))
    }
}

static OPENAI: OpenAiAdapter = OpenAiAdapter;
static ANTHROPIC: AnthropicAdapter = AnthropicAdapter;
static GEMINI: GeminiAdapter = GeminiAdapter;
static COHERE: CohereAdapter = CohereAdapter;
static OLLAMA: OllamaAdapter = OllamaAdapter;

/// The adapter for a family.
pub fn adapter_for(family: ProviderFamily) -> &'static dyn FormatAdapter {
    match family {
        ProviderFamily::OpenAiCompatible => &OPENAI,
        ProviderFamily::AnthropicMessages => &ANTHROPIC,
        ProviderFamily::GeminiGenerate => &GEMINI,
        ProviderFamily::CohereChat => &COHERE,
        ProviderFamily::OllamaChat => &OLLAMA,
    }
}

/// Capability checks shared by every family; run before translation.
pub fn check_capabilities(
    profile: &ModelFormatProfile,
    request: &CanonicalRequest,
    model: &str,
) -> Result<()> {
    if !request.tools.is_empty() && !profile.supports_tools() {
        return Err(Error::capability_with_context(
            format!("model '{}' does not support tool calls", model),
            ErrorContext::new()
                .with_field_path("request.tools")
                .with_source(profile.family.as_str()),
        ));
    }
    if let ToolChoice::Tool(name) = &request.tool_choice {
        if !request.tools.iter().any(|t| &t.name == name) {
            return Err(Error::validation_with_context(
                format!("tool_choice names undeclared tool '{}'", name),
                ErrorContext::new().with_field_path("request.tool_choice"),
            ));
        }
    }
    Ok(())
}

/// Whether the structured-output hint goes on the wire for this call.
pub fn emits_response_format(profile: &ModelFormatProfile, request: &CanonicalRequest) -> bool {
    request.response_format.is_some()
        && profile.supports_structured_response_format
        && (request.tools.is_empty() || !profile.tools_exclude_response_format)
}

/// Whether the reasoning parameter goes on the wire for this call.
pub fn emits_reasoning(profile: &ModelFormatProfile, request: &CanonicalRequest) -> bool {
    request.reasoning_effort.is_some() && profile.supports_reasoning_parameter
}

/// Where the system text goes for one call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SystemSlot {
    None,
    /// The family's native system slot.
    Native(String),
    /// OpenAI `developer` role. Families without one treat it as `Native`.
    Developer(String),
}

impl SystemSlot {
    /// System text for families that only have a native slot.
    pub(crate) fn into_text(self) -> Option<String> {
        match self {
            SystemSlot::None => None,
            SystemSlot::Native(s) | SystemSlot::Developer(s) => Some(s),
        }
    }
}

/// Conversation messages with the system text placed per the profile's message shape.
pub(crate) fn shape_messages(
    profile: &ModelFormatProfile,
    request: &CanonicalRequest,
) -> (SystemSlot, Vec<Message>) {
    let mut messages: Vec<Message> = request.conversation().cloned().collect();
    let Some(system) = request.combined_system() else {
        return (SystemSlot::None, messages);
    };
    match profile.message_shape {
        MessageShape::Standard => (SystemSlot::Native(system), messages),
        MessageShape::SystemAsDeveloper => (SystemSlot::Developer(system), messages),
        MessageShape::SystemAsUser => {
            match messages.iter_mut().find(|m| m.role == MessageRole::User) {
                Some(first) => first.content = format!("{}\n\n{}", system, first.content),
                None => messages.insert(0, Message::user(system)),
            }
            (SystemSlot::None, messages)
        }
    }
}

/// Parse tool-call arguments the way models actually send them: a JSON string, an
/// object, or something close to JSON.
pub(crate) fn parse_arguments(raw: &Value) -> Value {
    match raw {
        Value::String(s) if s.trim().is_empty() => Value::Object(Default::default()),
        Value::String(s) => parse_lenient(s).unwrap_or_else(|| Value::String(s.clone())),
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    }
}

pub(crate) fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn u64_at(v: &Value, pointer: &str) -> u64 {
    v.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn str_at<'a>(v: &'a Value, pointer: &str) -> Option<&'a str> {
    v.pointer(pointer).and_then(Value::as_str)
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

pub(crate) fn invalid_body(family: ProviderFamily, what: &str) -> Error {
    Error::validation_with_context(
        format!("malformed {} request body: {}", family, what),
        ErrorContext::new().with_source("decode_request"),
    )
}

/// Sampling parameters set on a decoded request body, read with family-specific key names.
pub(crate) fn read_number(body: &Value, pointer: &str) -> Option<f64> {
    body.pointer(pointer).and_then(Value::as_f64)
}

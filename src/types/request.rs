//! Canonical request

use super::message::{Message, MessageRole};
use super::tool::ToolSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Which pool of models a call should be drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    #[default]
    Planning,
    Summarization,
    Synthesis,
    FinalAnswer,
}

impl ModelRole {
    pub const ALL: [ModelRole; 4] = [
        ModelRole::Planning,
        ModelRole::Summarization,
        ModelRole::Synthesis,
        ModelRole::FinalAnswer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Planning => "planning",
            ModelRole::Summarization => "summarization",
            ModelRole::Synthesis => "synthesis",
            ModelRole::FinalAnswer => "final_answer",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            ModelRole::Planning => 0,
            ModelRole::Summarization => 1,
            ModelRole::Synthesis => 2,
            ModelRole::FinalAnswer => 3,
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelRole::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s || (s == "final" && *r == ModelRole::FinalAnswer))
            .ok_or_else(|| format!("unknown model role '{}'", s))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    Tool(String),
}

/// Structured-output hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    JsonObject,
    JsonSchema {
        name: String,
        schema: Value,
        #[serde(default)]
        strict: bool,
    },
}

impl ResponseFormat {
    pub fn schema(&self) -> Option<&Value> {
        match self {
            ResponseFormat::JsonObject => None,
            ResponseFormat::JsonSchema { schema, .. } => Some(schema),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Thinking-token budget for vendors that take a number instead of a level.
    pub fn budget_tokens(&self) -> u32 {
        match self {
            ReasoningEffort::Low => 1024,
            ReasoningEffort::Medium => 4096,
            ReasoningEffort::High => 16384,
        }
    }

    pub fn from_budget(tokens: u64) -> Self {
        match tokens {
            0..=2048 => ReasoningEffort::Low,
            2049..=8192 => ReasoningEffort::Medium,
            _ => ReasoningEffort::High,
        }
    }
}

/// One conversational request. Never mutated in place: each turn of the tool loop builds
/// a new value with [`CanonicalRequest::with_appended`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default)]
    pub desired_model_role: ModelRole,
}

impl CanonicalRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt)])
    }

    pub fn with_system(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_role(mut self, role: ModelRole) -> Self {
        self.desired_model_role = role;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_reasoning(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.sampling.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.sampling.temperature = Some(temperature);
        self
    }

    /// A new request with `messages` appended after the existing history.
    pub fn with_appended(&self, messages: impl IntoIterator<Item = Message>) -> Self {
        let mut next = self.clone();
        next.messages.extend(messages);
        next
    }

    /// System prompt plus any system-role messages, in order, joined by blank lines.
    pub fn combined_system(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .system_prompt
            .iter()
            .map(String::as_str)
            .chain(
                self.messages
                    .iter()
                    .filter(|m| m.role == MessageRole::System)
                    .map(|m| m.content.as_str()),
            )
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Messages without system-role entries (those are folded by [`Self::combined_system`]).
    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != MessageRole::System)
    }

    /// Rough token estimate (four characters per token) used for budgets before usage is known.
    pub fn estimated_input_tokens(&self) -> u64 {
        let chars: usize = self.system_prompt.as_ref().map_or(0, |s| s.len())
            + self.messages.iter().map(|m| m.content.len()).sum::<usize>();
        (chars as u64).div_ceil(4)
    }
}

//! Canonical response and usage

use super::tool::ToolCall;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Why a model call (or a whole conversation) ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Conversation hit its iteration ceiling and the answer was synthesized locally.
    IterationLimit,
    /// Conversation hit its cumulative token ceiling.
    TokenBudget,
    /// Conversation hit its wall-clock deadline.
    Deadline,
    Cancelled,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::IterationLimit => "max_iterations",
            FinishReason::TokenBudget => "token_budget",
            FinishReason::Deadline => "deadline",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            "max_iterations" => FinishReason::IterationLimit,
            "token_budget" => FinishReason::TokenBudget,
            "deadline" => FinishReason::Deadline,
            "cancelled" => FinishReason::Cancelled,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FinishReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(FinishReason::parse(&s))
    }
}

/// Normalized token usage. Always present, zero when a vendor omits it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Merge a (possibly cumulative, possibly partial) usage report from a stream.
    pub fn absorb(&mut self, other: Usage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// What the orchestrator should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimarySignal {
    /// Tool calls requested: execute them and loop.
    Continue,
    /// Text answer: finish.
    Terminal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub model_id: String,
}

impl CanonicalResponse {
    /// Non-empty tool calls win over text when both are present.
    pub fn primary_signal(&self) -> PrimarySignal {
        if self.tool_calls.is_empty() {
            PrimarySignal::Terminal
        } else {
            PrimarySignal::Continue
        }
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primary_signal() {
        let mut resp = CanonicalResponse {
            text: Some("let me look".into()),
            ..Default::default()
        };
        assert_eq!(resp.primary_signal(), PrimarySignal::Terminal);
        resp.tool_calls.push(ToolCall::new("c1", "search", json!({})));
        assert_eq!(resp.primary_signal(), PrimarySignal::Continue);
    }

    #[test]
    fn test_finish_reason_serde() {
        let v = serde_json::to_value(FinishReason::IterationLimit).unwrap();
        assert_eq!(v, json!("max_iterations"));
        let back: FinishReason = serde_json::from_value(json!("weird")).unwrap();
        assert_eq!(back, FinishReason::Other("weird".into()));
    }

    #[test]
    fn test_usage_absorb_keeps_max() {
        let mut u = Usage::new(10, 0);
        u.absorb(Usage::new(0, 7));
        u.absorb(Usage::new(10, 5));
        assert_eq!(u, Usage::new(10, 7));
    }
}

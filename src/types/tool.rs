//! Tool declarations, invocations and results

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool declaration advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
    /// The tool reads results produced earlier in the same iteration, so it must not
    /// run concurrently with the invocations requested before it.
    #[serde(default)]
    pub depends_on_prior: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            parameters,
            depends_on_prior: false,
        }
    }

    /// Derive the parameter schema from an argument type.
    pub fn for_args<T: JsonSchema>(name: impl Into<String>, description: impl Into<String>) -> Self {
        let schema = schemars::schema_for!(T);
        let mut parameters = serde_json::to_value(schema).unwrap_or(Value::Null);
        // Vendors reject the meta keys schemars emits at the root.
        if let Some(obj) = parameters.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
        }
        Self::new(name, description, parameters)
    }

    pub fn depends_on_prior(mut self) -> Self {
        self.depends_on_prior = true;
        self
    }
}

/// Tool call requested by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Arguments as the compact JSON string OpenAI-style wire formats carry.
    pub fn arguments_string(&self) -> String {
        match &self.arguments {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A tool call scheduled by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call: ToolCall,
    pub requested_at_iteration: u32,
    /// Position within the model's request; results are appended in this order.
    pub position: usize,
}

/// What a tool collaborator returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Value::String(text.into()),
            is_error: false,
        }
    }

    pub fn json(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Value::String(message.into()),
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub took_ms: u64,
}

impl ToolResult {
    pub fn from_output(invocation: &ToolInvocation, output: ToolOutput, took_ms: u64) -> Self {
        Self {
            call_id: invocation.call.id.clone(),
            name: invocation.call.name.clone(),
            content: output.content,
            is_error: output.is_error,
            took_ms,
        }
    }

    /// Text form fed back to the model.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Short single-line preview for `tool_end` events and synthesized answers.
    pub fn summary(&self, max_chars: usize) -> String {
        let flat = self.content_text().split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() <= max_chars {
            flat
        } else {
            let cut: String = flat.chars().take(max_chars).collect();
            format!("{}…", cut.trim_end())
        }
    }
}

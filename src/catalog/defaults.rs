//! Shipped catalog entries. Operator configuration can override any field.

use super::{MessageShape, ProfileOverride, ProviderFamily, ToolCallShape};
use crate::repair::{DefectPattern, KnownDefect};
use crate::tokens::ModelPricing;

fn defects(list: &[KnownDefect]) -> Option<Vec<DefectPattern>> {
    Some(list.iter().copied().map(DefectPattern::from).collect())
}

fn reasoning() -> ProfileOverride {
    ProfileOverride {
        supports_reasoning_parameter: Some(true),
        ..Default::default()
    }
}

fn priced(input: f64, output: f64) -> ProfileOverride {
    ProfileOverride {
        pricing: Some(ModelPricing::new(input, output)),
        ..Default::default()
    }
}

pub(super) fn builtin_entries() -> Vec<(ProviderFamily, &'static str, ProfileOverride)> {
    use KnownDefect::*;
    use ProviderFamily::*;

    vec![
        // OpenAI and OpenAI-compatible hosts
        (OpenAiCompatible, "gpt-4o", priced(0.0025, 0.01)),
        (OpenAiCompatible, "gpt-4o-mini", priced(0.00015, 0.0006)),
        (OpenAiCompatible, "gpt-4.1*", priced(0.002, 0.008)),
        (
            OpenAiCompatible,
            "o*-mini",
            ProfileOverride {
                message_shape: Some(MessageShape::SystemAsDeveloper),
                ..reasoning()
            },
        ),
        (
            OpenAiCompatible,
            "o3*",
            ProfileOverride {
                message_shape: Some(MessageShape::SystemAsDeveloper),
                ..reasoning()
            },
        ),
        (
            OpenAiCompatible,
            "o4*",
            ProfileOverride {
                message_shape: Some(MessageShape::SystemAsDeveloper),
                ..reasoning()
            },
        ),
        (OpenAiCompatible, "gpt-5*", reasoning()),
        (
            OpenAiCompatible,
            "llama-3*",
            ProfileOverride {
                known_output_defects: defects(&[FunctionTag, PythonTag, TemplateTokens]),
                ..Default::default()
            },
        ),
        (
            OpenAiCompatible,
            "meta-llama/*",
            ProfileOverride {
                known_output_defects: defects(&[FunctionTag, PythonTag, TemplateTokens]),
                ..Default::default()
            },
        ),
        (
            OpenAiCompatible,
            "qwen*",
            ProfileOverride {
                known_output_defects: defects(&[XmlToolCall, ThinkBlock]),
                ..Default::default()
            },
        ),
        (
            OpenAiCompatible,
            "deepseek-r1*",
            ProfileOverride {
                known_output_defects: defects(&[ThinkBlock]),
                tool_call_shape: Some(ToolCallShape::Unsupported),
                supports_structured_response_format: Some(false),
                ..Default::default()
            },
        ),
        (
            OpenAiCompatible,
            "deepseek-chat",
            ProfileOverride {
                known_output_defects: defects(&[DeepseekToolCalls]),
                ..Default::default()
            },
        ),
        (
            OpenAiCompatible,
            "mistral-*",
            ProfileOverride {
                known_output_defects: defects(&[MistralToolCalls]),
                ..Default::default()
            },
        ),
        (
            OpenAiCompatible,
            "open-mistral-*",
            ProfileOverride {
                known_output_defects: defects(&[MistralToolCalls]),
                ..Default::default()
            },
        ),
        // Anthropic
        (AnthropicMessages, "*", ProfileOverride {
            max_output_tokens: Some(4096),
            ..Default::default()
        }),
        (AnthropicMessages, "claude-3-7-sonnet*", reasoning()),
        (AnthropicMessages, "claude-sonnet-4*", reasoning()),
        (AnthropicMessages, "claude-opus-4*", reasoning()),
        (AnthropicMessages, "claude-3-5-sonnet*", priced(0.003, 0.015)),
        (AnthropicMessages, "claude-3-5-haiku*", priced(0.0008, 0.004)),
        // Gemini API
        (GeminiGenerate, "gemini-2.5-*", reasoning()),
        (GeminiGenerate, "gemini-2.0-flash*", priced(0.0001, 0.0004)),
        (
            GeminiGenerate,
            "gemma-*",
            ProfileOverride {
                message_shape: Some(MessageShape::SystemAsUser),
                tool_call_shape: Some(ToolCallShape::Unsupported),
                supports_structured_response_format: Some(false),
                ..Default::default()
            },
        ),
        // Cohere
        (CohereChat, "command-a-reasoning*", reasoning()),
        // Ollama
        (
            OllamaChat,
            "llama3*",
            ProfileOverride {
                known_output_defects: defects(&[PythonTag, TemplateTokens]),
                ..Default::default()
            },
        ),
        (
            OllamaChat,
            "qwen*",
            ProfileOverride {
                known_output_defects: defects(&[XmlToolCall, ThinkBlock]),
                ..reasoning()
            },
        ),
        (
            OllamaChat,
            "deepseek-r1*",
            ProfileOverride {
                known_output_defects: defects(&[ThinkBlock]),
                tool_call_shape: Some(ToolCallShape::Unsupported),
                ..reasoning()
            },
        ),
    ]
}

//! 输出修复模块：清除模型输出中泄漏的工具调用标记。
//!
//! # Output Repair
//!
//! Some hosted models leak raw tool-call markup or chat-template tokens into their text
//! output. Each model-format profile declares which defects it is known for; [`repair`]
//! strips exactly those, collapses the blank-line runs left behind, and is idempotent:
//! `repair(repair(x)) == repair(x)`.
//!
//! [`json`] recovers JSON values from near-miss model output (fences, trailing commas,
//! unbalanced brackets).

pub mod json;

use crate::{Error, ErrorContext, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A defect known ahead of time, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownDefect {
    /// `<tool_call>{...}</tool_call>` blocks (Hermes/Qwen templates).
    XmlToolCall,
    /// `<function_calls>...</function_calls>` blocks.
    FunctionCallsBlock,
    /// `<function=name>{...}</function>` (Llama 3.x on some hosts).
    FunctionTag,
    /// `<|python_tag|>` and everything after it.
    PythonTag,
    /// `[TOOL_CALLS]` and everything after it (Mistral).
    MistralToolCalls,
    /// DeepSeek `<｜tool▁calls▁begin｜>...<｜tool▁calls▁end｜>`.
    DeepseekToolCalls,
    /// `<think>...</think>` reasoning leaked into the answer.
    ThinkBlock,
    /// Bare chat-template control tokens such as `<|eot_id|>` or `<|im_end|>`.
    TemplateTokens,
}

impl KnownDefect {
    pub const ALL: [KnownDefect; 8] = [
        KnownDefect::XmlToolCall,
        KnownDefect::FunctionCallsBlock,
        KnownDefect::FunctionTag,
        KnownDefect::PythonTag,
        KnownDefect::MistralToolCalls,
        KnownDefect::DeepseekToolCalls,
        KnownDefect::ThinkBlock,
        KnownDefect::TemplateTokens,
    ];

    pub fn regex(&self) -> &'static Regex {
        match self {
            KnownDefect::XmlToolCall => &XML_TOOL_CALL,
            KnownDefect::FunctionCallsBlock => &FUNCTION_CALLS_BLOCK,
            KnownDefect::FunctionTag => &FUNCTION_TAG,
            KnownDefect::PythonTag => &PYTHON_TAG,
            KnownDefect::MistralToolCalls => &MISTRAL_TOOL_CALLS,
            KnownDefect::DeepseekToolCalls => &DEEPSEEK_TOOL_CALLS,
            KnownDefect::ThinkBlock => &THINK_BLOCK,
            KnownDefect::TemplateTokens => &TEMPLATE_TOKENS,
        }
    }
}

// Unterminated blocks are stripped to the end of the text: the model was cut off mid-call.
static XML_TOOL_CALL: Lazy<Regex> =
    Lazy::new(|| compile(r"(?s)<tool_call>.*?(?:</tool_call>|\z)|</tool_call>"));
static FUNCTION_CALLS_BLOCK: Lazy<Regex> =
    Lazy::new(|| compile(r"(?s)<function_calls>.*?(?:</function_calls>|\z)|</function_calls>"));
static FUNCTION_TAG: Lazy<Regex> =
    Lazy::new(|| compile(r"(?s)<function=[^>]*>.*?(?:</function>|\z)"));
static PYTHON_TAG: Lazy<Regex> = Lazy::new(|| compile(r"(?s)<\|python_tag\|>.*\z"));
static MISTRAL_TOOL_CALLS: Lazy<Regex> = Lazy::new(|| compile(r"(?s)\[TOOL_CALLS\].*\z"));
static DEEPSEEK_TOOL_CALLS: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?s)<｜tool▁calls▁begin｜>.*?(?:<｜tool▁calls▁end｜>|\z)|<｜tool▁[a-z▁]+｜>")
});
static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| compile(r"(?s)<think>.*?(?:</think>|\z)|</think>"));
static TEMPLATE_TOKENS: Lazy<Regex> = Lazy::new(|| {
    compile(r"<\|(?:eot_id|eom_id|end_of_text|begin_of_text|im_start|im_end|start_header_id|end_header_id|endoftext)\|>|<｜end▁of▁sentence｜>")
});
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| compile(r"\n[ \t]*\n(?:[ \t]*\n)+"));
static TRAILING_SPACE: Lazy<Regex> = Lazy::new(|| compile(r"(?m)[ \t]+$"));

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        // Built-in patterns are literals; a failure here is a programming error.
        Err(e) => panic!("invalid built-in repair pattern {pattern:?}: {e}"),
    }
}

/// One entry of a profile's defect table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "DefectSpec", into = "DefectSpec")]
pub enum DefectPattern {
    Known(KnownDefect),
    Custom { source: String, regex: Regex },
}

/// Serialized form: either a known defect name or `{ regex: "..." }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DefectSpec {
    Known(KnownDefect),
    Custom { regex: String },
}

impl TryFrom<DefectSpec> for DefectPattern {
    type Error = Error;

    fn try_from(spec: DefectSpec) -> Result<Self> {
        match spec {
            DefectSpec::Known(k) => Ok(DefectPattern::Known(k)),
            DefectSpec::Custom { regex } => DefectPattern::custom(&regex),
        }
    }
}

impl From<DefectPattern> for DefectSpec {
    fn from(p: DefectPattern) -> Self {
        match p {
            DefectPattern::Known(k) => DefectSpec::Known(k),
            DefectPattern::Custom { source, .. } => DefectSpec::Custom { regex: source },
        }
    }
}

impl DefectPattern {
    pub fn custom(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid output defect pattern: {}", e),
                ErrorContext::new()
                    .with_field_path("known_output_defects")
                    .with_details(pattern.to_string()),
            )
        })?;
        Ok(DefectPattern::Custom {
            source: pattern.to_string(),
            regex,
        })
    }

    fn regex(&self) -> &Regex {
        match self {
            DefectPattern::Known(k) => k.regex(),
            DefectPattern::Custom { regex, .. } => regex,
        }
    }
}

impl PartialEq for DefectPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DefectPattern::Known(a), DefectPattern::Known(b)) => a == b,
            (DefectPattern::Custom { source: a, .. }, DefectPattern::Custom { source: b, .. }) => {
                a == b
            }
            _ => false,
        }
    }
}

impl From<KnownDefect> for DefectPattern {
    fn from(k: KnownDefect) -> Self {
        DefectPattern::Known(k)
    }
}

impl fmt::Display for DefectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefectPattern::Known(k) => write!(f, "{:?}", k),
            DefectPattern::Custom { source, .. } => write!(f, "regex:{}", source),
        }
    }
}

const MAX_PASSES: usize = 16;

/// Strip the given defects, collapse blank-line runs and trim. Idempotent.
pub fn repair(text: &str, defects: &[DefectPattern]) -> String {
    let mut current = text.to_string();
    // Every change shortens the text, so this reaches a fixpoint; the cap guards custom patterns.
    for _ in 0..MAX_PASSES {
        let next = repair_pass(&current, defects);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// [`repair`] with every built-in defect enabled.
pub fn repair_all_known(text: &str) -> String {
    let all: Vec<DefectPattern> = KnownDefect::ALL.iter().copied().map(Into::into).collect();
    repair(text, &all)
}

fn repair_pass(text: &str, defects: &[DefectPattern]) -> String {
    let mut out = text.to_string();
    for defect in defects {
        let re = defect.regex();
        if re.is_match(&out) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    let out = TRAILING_SPACE.replace_all(&out, "");
    let out = BLANK_RUNS.replace_all(&out, "\n\n");
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(list: &[KnownDefect]) -> Vec<DefectPattern> {
        list.iter().copied().map(Into::into).collect()
    }

    #[test]
    fn test_strips_xml_tool_call() {
        let text = "Here you go.\n<tool_call>{\"name\":\"search\"}</tool_call>\n\n\n\nDone.";
        let out = repair(text, &known(&[KnownDefect::XmlToolCall]));
        assert_eq!(out, "Here you go.\n\nDone.");
    }

    #[test]
    fn test_only_declared_defects_are_stripped() {
        let text = "a <think>hmm</think> b";
        assert_eq!(repair(text, &[]), "a <think>hmm</think> b");
        assert_eq!(repair(text, &known(&[KnownDefect::ThinkBlock])), "a  b");
    }

    #[test]
    fn test_tail_markers_drop_rest_of_text() {
        let defects = known(&[KnownDefect::PythonTag, KnownDefect::MistralToolCalls]);
        assert_eq!(
            repair("Answer.<|python_tag|>{\"name\": \"x\"}", &defects),
            "Answer."
        );
        assert_eq!(repair("Answer.\n[TOOL_CALLS] [{}]", &defects), "Answer.");
    }

    #[test]
    fn test_nested_markup_reaches_fixpoint() {
        let text = "x <tool_<tool_call>inner</tool_call>call>y</tool_call> z";
        let defects = known(&[KnownDefect::XmlToolCall]);
        let once = repair(text, &defects);
        assert!(!once.contains("tool_call"));
        assert_eq!(repair(&once, &defects), once);
    }

    #[test]
    fn test_idempotent_on_corpus() {
        let corpus = [
            "",
            "   ",
            "plain answer",
            "a\n\n\n\nb\n \n \nc",
            "trailing   \nspaces\t\n",
            "<function=search>{\"q\":1}</function>after",
            "<｜tool▁calls▁begin｜><｜tool▁call▁begin｜>x<｜tool▁calls▁end｜>ok<｜end▁of▁sentence｜>",
            "<|im_start|>assistant\nhi<|im_end|>",
            "<function_calls><invoke></invoke></function_calls>\n\n\n\n\nthen",
            "unterminated <tool_call>{\"a\":",
            "<think>\nplan\n</think>\n\n\nAnswer",
        ];
        for text in corpus {
            let once = repair_all_known(text);
            assert_eq!(repair_all_known(&once), once, "not idempotent for {:?}", text);
        }
    }

    #[test]
    fn test_custom_pattern_roundtrips_through_serde() {
        let yaml = "- xml_tool_call\n- regex: \"<<SYS>>\"\n";
        let defects: Vec<DefectPattern> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(defects[0], DefectPattern::Known(KnownDefect::XmlToolCall));
        assert_eq!(repair("<<SYS>>hello", &defects), "hello");
        let back = serde_yaml::to_string(&defects).unwrap();
        assert!(back.contains("regex"));
    }

    #[test]
    fn test_invalid_custom_pattern_is_configuration_error() {
        let err = DefectPattern::custom("(unclosed").unwrap_err();
        assert_eq!(err.kind_name(), "configuration");
    }
}

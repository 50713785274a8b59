//! 模型目录模块：按厂商家族与模型 ID 查找格式配置。
//!
//! # Provider Catalog
//!
//! Every vendor difference the gateway cares about is data: a [`ProviderFamily`] picks the
//! wire format, and a [`ModelFormatProfile`] records per-model quirks (tool support,
//! structured output, reasoning parameter, known output defects, TPM, pricing).
//!
//! Profiles are resolved once per call by table lookup, layered as
//! family default ← matching wildcards (broadest first) ← exact model id. Built-in entries
//! ship with the crate; operator configuration merges on top of them.

mod defaults;

use crate::repair::DefectPattern;
use crate::tokens::ModelPricing;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Wire-format family. Adding a vendor that speaks an existing family is configuration only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderFamily {
    /// OpenAI Chat Completions and every host that clones it (Groq, Mistral, DeepSeek, OpenRouter, ...).
    #[serde(rename = "openai", alias = "openai_compatible")]
    OpenAiCompatible,
    #[serde(rename = "anthropic")]
    AnthropicMessages,
    #[serde(rename = "gemini", alias = "google")]
    GeminiGenerate,
    /// Cohere Chat v2.
    #[serde(rename = "cohere")]
    CohereChat,
    /// Native Ollama `/api/chat`.
    #[serde(rename = "ollama")]
    OllamaChat,
}

/// How the transport authenticates requests for a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    Header(&'static str),
    None,
}

impl ProviderFamily {
    pub const ALL: [ProviderFamily; 5] = [
        ProviderFamily::OpenAiCompatible,
        ProviderFamily::AnthropicMessages,
        ProviderFamily::GeminiGenerate,
        ProviderFamily::CohereChat,
        ProviderFamily::OllamaChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAiCompatible => "openai",
            ProviderFamily::AnthropicMessages => "anthropic",
            ProviderFamily::GeminiGenerate => "gemini",
            ProviderFamily::CohereChat => "cohere",
            ProviderFamily::OllamaChat => "ollama",
        }
    }

    /// Local runtimes need no credential; every hosted family does.
    pub fn requires_credential(&self) -> bool {
        !matches!(self, ProviderFamily::OllamaChat)
    }

    pub fn auth_style(&self) -> AuthStyle {
        match self {
            ProviderFamily::OpenAiCompatible | ProviderFamily::CohereChat => AuthStyle::Bearer,
            ProviderFamily::AnthropicMessages => AuthStyle::Header("x-api-key"),
            ProviderFamily::GeminiGenerate => AuthStyle::Header("x-goog-api-key"),
            ProviderFamily::OllamaChat => AuthStyle::None,
        }
    }

    /// Base URL used when a provider entry does not set `endpoint`.
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAiCompatible => "https://api.openai.com/v1/",
            ProviderFamily::AnthropicMessages => "https://api.anthropic.com/v1/",
            ProviderFamily::GeminiGenerate => "https://generativelanguage.googleapis.com/v1beta/",
            ProviderFamily::CohereChat => "https://api.cohere.com/v2/",
            ProviderFamily::OllamaChat => "http://localhost:11434/",
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| {
            Error::configuration_with_context(
                format!("unknown provider family '{}'", s),
                ErrorContext::new().with_details("expected openai, anthropic, gemini, cohere or ollama"),
            )
        })
    }
}

/// How system instructions are carried for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageShape {
    /// The family's native system slot.
    #[default]
    Standard,
    /// OpenAI reasoning models: system text goes out under the `developer` role.
    SystemAsDeveloper,
    /// Models without a system slot: system text is prefixed to the first user turn.
    SystemAsUser,
}

/// Whether a model accepts structured tool declarations at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallShape {
    /// The family's native tool-call format.
    #[default]
    Native,
    Unsupported,
}

/// Resolved per-model format profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelFormatProfile {
    pub family: ProviderFamily,
    pub message_shape: MessageShape,
    pub tool_call_shape: ToolCallShape,
    pub supports_structured_response_format: bool,
    pub supports_reasoning_parameter: bool,
    /// Structured output and tools cannot be sent in the same call.
    pub tools_exclude_response_format: bool,
    pub known_output_defects: Vec<DefectPattern>,
    /// Per-model TPM ceiling; overrides the provider entry's value when set.
    pub declared_tpm: Option<u64>,
    pub max_output_tokens: Option<u32>,
    pub pricing: Option<ModelPricing>,
}

impl ModelFormatProfile {
    pub fn family_default(family: ProviderFamily) -> Self {
        Self {
            family,
            message_shape: MessageShape::Standard,
            tool_call_shape: ToolCallShape::Native,
            supports_structured_response_format: !matches!(
                family,
                ProviderFamily::AnthropicMessages
            ),
            supports_reasoning_parameter: false,
            tools_exclude_response_format: true,
            known_output_defects: Vec::new(),
            declared_tpm: None,
            max_output_tokens: None,
            pricing: None,
        }
    }

    pub fn supports_tools(&self) -> bool {
        self.tool_call_shape != ToolCallShape::Unsupported
    }

    /// Output must be buffered and repaired before the caller sees it.
    pub fn needs_repair_buffering(&self) -> bool {
        !self.known_output_defects.is_empty()
    }

    fn apply(&mut self, o: &ProfileOverride) {
        if let Some(v) = o.message_shape {
            self.message_shape = v;
        }
        if let Some(v) = o.tool_call_shape {
            self.tool_call_shape = v;
        }
        if let Some(v) = o.supports_structured_response_format {
            self.supports_structured_response_format = v;
        }
        if let Some(v) = o.supports_reasoning_parameter {
            self.supports_reasoning_parameter = v;
        }
        if let Some(v) = o.tools_exclude_response_format {
            self.tools_exclude_response_format = v;
        }
        if let Some(v) = &o.known_output_defects {
            self.known_output_defects = v.clone();
        }
        if o.declared_tpm.is_some() {
            self.declared_tpm = o.declared_tpm;
        }
        if o.max_output_tokens.is_some() {
            self.max_output_tokens = o.max_output_tokens;
        }
        if o.pricing.is_some() {
            self.pricing = o.pricing.clone();
        }
    }
}

/// One catalog entry as written in configuration. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_shape: Option<MessageShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_shape: Option<ToolCallShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_structured_response_format: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_reasoning_parameter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_exclude_response_format: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_output_defects: Option<Vec<DefectPattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_tpm: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
}

impl ProfileOverride {
    /// Field-wise merge: values set in `other` win.
    fn merge(&mut self, other: ProfileOverride) {
        macro_rules! take {
            ($($field:ident),*) => { $( if other.$field.is_some() { self.$field = other.$field; } )* };
        }
        take!(
            message_shape,
            tool_call_shape,
            supports_structured_response_format,
            supports_reasoning_parameter,
            tools_exclude_response_format,
            known_output_defects,
            declared_tpm,
            max_output_tokens,
            pricing
        );
    }
}

/// `family -> model id or glob -> override`, the shape of the `catalog` config section.
pub type CatalogConfig = HashMap<ProviderFamily, HashMap<String, ProfileOverride>>;

#[derive(Debug, Clone, Default)]
struct FamilyEntries {
    exact: HashMap<String, ProfileOverride>,
    /// Glob patterns (`*` wildcard), most specific first. All matches apply.
    wildcards: Vec<(String, ProfileOverride)>,
}

impl FamilyEntries {
    fn insert(&mut self, key: String, entry: ProfileOverride) {
        if key.contains('*') {
            match self.wildcards.iter_mut().find(|(k, _)| *k == key) {
                Some((_, existing)) => existing.merge(entry),
                None => {
                    self.wildcards.push((key, entry));
                    self.wildcards
                        .sort_by_key(|(k, _)| std::cmp::Reverse(specificity(k)));
                }
            }
        } else {
            self.exact.entry(key).or_default().merge(entry);
        }
    }
}

/// Immutable after construction; shared as `Arc<ProviderCatalog>`.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    families: HashMap<ProviderFamily, FamilyEntries>,
}

impl ProviderCatalog {
    /// Catalog with no per-model entries: every model gets its family default.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the shipped model entries.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for (family, key, entry) in defaults::builtin_entries() {
            catalog.insert(family, key.to_string(), entry);
        }
        catalog
    }

    /// Built-in entries with operator configuration merged on top.
    pub fn from_config(config: CatalogConfig) -> Self {
        let mut catalog = Self::builtin();
        for (family, entries) in config {
            for (key, entry) in entries {
                catalog.insert(family, key, entry);
            }
        }
        catalog
    }

    pub fn insert(&mut self, family: ProviderFamily, key: String, entry: ProfileOverride) {
        self.families.entry(family).or_default().insert(key, entry);
    }

    /// Resolve the profile for `model` served through `family`.
    pub fn profile_for(&self, family: ProviderFamily, model: &str) -> ModelFormatProfile {
        let mut profile = ModelFormatProfile::family_default(family);
        if let Some(entries) = self.families.get(&family) {
            // Least specific first so narrower patterns win.
            for (_, wildcard) in entries.wildcards.iter().rev().filter(|(p, _)| glob_match(p, model)) {
                profile.apply(wildcard);
            }
            if let Some(exact) = entries.exact.get(model) {
                profile.apply(exact);
            }
        }
        profile
    }
}

fn specificity(pattern: &str) -> usize {
    pattern.chars().filter(|c| *c != '*').count()
}

/// Anchored glob match where `*` matches any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if text.len() < first.len() + last.len() || !text.starts_with(first) || !text.ends_with(last) {
        return false;
    }
    let mut rest = &text[first.len()..text.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(i) => rest = &rest[i + middle.len()..],
            None => return false,
        }
    }
    true
}

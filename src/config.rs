//! 配置模块：从 YAML/JSON 加载网关配置并应用环境变量覆盖。
//!
//! # Gateway Configuration
//!
//! One file describes the providers, catalog overrides, role pools and the limits of the
//! dispatcher and orchestrator. Sections that are left out take their defaults, and a file
//! without a `catalog` section runs on the built-in catalog.
//!
//! ```yaml
//! providers:
//!   - id: openai
//!     family: openai
//!     api_key_env: OPENAI_API_KEY
//!     models: [gpt-4o, gpt-4o-mini]
//!     tpm: 30000
//!   - id: local
//!     family: ollama
//!     endpoint: http://localhost:11434
//! roles:
//!   planning: [gpt-4o-mini]
//!   final_answer: [gpt-4o, { model: llama3.1, provider: local }]
//! orchestrator:
//!   max_iterations: 6
//! ```
//!
//! Environment overrides, applied after the file is read:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `AI_GATEWAY_MAX_ITERATIONS` | `orchestrator.max_iterations` |
//! | `AI_GATEWAY_CALL_TIMEOUT_SECS` | `dispatch.call_timeout_secs` |
//! | `AI_GATEWAY_FALLBACK_MODEL` | `fallback_model` |
//! | `AI_GATEWAY_SATURATION_THRESHOLD` | `selector.saturation_threshold` |
//!
//! HTTP-level settings (`AI_GATEWAY_HTTP_TIMEOUT_SECS`, `AI_GATEWAY_PROXY_URL`) are read by
//! [`HttpTransport`](crate::transport::HttpTransport).

use crate::catalog::{CatalogConfig, ProviderCatalog, ProviderFamily};
use crate::dispatch::RetryPolicy;
use crate::orchestrator::OrchestratorConfig;
use crate::registry::{parse_endpoint, ProviderEntry, ProviderRegistry};
use crate::routing::{PoolMember, DEFAULT_SATURATION_THRESHOLD};
use crate::types::ModelRole;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// One provider entry as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: String,
    pub family: ProviderFamily,
    /// Base URL; the family default when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Literal credential. Prefer `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Name of the environment variable holding the credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Allowed models; empty means any.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub tpm: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ProviderConfig {
    fn to_entry(&self, index: usize, env: &dyn Fn(&str) -> Option<String>) -> Result<ProviderEntry> {
        let endpoint = match &self.endpoint {
            Some(raw) => parse_endpoint(raw).map_err(|e| {
                Error::configuration_with_context(
                    e.to_string(),
                    ErrorContext::new()
                        .with_field_path(format!("providers[{}].endpoint", index))
                        .with_source("gateway_config"),
                )
            })?,
            None => parse_endpoint(self.family.default_endpoint())?,
        };
        let mut entry = ProviderEntry::new(&self.id, self.family, endpoint)
            .with_models(self.models.iter().cloned())
            .with_tpm(self.tpm)
            .with_priority(self.priority);
        for (name, value) in &self.headers {
            entry = entry.with_header(name, value);
        }

        let secret = self
            .api_key
            .clone()
            .or_else(|| self.api_key_env.as_deref().and_then(|var| env(var)))
            .filter(|s| !s.trim().is_empty());
        match secret {
            Some(secret) => entry = entry.with_credential(secret),
            None if self.family.requires_credential() => warn!(
                provider = %self.id,
                env = self.api_key_env.as_deref().unwrap_or("-"),
                "provider has no credential and will be skipped"
            ),
            None => {}
        }
        Ok(entry)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectorConfig {
    pub saturation_threshold: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            saturation_threshold: DEFAULT_SATURATION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub call_timeout_secs: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_rate_limit_retries: u32,
    pub max_transient_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            call_timeout_secs: 120,
            base_backoff_ms: policy.base_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            max_rate_limit_retries: policy.max_rate_limit_retries,
            max_transient_retries: policy.max_transient_retries,
        }
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_rate_limit_retries: self.max_rate_limit_retries,
            max_transient_retries: self.max_transient_retries,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// The `orchestrator` section. Durations are whole seconds; `0` disables a ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorSection {
    pub max_iterations: u32,
    pub max_total_tokens: u64,
    pub conversation_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    /// `0` runs every invocation of a wave at once.
    pub max_parallel_tools: usize,
    pub channel_capacity: usize,
    pub follow_up_role: ModelRole,
    pub stream: bool,
    /// `0` turns tool-result summarization off.
    pub summarize_over_chars: usize,
    pub summary_max_tokens: u32,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let d = OrchestratorConfig::default();
        Self {
            max_iterations: d.max_iterations,
            max_total_tokens: d.max_total_tokens.unwrap_or(0),
            conversation_timeout_secs: d.conversation_timeout.map_or(0, |t| t.as_secs()),
            tool_timeout_secs: d.tool_timeout.as_secs(),
            max_parallel_tools: d.max_parallel_tools.unwrap_or(0),
            channel_capacity: d.channel_capacity,
            follow_up_role: d.follow_up_role,
            stream: d.stream,
            summarize_over_chars: d.summarize_over_chars.unwrap_or(0),
            summary_max_tokens: d.summary_max_tokens,
        }
    }
}

impl OrchestratorSection {
    pub fn to_config(&self) -> OrchestratorConfig {
        let nonzero = |v: u64| Some(v).filter(|v| *v > 0);
        OrchestratorConfig {
            max_iterations: self.max_iterations,
            max_total_tokens: nonzero(self.max_total_tokens),
            conversation_timeout: nonzero(self.conversation_timeout_secs).map(Duration::from_secs),
            tool_timeout: Duration::from_secs(self.tool_timeout_secs.max(1)),
            max_parallel_tools: Some(self.max_parallel_tools).filter(|n| *n > 0),
            channel_capacity: self.channel_capacity.max(1),
            follow_up_role: self.follow_up_role,
            stream: self.stream,
            summarize_over_chars: Some(self.summarize_over_chars).filter(|n| *n > 0),
            summary_max_tokens: self.summary_max_tokens,
            ..OrchestratorConfig::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Role → model pool.
    #[serde(default)]
    pub roles: HashMap<ModelRole, Vec<PoolMember>>,
    /// Served instead when nothing can serve a requested model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

impl GatewayConfig {
    /// Load a YAML (`.yaml`/`.yml`) or JSON (`.json`) file, apply environment overrides and
    /// validate.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("gateway_config"),
            )
        })?;
        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text)?,
            _ => Self::from_yaml_str(&text)?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source. Unparseable values are ignored with a warning.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(variable = name, value = %raw, "ignoring unparseable override");
                    None
                }
            }
        }

        if let Some(n) = parsed("AI_GATEWAY_MAX_ITERATIONS", lookup("AI_GATEWAY_MAX_ITERATIONS")) {
            self.orchestrator.max_iterations = n;
        }
        if let Some(n) = parsed("AI_GATEWAY_CALL_TIMEOUT_SECS", lookup("AI_GATEWAY_CALL_TIMEOUT_SECS")) {
            self.dispatch.call_timeout_secs = n;
        }
        if let Some(t) = parsed(
            "AI_GATEWAY_SATURATION_THRESHOLD",
            lookup("AI_GATEWAY_SATURATION_THRESHOLD"),
        ) {
            self.selector.saturation_threshold = t;
        }
        if let Some(model) = lookup("AI_GATEWAY_FALLBACK_MODEL").filter(|m| !m.trim().is_empty()) {
            self.fallback_model = Some(model.trim().to_string());
        }
    }

    /// Static checks that do not need credentials or network access.
    pub fn validate(&self) -> Result<()> {
        self.validate_settings()?;
        let ids: HashSet<&str> = self.providers.iter().map(|p| p.id.as_str()).collect();
        self.validate_pins(|id| ids.contains(id))
    }

    /// Every provider a pool member is pinned to must exist.
    pub(crate) fn validate_pins(&self, known: impl Fn(&str) -> bool) -> Result<()> {
        for (role, members) in &self.roles {
            for (i, member) in members.iter().enumerate() {
                if let Some(pinned) = member.provider() {
                    if !known(pinned) {
                        return Err(Error::configuration_with_context(
                            format!("pool member pinned to unknown provider '{}'", pinned),
                            ErrorContext::new()
                                .with_field_path(format!("roles.{}[{}].provider", role, i))
                                .with_source("gateway_config"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn validate_settings(&self) -> Result<()> {
        let invalid = |msg: String, field: String| {
            Err(Error::configuration_with_context(
                msg,
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("gateway_config"),
            ))
        };

        if self.orchestrator.max_iterations == 0 {
            return invalid(
                "max_iterations must be at least 1".into(),
                "orchestrator.max_iterations".into(),
            );
        }
        let threshold = self.selector.saturation_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid(
                format!("saturation_threshold must be in (0, 1], got {}", threshold),
                "selector.saturation_threshold".into(),
            );
        }
        if self.dispatch.max_backoff_ms < self.dispatch.base_backoff_ms {
            return invalid(
                "max_backoff_ms is below base_backoff_ms".into(),
                "dispatch.max_backoff_ms".into(),
            );
        }

        let mut ids = HashSet::new();
        for (i, provider) in self.providers.iter().enumerate() {
            if provider.id.trim().is_empty() {
                return invalid("provider id is empty".into(), format!("providers[{}].id", i));
            }
            if !ids.insert(provider.id.as_str()) {
                return invalid(
                    format!("duplicate provider id '{}'", provider.id),
                    format!("providers[{}].id", i),
                );
            }
            if provider.api_key.is_some() && provider.api_key_env.is_some() {
                return invalid(
                    "set either api_key or api_key_env, not both".into(),
                    format!("providers[{}]", i),
                );
            }
        }
        Ok(())
    }

    /// Build the provider registry, resolving `api_key_env` from the process environment.
    pub fn build_registry(&self) -> Result<ProviderRegistry> {
        self.build_registry_with(|name| std::env::var(name).ok())
    }

    pub fn build_registry_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<ProviderRegistry> {
        let entries = self
            .providers
            .iter()
            .enumerate()
            .map(|(i, p)| p.to_entry(i, &env))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProviderRegistry::new(entries)?.with_fallback_model(self.fallback_model.clone()))
    }

    /// Built-in catalog with this file's `catalog` section merged on top.
    pub fn build_catalog(&self) -> ProviderCatalog {
        ProviderCatalog::from_config(self.catalog.clone())
    }
}

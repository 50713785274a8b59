//! Provider 注册表 — 凭据、端点与模型白名单的只读查找
//!
//! Provider registry: which configured backends can serve which model, in priority order.
//! Entries are immutable once built. Caller-supplied entries live in a [`RequestScope`]
//! overlay and disappear with it.

use crate::catalog::ProviderFamily;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use url::Url;
use tracing::warn;

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Operator,
    Caller,
}

/// API credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub id: String,
    pub family: ProviderFamily,
    pub credential: Option<Credential>,
    /// Base URL including any version prefix; adapter paths are joined onto it.
    pub endpoint: Url,
    /// Models this entry may serve. Empty means any model.
    pub allowed_models: HashSet<String>,
    /// Tokens-per-minute ceiling for each model served through this entry. Zero means unmetered.
    pub declared_tpm: u64,
    pub priority: i32,
    pub origin: Origin,
    pub extra_headers: HashMap<String, String>,
}

impl ProviderEntry {
    pub fn new(id: impl Into<String>, family: ProviderFamily, endpoint: Url) -> Self {
        Self {
            id: id.into(),
            family,
            credential: None,
            endpoint,
            allowed_models: HashSet::new(),
            declared_tpm: 0,
            priority: 0,
            origin: Origin::Operator,
            extra_headers: HashMap::new(),
        }
    }

    /// Entry at the family's default endpoint.
    pub fn with_default_endpoint(id: impl Into<String>, family: ProviderFamily) -> Result<Self> {
        let endpoint = parse_endpoint(family.default_endpoint())?;
        Ok(Self::new(id, family, endpoint))
    }

    pub fn with_credential(mut self, secret: impl Into<String>) -> Self {
        self.credential = Some(Credential::new(secret));
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tpm(mut self, tpm: u64) -> Self {
        self.declared_tpm = tpm;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    pub fn from_caller(mut self) -> Self {
        self.origin = Origin::Caller;
        self
    }

    pub fn allows(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.contains(model)
    }

    /// Has what it needs to make a call.
    pub fn is_usable(&self) -> bool {
        self.credential.is_some() || !self.family.requires_credential()
    }

    pub fn serves(&self, model: &str) -> bool {
        self.allows(model) && self.is_usable()
    }
}

/// Normalize a base URL so relative adapter paths join under it rather than replacing its last segment.
pub fn parse_endpoint(raw: &str) -> Result<Url> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|e| {
        Error::configuration_with_context(
            format!("invalid provider endpoint: {}", e),
            ErrorContext::new().with_details(raw.to_string()),
        )
    })
}

/// Providers that can serve a model, best first.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The model actually being served (differs from the request when the fallback applied).
    pub model: String,
    pub providers: Vec<Arc<ProviderEntry>>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    entries: Vec<Arc<ProviderEntry>>,
    fallback_model: Option<String>,
}

impl ProviderRegistry {
    pub fn new(entries: Vec<ProviderEntry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for (i, entry) in entries.iter().enumerate() {
            if !seen.insert(entry.id.clone()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate provider id '{}'", entry.id),
                    ErrorContext::new().with_field_path(format!("providers[{}].id", i)),
                ));
            }
        }
        Ok(Self {
            entries: entries.into_iter().map(Arc::new).collect(),
            fallback_model: None,
        })
    }

    pub fn with_fallback_model(mut self, model: Option<String>) -> Self {
        self.fallback_model = model;
        self
    }

    pub fn fallback_model(&self) -> Option<&str> {
        self.fallback_model.as_deref()
    }

    pub fn entries(&self) -> &[Arc<ProviderEntry>] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.iter().find(|e| e.id == id).cloned()
    }

    /// Usable entries allowed to serve `model`, priority descending (stable on ties).
    pub fn resolve_providers_for_model(&self, model: &str) -> Result<Vec<Arc<ProviderEntry>>> {
        Ok(self.resolve(model)?.providers)
    }

    pub fn resolve(&self, model: &str) -> Result<Resolution> {
        resolve_in(self.entries.iter(), model, self.fallback_model.as_deref())
    }

    /// Per-request overlay that can hold caller-supplied entries.
    pub fn scope(self: &Arc<Self>) -> RequestScope {
        RequestScope {
            base: Arc::clone(self),
            ephemeral: Vec::new(),
        }
    }
}

fn resolve_in<'a>(
    entries: impl Iterator<Item = &'a Arc<ProviderEntry>> + Clone,
    model: &str,
    fallback: Option<&str>,
) -> Result<Resolution> {
    let candidates = |m: &str| {
        let mut found: Vec<Arc<ProviderEntry>> =
            entries.clone().filter(|e| e.serves(m)).cloned().collect();
        found.sort_by_key(|e| std::cmp::Reverse(e.priority));
        found
    };

    let providers = candidates(model);
    if !providers.is_empty() {
        return Ok(Resolution {
            model: model.to_string(),
            providers,
            used_fallback: false,
        });
    }
    if let Some(fallback) = fallback.filter(|f| *f != model) {
        let providers = candidates(fallback);
        if !providers.is_empty() {
            warn!(requested = model, fallback, "no provider serves model, using fallback");
            return Ok(Resolution {
                model: fallback.to_string(),
                providers,
                used_fallback: true,
            });
        }
    }
    Err(Error::configuration_with_context(
        format!("no usable provider can serve model '{}'", model),
        ErrorContext::new()
            .with_source("provider_registry")
            .with_details(match fallback {
                Some(f) => format!("fallback model '{}' is not servable either", f),
                None => "no fallback model configured".to_string(),
            }),
    ))
}

/// Registry view for one request: operator entries plus caller-supplied ephemeral ones.
#[derive(Debug, Clone)]
pub struct RequestScope {
    base: Arc<ProviderRegistry>,
    ephemeral: Vec<Arc<ProviderEntry>>,
}

impl RequestScope {
    /// Add a caller-supplied entry. It shadows an operator entry with the same id.
    pub fn register_ephemeral(&mut self, entry: ProviderEntry) {
        let entry = Arc::new(entry.from_caller());
        self.ephemeral.retain(|e| e.id != entry.id);
        self.ephemeral.push(entry);
    }

    pub fn with_ephemeral(mut self, entry: ProviderEntry) -> Self {
        self.register_ephemeral(entry);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProviderEntry>> {
        self.ephemeral
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .or_else(|| self.base.get(id))
    }

    fn visible(&self) -> Vec<Arc<ProviderEntry>> {
        // Caller entries come first so they win priority ties.
        self.ephemeral
            .iter()
            .cloned()
            .chain(
                self.base
                    .entries
                    .iter()
                    .filter(|b| !self.ephemeral.iter().any(|e| e.id == b.id))
                    .cloned(),
            )
            .collect()
    }

    pub fn resolve(&self, model: &str) -> Result<Resolution> {
        let visible = self.visible();
        resolve_in(visible.iter(), model, self.base.fallback_model())
    }

    pub fn resolve_providers_for_model(&self, model: &str) -> Result<Vec<Arc<ProviderEntry>>> {
        Ok(self.resolve(model)?.providers)
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.base
    }
}

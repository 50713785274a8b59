//! 模型选择模块：按角色轮询并避开接近 TPM 上限的模型。
//!
//! # Model Selector
//!
//! Pure selection logic: no network calls. Each [`ModelRole`] owns a monotonically
//! increasing counter; a pick starts at `counter % pool.len()` and walks the pool in
//! rotation order, skipping candidates whose trailing-window usage is at or above the
//! saturation threshold. When every candidate is saturated the least-saturated one is
//! returned (ties go to the earliest in rotation order).

use crate::budget::RateBudget;
use crate::registry::RequestScope;
use crate::types::ModelRole;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_SATURATION_THRESHOLD: f64 = 0.8;

/// One entry of a role pool as written in configuration: a model id, optionally pinned to
/// a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoolMember {
    Model(String),
    Pinned { model: String, provider: String },
}

impl PoolMember {
    pub fn model(&self) -> &str {
        match self {
            PoolMember::Model(m) => m,
            PoolMember::Pinned { model, .. } => model,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            PoolMember::Model(_) => None,
            PoolMember::Pinned { provider, .. } => Some(provider),
        }
    }
}

impl From<&str> for PoolMember {
    fn from(model: &str) -> Self {
        PoolMember::Model(model.to_string())
    }
}

/// A concrete `(provider, model)` the dispatcher can call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub provider_id: String,
    pub model_id: String,
    /// Effective TPM ceiling (catalog override or the provider entry's value). Zero is unmetered.
    pub declared_tpm: u64,
}

impl Candidate {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>, declared_tpm: u64) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            declared_tpm,
        }
    }
}

/// Resolve pool members into candidates through a request scope. Members nobody can serve are
/// dropped with a warning; an entirely unservable pool is a configuration error.
pub fn resolve_pool(
    scope: &RequestScope,
    role: ModelRole,
    pool: &[PoolMember],
    tpm_for: impl Fn(&crate::registry::ProviderEntry, &str) -> u64,
) -> Result<Vec<Candidate>> {
    let mut out = Vec::with_capacity(pool.len());
    for member in pool {
        let resolved = match member.provider() {
            Some(pid) => scope
                .get(pid)
                .filter(|e| e.serves(member.model()))
                .map(|e| (e, member.model().to_string())),
            None => scope
                .resolve(member.model())
                .ok()
                .and_then(|r| r.providers.into_iter().next().map(|e| (e, r.model))),
        };
        match resolved {
            Some((entry, model)) => {
                let tpm = tpm_for(&entry, &model);
                let candidate = Candidate::new(entry.id.clone(), model, tpm);
                if !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
            None => warn!(role = %role, model = member.model(), "pool member has no usable provider"),
        }
    }
    if out.is_empty() {
        return Err(Error::configuration_with_context(
            format!("no model in the '{}' pool can be served", role),
            ErrorContext::new()
                .with_field_path(format!("roles.{}", role))
                .with_source("model_selector"),
        ));
    }
    Ok(out)
}

#[derive(Debug)]
pub struct ModelSelector {
    budget: Arc<RateBudget>,
    threshold: f64,
    counters: [AtomicU64; 4],
}

impl ModelSelector {
    pub fn new(budget: Arc<RateBudget>) -> Self {
        Self::with_threshold(budget, DEFAULT_SATURATION_THRESHOLD)
    }

    pub fn with_threshold(budget: Arc<RateBudget>, threshold: f64) -> Self {
        Self {
            budget,
            threshold,
            counters: Default::default(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    pub fn pick(&self, role: ModelRole, pool: &[Candidate]) -> Result<Candidate> {
        self.pick_excluding(role, pool, &[])
    }

    /// Like [`Self::pick`] but never returns a candidate whose model is in `exclude_models`.
    pub fn pick_excluding(
        &self,
        role: ModelRole,
        pool: &[Candidate],
        exclude_models: &[String],
    ) -> Result<Candidate> {
        let eligible: Vec<&Candidate> = pool
            .iter()
            .filter(|c| !exclude_models.contains(&c.model_id))
            .collect();
        if eligible.is_empty() {
            return Err(Error::configuration_with_context(
                format!("no eligible model left in the '{}' pool", role),
                ErrorContext::new()
                    .with_source("model_selector")
                    .with_details(format!("{} candidate(s), {} excluded", pool.len(), exclude_models.len())),
            ));
        }

        let turn = self.counters[role.index()].fetch_add(1, Ordering::Relaxed);
        let start = (turn % eligible.len() as u64) as usize;
        let mut least: Option<(&Candidate, f64)> = None;
        for offset in 0..eligible.len() {
            let candidate = eligible[(start + offset) % eligible.len()];
            let saturation =
                self.budget
                    .saturation(&candidate.provider_id, &candidate.model_id, candidate.declared_tpm);
            if saturation < self.threshold {
                return Ok(candidate.clone());
            }
            if least.map_or(true, |(_, s)| saturation < s) {
                least = Some((candidate, saturation));
            }
        }

        // Every candidate is saturated.
        let (candidate, saturation) = least.ok_or_else(|| Error::configuration("empty pool"))?;
        warn!(
            role = %role,
            provider = %candidate.provider_id,
            model = %candidate.model_id,
            saturation,
            "all candidates saturated, using least loaded"
        );
        Ok(candidate.clone())
    }
}

/// Resolved candidates per role. A role without its own pool borrows the final-answer pool.
#[derive(Debug, Clone, Default)]
pub struct RolePools {
    pools: HashMap<ModelRole, Vec<Candidate>>,
}

impl RolePools {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same candidates for every role.
    pub fn uniform(candidates: Vec<Candidate>) -> Self {
        let mut pools = Self::new();
        for role in ModelRole::ALL {
            pools.insert(role, candidates.clone());
        }
        pools
    }

    pub fn insert(&mut self, role: ModelRole, candidates: Vec<Candidate>) {
        self.pools.insert(role, candidates);
    }

    pub fn with(mut self, role: ModelRole, candidates: Vec<Candidate>) -> Self {
        self.insert(role, candidates);
        self
    }

    pub fn for_role(&self, role: ModelRole) -> Option<&[Candidate]> {
        self.pools
            .get(&role)
            .filter(|p| !p.is_empty())
            .or_else(|| self.pools.get(&ModelRole::FinalAnswer).filter(|p| !p.is_empty()))
            .map(Vec::as_slice)
    }

    /// Resolve configured pool members through `scope`. Roles nobody can serve are left out
    /// (they fall back to the final-answer pool); it is an error only when no role resolves.
    pub fn resolve(
        scope: &RequestScope,
        members: &HashMap<ModelRole, Vec<PoolMember>>,
        tpm_for: impl Fn(&crate::registry::ProviderEntry, &str) -> u64,
    ) -> Result<Self> {
        let mut pools = Self::new();
        let mut last_error = None;
        for role in ModelRole::ALL {
            let Some(configured) = members.get(&role) else {
                continue;
            };
            match resolve_pool(scope, role, configured, &tpm_for) {
                Ok(candidates) => pools.insert(role, candidates),
                Err(e) => {
                    warn!(role = %role, error = %e, "role pool left unresolved");
                    last_error = Some(e);
                }
            }
        }
        if pools.pools.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                Error::configuration_with_context(
                    "no role pools configured",
                    ErrorContext::new().with_field_path("roles").with_source("model_selector"),
                )
            }));
        }
        Ok(pools)
    }

    pub fn roles(&self) -> impl Iterator<Item = (&ModelRole, &Vec<Candidate>)> {
        self.pools.iter()
    }
}

//! Gateway facade: wires registry, catalog, budget, selector, dispatcher and orchestrator
//! from one [`GatewayConfig`].

use crate::budget::RateBudget;
use crate::catalog::ProviderCatalog;
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::orchestrator::{Conversation, Orchestrator, OrchestratorConfig, ToolCollaborator, ToolRegistry};
use crate::registry::{ProviderEntry, ProviderRegistry, RequestScope};
use crate::routing::{ModelSelector, PoolMember, RolePools};
use crate::transport::{HttpTransport, Transport};
use crate::types::{CanonicalRequest, CanonicalResponse, ModelRole};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    roles: HashMap<ModelRole, Vec<PoolMember>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("providers", &self.registry.entries().len())
            .field("roles", &self.roles)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Gateway over HTTP with everything taken from `config`.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        GatewayBuilder::new().config(config).build()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        self.dispatcher.budget()
    }

    /// Operator providers only; add caller credentials with
    /// [`RequestScope::register_ephemeral`].
    pub fn scope(&self) -> RequestScope {
        self.registry.scope()
    }

    /// Role pools as servable through `scope`.
    pub fn pools(&self, scope: &RequestScope) -> Result<RolePools> {
        let dispatcher = Arc::clone(&self.dispatcher);
        RolePools::resolve(scope, &self.roles, move |entry, model| {
            dispatcher.declared_tpm(entry, model)
        })
    }

    /// Start a conversation with the operator providers.
    pub fn chat(&self, request: CanonicalRequest) -> Result<Conversation> {
        self.chat_in(self.scope(), request)
    }

    /// Start a conversation within `scope`. Fails up front when no role pool can be served.
    pub fn chat_in(&self, scope: RequestScope, request: CanonicalRequest) -> Result<Conversation> {
        let pools = self.pools(&scope)?;
        Ok(self.orchestrator.spawn(scope, pools, request))
    }

    /// One role-level model call without the tool loop.
    pub async fn complete(
        &self,
        scope: &RequestScope,
        role: ModelRole,
        request: &CanonicalRequest,
    ) -> Result<CanonicalResponse> {
        let pools = self.pools(scope)?;
        let pool = pools.for_role(role).ok_or_else(|| {
            crate::Error::configuration(format!("no model pool for role '{}'", role))
        })?;
        Ok(self
            .dispatcher
            .call_for_role(scope, role, pool, request, None)
            .await?)
    }
}

/// Builder for [`Gateway`]. Programmatic providers and roles are added on top of the config.
pub struct GatewayBuilder {
    config: GatewayConfig,
    extra_providers: Vec<ProviderEntry>,
    transport: Option<Arc<dyn Transport>>,
    budget: Option<Arc<RateBudget>>,
    tools: Vec<Arc<dyn ToolCollaborator>>,
    orchestrator: Option<OrchestratorConfig>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            extra_providers: Vec::new(),
            transport: None,
            budget: None,
            tools: Vec::new(),
            orchestrator: None,
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn provider(mut self, entry: ProviderEntry) -> Self {
        self.extra_providers.push(entry);
        self
    }

    pub fn role<I, M>(mut self, role: ModelRole, members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<PoolMember>,
    {
        self.config
            .roles
            .insert(role, members.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the HTTP transport (scripted transports in tests, custom clients).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share a budget across gateways.
    pub fn budget(mut self, budget: Arc<RateBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn ToolCollaborator>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Overrides the `orchestrator` config section.
    pub fn orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator = Some(config);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        self.config.validate_settings()?;

        let mut entries: Vec<ProviderEntry> = self
            .config
            .build_registry()?
            .entries()
            .iter()
            .map(|e| (**e).clone())
            .collect();
        entries.extend(self.extra_providers);
        let registry = Arc::new(
            ProviderRegistry::new(entries)?.with_fallback_model(self.config.fallback_model.clone()),
        );
        self.config.validate_pins(|id| registry.get(id).is_some())?;

        let catalog: Arc<ProviderCatalog> = Arc::new(self.config.build_catalog());
        let budget = self.budget.unwrap_or_else(|| Arc::new(RateBudget::new()));
        let selector = Arc::new(ModelSelector::with_threshold(
            budget,
            self.config.selector.saturation_threshold,
        ));
        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new()?),
        };
        let dispatcher = Arc::new(
            Dispatcher::new(catalog, selector, transport)
                .with_policy(self.config.dispatch.retry_policy())
                .with_call_timeout(self.config.dispatch.call_timeout()),
        );

        let mut tools = ToolRegistry::new();
        for tool in self.tools {
            tools.register(tool)?;
        }
        let orchestrator_config = self
            .orchestrator
            .unwrap_or_else(|| self.config.orchestrator.to_config());
        let orchestrator = Arc::new(
            Orchestrator::new(Arc::clone(&dispatcher), Arc::new(tools)).with_config(orchestrator_config),
        );

        debug!(
            providers = registry.entries().len(),
            roles = self.config.roles.len(),
            tools = orchestrator.tools().len(),
            "gateway built"
        );
        Ok(Gateway {
            registry,
            dispatcher,
            orchestrator,
            roles: self.config.roles,
        })
    }
}

//! Tool collaborators, argument validation and wave planning.

use crate::types::{ToolInvocation, ToolOutput, ToolResult, ToolSpec};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// An external capability the model may call. Implementations decide how the work is done;
/// the orchestrator only needs the declared spec and the call/result shape.
#[async_trait]
pub trait ToolCollaborator: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn invoke(&self, name: &str, arguments: Value) -> ToolOutput;
}

struct RegisteredTool {
    collaborator: Arc<dyn ToolCollaborator>,
    spec: ToolSpec,
    validator: Option<JSONSchema>,
}

/// Tools available to one orchestrator, keyed by name, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.order).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collaborator. Its parameter schema is compiled once here.
    pub fn register(&mut self, collaborator: Arc<dyn ToolCollaborator>) -> Result<()> {
        let spec = collaborator.spec();
        if self.tools.contains_key(&spec.name) {
            return Err(Error::configuration_with_context(
                format!("tool '{}' registered twice", spec.name),
                ErrorContext::new().with_source("tool_registry"),
            ));
        }
        let validator = if spec.parameters.is_object() {
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&spec.parameters)
                .map_err(|e| {
                    Error::configuration_with_context(
                        format!("tool '{}' has an invalid parameter schema: {}", spec.name, e),
                        ErrorContext::new()
                            .with_field_path(format!("tools.{}.parameters", spec.name))
                            .with_source("tool_registry"),
                    )
                })?;
            Some(compiled)
        } else {
            None
        };
        self.order.push(spec.name.clone());
        self.tools.insert(
            spec.name.clone(),
            RegisteredTool {
                collaborator,
                spec,
                validator,
            },
        );
        Ok(())
    }

    pub fn with(mut self, collaborator: Arc<dyn ToolCollaborator>) -> Result<Self> {
        self.register(collaborator)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| &t.spec)
    }

    /// Declarations for the canonical request, in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.spec.clone())
            .collect()
    }

    /// Check arguments against the tool's schema; the error lists every violation.
    pub fn validate(&self, name: &str, arguments: &Value) -> std::result::Result<(), String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("unknown tool '{}'", name))?;
        let Some(validator) = &tool.validator else {
            return Ok(());
        };
        let result = validator.validate(arguments);
        if let Err(errors) = result {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(format!("invalid arguments for '{}': {}", name, messages.join("; ")));
        }
        Ok(())
    }

    /// Run one invocation. Unknown tools, schema violations and timeouts become error
    /// results; nothing here fails the conversation.
    pub async fn execute(&self, invocation: &ToolInvocation, timeout: Duration) -> ToolResult {
        let started = Instant::now();
        let call = &invocation.call;
        let output = match self.validate(&call.name, &call.arguments) {
            Err(message) => ToolOutput::error(message),
            Ok(()) => match self.tools.get(&call.name) {
                None => ToolOutput::error(format!("unknown tool '{}'", call.name)),
                Some(tool) => {
                    let fut = tool.collaborator.invoke(&call.name, call.arguments.clone());
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(output) => output,
                        Err(_) => ToolOutput::error(format!(
                            "tool '{}' timed out after {}s",
                            call.name,
                            timeout.as_secs_f64()
                        )),
                    }
                }
            },
        };
        let took_ms = started.elapsed().as_millis() as u64;
        if output.is_error {
            info!(tool = %call.name, call_id = %call.id, took_ms, "tool returned an error result");
        }
        ToolResult::from_output(invocation, output, took_ms)
    }

    /// Split invocations into waves that may run concurrently. An invocation of a tool
    /// declaring `depends_on_prior` waits for everything before it and runs alone.
    pub fn plan_waves(&self, invocations: &[ToolInvocation]) -> Vec<Vec<usize>> {
        let mut waves: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        for (i, inv) in invocations.iter().enumerate() {
            let dependent = self
                .spec(&inv.call.name)
                .map_or(false, |s| s.depends_on_prior);
            if dependent {
                if !current.is_empty() {
                    waves.push(std::mem::take(&mut current));
                }
                waves.push(vec![i]);
            } else {
                current.push(i);
            }
        }
        if !current.is_empty() {
            waves.push(current);
        }
        waves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;
    use serde_json::json;

    struct Echo {
        spec: ToolSpec,
        delay: Duration,
    }

    #[async_trait]
    impl ToolCollaborator for Echo {
        fn spec(&self) -> ToolSpec {
            self.spec.clone()
        }

        async fn invoke(&self, _name: &str, arguments: Value) -> ToolOutput {
            tokio::time::sleep(self.delay).await;
            ToolOutput::json(arguments)
        }
    }

    fn echo(name: &str, dependent: bool, delay: Duration) -> Arc<dyn ToolCollaborator> {
        let mut spec = ToolSpec::new(
            name,
            "echo",
            json!({"type": "object", "properties": {"q": {"type": "string"}}, "required": ["q"]}),
        );
        spec.depends_on_prior = dependent;
        Arc::new(Echo { spec, delay })
    }

    fn invocation(name: &str, position: usize, arguments: Value) -> ToolInvocation {
        ToolInvocation {
            call: ToolCall::new(format!("c{}", position), name, arguments),
            requested_at_iteration: 0,
            position,
        }
    }

    #[tokio::test]
    async fn test_schema_violation_is_error_result() {
        let registry = ToolRegistry::new().with(echo("search", false, Duration::ZERO)).unwrap();
        let result = registry
            .execute(&invocation("search", 0, json!({"q": 5})), Duration::from_secs(1))
            .await;
        assert!(result.is_error);
        assert!(result.content_text().contains("invalid arguments"));

        let ok = registry
            .execute(&invocation("search", 0, json!({"q": "rust"})), Duration::from_secs(1))
            .await;
        assert!(!ok.is_error);
        assert_eq!(ok.content, json!({"q": "rust"}));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_timeout() {
        let registry = ToolRegistry::new()
            .with(echo("slow", false, Duration::from_millis(200)))
            .unwrap();
        let unknown = registry
            .execute(&invocation("missing", 0, json!({})), Duration::from_secs(1))
            .await;
        assert!(unknown.is_error);

        let timed_out = registry
            .execute(&invocation("slow", 1, json!({"q": "x"})), Duration::from_millis(20))
            .await;
        assert!(timed_out.is_error);
        assert!(timed_out.content_text().contains("timed out"));
    }

    #[test]
    fn test_duplicate_and_invalid_schema_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("a", false, Duration::ZERO)).unwrap();
        assert!(registry.register(echo("a", false, Duration::ZERO)).is_err());

        let bad: Arc<dyn ToolCollaborator> = Arc::new(Echo {
            spec: ToolSpec::new("bad", "bad", json!({"type": 12})),
            delay: Duration::ZERO,
        });
        assert!(registry.register(bad).is_err());
    }

    #[test]
    fn test_plan_waves() {
        let registry = ToolRegistry::new()
            .with(echo("search", false, Duration::ZERO))
            .unwrap()
            .with(echo("summarize", true, Duration::ZERO))
            .unwrap();
        let invs = vec![
            invocation("search", 0, json!({})),
            invocation("search", 1, json!({})),
            invocation("summarize", 2, json!({})),
            invocation("search", 3, json!({})),
        ];
        assert_eq!(registry.plan_waves(&invs), vec![vec![0, 1], vec![2], vec![3]]);
        assert_eq!(registry.specs().len(), 2);
    }
}

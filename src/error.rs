use crate::error_code::FailureKind;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "providers[2].endpoint", "request.tools")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_loader", "capability_check")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A failed outbound model call, already classified.
///
/// This is the only error shape the orchestrator ever sees from the dispatcher:
/// retries have either succeeded or been exhausted by the time one of these surfaces.
#[derive(Debug, Clone, Error)]
#[error("{kind} from {provider_id}/{model_id}{}: {message}", format_status(*.status))]
pub struct DispatchError {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
    pub provider_id: String,
    pub model_id: String,
    /// Provider-suggested wait before retrying (from `retry-after`).
    pub retry_after: Option<Duration>,
    /// Number of attempts made before this error surfaced.
    pub attempts: u32,
}

fn format_status(status: Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {})", s),
        None => String::new(),
    }
}

impl DispatchError {
    pub fn new(
        kind: FailureKind,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            retry_after: None,
            attempts: 1,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, after: Option<Duration>) -> Self {
        self.retry_after = after;
        self
    }

    /// Retries are exhausted: whatever the last recoverable kind was, the caller now sees
    /// a permanent failure.
    pub fn exhausted(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        if self.kind.is_recoverable() {
            self.message = format!(
                "gave up after {} attempt(s), last failure {}: {}",
                attempts, self.kind, self.message
            );
            self.kind = FailureKind::Permanent;
        }
        self
    }

    /// Build from a library error raised before or around the network call.
    pub fn from_error(err: Error, provider_id: &str, model_id: &str) -> Self {
        let kind = match &err {
            Error::Configuration { .. } => FailureKind::Configuration,
            Error::Capability { .. } => FailureKind::Capability,
            Error::Transport(_) => FailureKind::Transient,
            Error::Dispatch(d) => return d.clone(),
            _ => FailureKind::Permanent,
        };
        DispatchError::new(kind, provider_id, model_id, err.to_string())
    }
}

/// Unified error type for the gateway.
/// This aggregates all low-level errors into actionable, high-level categories.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Capability error: {message}{}", format_context(.context))]
    Capability {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::configuration_with_context(msg, ErrorContext::new())
    }

    /// Create a new capability error with structured context
    pub fn capability_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Capability {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Capability { context, .. }
            | Error::Validation { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable, caller-facing name of the error kind (used in `error` stream events).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Configuration { .. } => "configuration",
            Error::Capability { .. } => "capability",
            Error::Validation { .. } => "validation",
            Error::Dispatch(d) => d.kind.as_str(),
            Error::Transport(_) => "transient",
            Error::Io(_) | Error::Serialization(_) | Error::Yaml(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_formatting() {
        let err = Error::configuration_with_context(
            "no provider can serve model",
            ErrorContext::new()
                .with_field_path("roles.planning[0]")
                .with_source("provider_registry"),
        );
        let text = err.to_string();
        assert!(text.contains("field: roles.planning[0]"));
        assert!(text.contains("source: provider_registry"));
        assert_eq!(err.kind_name(), "configuration");
    }

    #[test]
    fn test_exhausted_escalates_recoverable_kinds() {
        let err = DispatchError::new(FailureKind::RateLimited, "groq", "llama", "slow down")
            .with_status(429)
            .exhausted(3);
        assert_eq!(err.kind, FailureKind::Permanent);
        assert_eq!(err.attempts, 3);
        assert!(err.message.contains("rate_limited"));

        let refusal = DispatchError::new(FailureKind::ContentPolicy, "openai", "gpt", "refused")
            .exhausted(1);
        assert_eq!(refusal.kind, FailureKind::ContentPolicy);
    }

    #[test]
    fn test_dispatch_error_display_includes_status() {
        let err = DispatchError::new(FailureKind::Transient, "anthropic", "claude", "overloaded")
            .with_status(529);
        assert_eq!(
            err.to_string(),
            "transient from anthropic/claude (HTTP 529): overloaded"
        );
    }
}

//! Failure classification for outbound model calls.
//!
//! Every failed call is reduced to one [`FailureKind`]. The kind alone decides the retry
//! policy; callers never inspect raw vendor bodies.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 429 or a vendor quota code. Recovered by rotating to another model of the same role.
    RateLimited,
    /// Network error, timeout, 5xx. Recovered by retrying the same provider once.
    Transient,
    /// Non-429 4xx, bad credential, malformed request. Never retried.
    Permanent,
    /// The provider refused on policy grounds. Never retried.
    ContentPolicy,
    /// No usable provider for the requested model.
    Configuration,
    /// The request needs something the target profile cannot do.
    Capability,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::ContentPolicy => "content_policy",
            FailureKind::Configuration => "configuration",
            FailureKind::Capability => "capability",
        }
    }

    /// Kinds the dispatcher absorbs with retries.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FailureKind::RateLimited | FailureKind::Transient)
    }

    /// Classify from HTTP status only.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 => FailureKind::RateLimited,
            408 | 409 | 425 => FailureKind::Transient,
            500..=599 => FailureKind::Transient,
            400..=499 => FailureKind::Permanent,
            _ => FailureKind::Permanent,
        }
    }

    /// Classify from a vendor error code (`error.code`, `error.type` or `error.status`).
    pub fn from_provider_code(code: &str) -> Option<Self> {
        let kind = match code {
            "rate_limit_exceeded"
            | "rate_limit_error"
            | "RESOURCE_EXHAUSTED"
            | "too_many_requests"
            | "insufficient_quota"
            | "tokens_exceeded" => FailureKind::RateLimited,
            "content_policy_violation"
            | "content_filter"
            | "moderation_blocked"
            | "SAFETY"
            | "PROHIBITED_CONTENT" => FailureKind::ContentPolicy,
            "overloaded_error" | "server_error" | "api_error" | "service_unavailable"
            | "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" | "timeout" => {
                FailureKind::Transient
            }
            "invalid_api_key"
            | "authentication_error"
            | "permission_error"
            | "invalid_request_error"
            | "not_found_error"
            | "model_not_found"
            | "context_length_exceeded"
            | "UNAUTHENTICATED"
            | "PERMISSION_DENIED"
            | "INVALID_ARGUMENT"
            | "NOT_FOUND" => FailureKind::Permanent,
            _ => return None,
        };
        Some(kind)
    }

    /// Full classification: vendor code first, then body markers for refusals that
    /// arrive as plain 400s, then HTTP status.
    pub fn classify(status: u16, provider_code: Option<&str>, body: &str) -> Self {
        if let Some(kind) = provider_code.and_then(Self::from_provider_code) {
            // A vendor that says "invalid request" on a 429 is still rate limiting.
            if status == 429 && kind == FailureKind::Permanent {
                return FailureKind::RateLimited;
            }
            return kind;
        }
        if status == 400 && looks_like_refusal(body) {
            return FailureKind::ContentPolicy;
        }
        Self::from_http_status(status)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn looks_like_refusal(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["content policy", "content_policy", "content management policy", "safety system", "flagged"]
        .iter()
        .any(|marker| lower.contains(marker))
}

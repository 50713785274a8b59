//! 调度模块：单次出站调用、失败分类与按角色的重试策略。
//!
//! # Dispatcher
//!
//! [`Dispatcher::call`] performs exactly one outbound call: resolve the provider entry
//! through the request scope, translate with the family adapter, send with a hard
//! timeout, record usage in the [`RateBudget`] whatever the outcome, classify failures,
//! and repair the text of successful responses.
//!
//! [`Dispatcher::call_for_role`] wraps that in the retry policy: rate limits rotate to
//! another model of the role's pool with exponential backoff, transient failures retry in
//! place once, everything else surfaces immediately. Callers only ever see a final
//! [`CanonicalResponse`] or a terminal [`DispatchError`].

mod policy;
mod stream;

pub use policy::RetryPolicy;

use crate::budget::RateBudget;
use crate::catalog::{ModelFormatProfile, ProviderCatalog};
use crate::drivers::{adapter_for, WireResponse};
use crate::error::DispatchError;
use crate::error_code::FailureKind;
use crate::registry::{ProviderEntry, RequestScope};
use crate::repair::repair;
use crate::routing::{Candidate, ModelSelector};
use crate::transport::Transport;
use crate::types::{CanonicalRequest, CanonicalResponse, FinishReason, ModelRole, Usage};
use policy::Decision;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// A failed attempt, and whether any text already reached the caller.
struct AttemptFailure {
    error: DispatchError,
    forwarded: bool,
}

impl From<DispatchError> for AttemptFailure {
    fn from(error: DispatchError) -> Self {
        Self {
            error,
            forwarded: false,
        }
    }
}

pub struct Dispatcher {
    catalog: Arc<ProviderCatalog>,
    budget: Arc<RateBudget>,
    selector: Arc<ModelSelector>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        selector: Arc<ModelSelector>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            catalog,
            budget: Arc::clone(selector.budget()),
            selector,
            transport,
            policy: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &Arc<ProviderCatalog> {
        &self.catalog
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    pub fn selector(&self) -> &Arc<ModelSelector> {
        &self.selector
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Effective TPM ceiling for `(entry, model)`: the catalog's per-model value when set,
    /// otherwise the provider entry's.
    pub fn declared_tpm(&self, entry: &ProviderEntry, model: &str) -> u64 {
        self.catalog
            .profile_for(entry.family, model)
            .declared_tpm
            .unwrap_or(entry.declared_tpm)
    }

    /// Estimated cost of a response, when the model's profile carries a price.
    pub fn estimate_cost(&self, scope: &RequestScope, response: &CanonicalResponse) -> Option<f64> {
        let entry = scope.get(&response.provider_id)?;
        let pricing = self.catalog.profile_for(entry.family, &response.model_id).pricing?;
        Some(pricing.calculate_cost(&response.usage).total_cost)
    }

    /// One outbound call, no retries.
    pub async fn call(
        &self,
        scope: &RequestScope,
        provider_id: &str,
        model_id: &str,
        request: &CanonicalRequest,
        timeout: Duration,
    ) -> DispatchResult<CanonicalResponse> {
        self.attempt(scope, provider_id, model_id, request, timeout, None)
            .await
            .map_err(|f| f.error)
    }

    /// Like [`Self::call`], forwarding text chunks to `sink` as they stream in.
    pub async fn call_streaming(
        &self,
        scope: &RequestScope,
        provider_id: &str,
        model_id: &str,
        request: &CanonicalRequest,
        timeout: Duration,
        sink: &mpsc::Sender<String>,
    ) -> DispatchResult<CanonicalResponse> {
        self.attempt(scope, provider_id, model_id, request, timeout, Some(sink))
            .await
            .map_err(|f| f.error)
    }

    /// Pick a candidate for `role` and call it, applying the retry policy. With a `sink`
    /// the call streams; once text has been forwarded the call is never retried.
    pub async fn call_for_role(
        &self,
        scope: &RequestScope,
        role: ModelRole,
        pool: &[Candidate],
        request: &CanonicalRequest,
        sink: Option<&mpsc::Sender<String>>,
    ) -> DispatchResult<CanonicalResponse> {
        let mut candidate = self.selector.pick(role, pool).map_err(|e| {
            DispatchError::new(FailureKind::Configuration, "-", "-", e.to_string())
        })?;
        let mut excluded: Vec<String> = Vec::new();
        let mut rate_limited = 0u32;
        let mut transient = 0u32;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let failure = match self
                .attempt(
                    scope,
                    &candidate.provider_id,
                    &candidate.model_id,
                    request,
                    self.call_timeout,
                    sink,
                )
                .await
            {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            let err = failure.error;
            if failure.forwarded {
                warn!(
                    provider = %err.provider_id,
                    model = %err.model_id,
                    failure_kind = %err.kind,
                    "call failed after streaming began, not retrying"
                );
                return Err(err.exhausted(attempts));
            }

            match self.policy.decide(&err, rate_limited, transient) {
                Decision::Rotate { delay } => {
                    rate_limited += 1;
                    if !excluded.contains(&candidate.model_id) {
                        excluded.push(candidate.model_id.clone());
                    }
                    match self.selector.pick_excluding(role, pool, &excluded) {
                        Ok(next) => candidate = next,
                        // A single-model pool retries the same model after the backoff.
                        Err(_) if single_model(pool) => {}
                        Err(_) => {
                            warn!(
                                role = %role,
                                excluded = excluded.len(),
                                "every model of the pool is rate limited"
                            );
                            return Err(err.exhausted(attempts));
                        }
                    }
                    tokio::time::sleep(delay).await;
                    info!(
                        role = %role,
                        provider = %candidate.provider_id,
                        model = %candidate.model_id,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, rotating"
                    );
                }
                Decision::Retry { delay } => {
                    transient += 1;
                    tokio::time::sleep(delay).await;
                    info!(
                        role = %role,
                        provider = %candidate.provider_id,
                        model = %candidate.model_id,
                        "transient failure, retrying"
                    );
                }
                Decision::Fail => return Err(err.exhausted(attempts)),
            }
        }
    }

    async fn attempt(
        &self,
        scope: &RequestScope,
        provider_id: &str,
        model_id: &str,
        request: &CanonicalRequest,
        timeout: Duration,
        sink: Option<&mpsc::Sender<String>>,
    ) -> std::result::Result<CanonicalResponse, AttemptFailure> {
        let fail = |kind: FailureKind, message: String| DispatchError::new(kind, provider_id, model_id, message);

        let entry = scope.get(provider_id).ok_or_else(|| {
            fail(FailureKind::Configuration, format!("unknown provider '{}'", provider_id))
        })?;
        if !entry.is_usable() {
            return Err(fail(
                FailureKind::Configuration,
                format!("provider '{}' has no credential", provider_id),
            )
            .into());
        }
        if !entry.allows(model_id) {
            return Err(fail(
                FailureKind::Configuration,
                format!("provider '{}' does not serve model '{}'", provider_id, model_id),
            )
            .into());
        }

        let profile = self.catalog.profile_for(entry.family, model_id);
        let adapter = adapter_for(entry.family);
        let streaming = sink.is_some();
        let payload = adapter
            .to_wire(&profile, request, model_id, streaming)
            .map_err(|e| DispatchError::from_error(e, provider_id, model_id))?;

        let started = std::time::Instant::now();
        let deadline = Instant::now() + timeout;
        let response = match tokio::time::timeout_at(deadline, self.transport.send(&entry, &payload)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let err = DispatchError::from_error(e, provider_id, model_id);
                log_failure(&err, started);
                return Err(err.into());
            }
            Err(_) => {
                let err = fail(FailureKind::Transient, format!("timed out after {:?}", timeout));
                log_failure(&err, started);
                return Err(err.into());
            }
        };

        let status = response.status;
        if !response.is_success() || !streaming {
            let retry_after = response.retry_after();
            let bytes = match tokio::time::timeout_at(deadline, response.collect()).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    let err = DispatchError::from_error(e, provider_id, model_id).with_status(status);
                    log_failure(&err, started);
                    return Err(err.into());
                }
                Err(_) => {
                    let err = fail(FailureKind::Transient, format!("timed out after {:?}", timeout))
                        .with_status(status);
                    log_failure(&err, started);
                    return Err(err.into());
                }
            };
            let wire = WireResponse::from_bytes(status, &bytes);
            let mut canonical = adapter.from_wire(&wire);
            let failed = !(200..300).contains(&status)
                || canonical.finish_reason == FinishReason::Other("error".into());
            if failed {
                self.record(provider_id, model_id, canonical.usage, None);
                let body_text = String::from_utf8_lossy(&bytes);
                let code = adapter.error_code(&wire.body);
                let kind = FailureKind::classify(status, code.as_deref(), &body_text);
                let err = fail(kind, adapter.error_message(&wire.body))
                    .with_status(status)
                    .with_retry_after(retry_after);
                log_failure(&err, started);
                return Err(err.into());
            }
            self.record(provider_id, model_id, canonical.usage, Some(request));
            canonical.provider_id = provider_id.to_string();
            canonical.model_id = model_id.to_string();
            return self.finish(canonical, &profile, sink, false).await;
        }

        let hold_text = profile.needs_repair_buffering();
        let acc = stream::accumulate(adapter, response.body, deadline, sink, hold_text).await;
        if let Some(failure) = acc.failure {
            self.record(provider_id, model_id, acc.usage, None);
            let err = fail(failure.kind, failure.message).with_status(status);
            log_failure(&err, started);
            return Err(AttemptFailure {
                error: err,
                forwarded: acc.forwarded,
            });
        }
        self.record(provider_id, model_id, acc.usage, Some(request));

        let finish_reason = acc.finish.unwrap_or(if acc.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
        let canonical = CanonicalResponse {
            text: Some(acc.text).filter(|t| !t.is_empty()),
            tool_calls: acc.tool_calls,
            finish_reason,
            usage: acc.usage,
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        };
        self.finish(canonical, &profile, sink, hold_text).await
    }

    /// Repair the text; refusals with nothing to show become `ContentPolicy` failures.
    /// Held text is released to the sink once, repaired.
    async fn finish(
        &self,
        mut response: CanonicalResponse,
        profile: &ModelFormatProfile,
        sink: Option<&mpsc::Sender<String>>,
        release_held: bool,
    ) -> std::result::Result<CanonicalResponse, AttemptFailure> {
        response.text = response
            .text
            .map(|t| repair(&t, &profile.known_output_defects))
            .filter(|t| !t.is_empty());

        if response.finish_reason == FinishReason::ContentFilter
            && response.text.is_none()
            && response.tool_calls.is_empty()
        {
            return Err(DispatchError::new(
                FailureKind::ContentPolicy,
                &response.provider_id,
                &response.model_id,
                "the provider declined to answer",
            )
            .into());
        }

        if release_held {
            if let (Some(sink), Some(text)) = (sink, response.text.as_ref()) {
                let _ = sink.send(text.clone()).await;
            }
        }
        Ok(response)
    }

    /// Charge the trailing window. Successful calls with no reported usage are charged an
    /// estimate so silent providers still count against their ceiling.
    fn record(&self, provider_id: &str, model_id: &str, usage: Usage, estimate_from: Option<&CanonicalRequest>) {
        let tokens = match (usage.is_empty(), estimate_from) {
            (true, Some(request)) => request.estimated_input_tokens(),
            _ => usage.total(),
        };
        self.budget.record(provider_id, model_id, tokens);
    }
}

fn single_model(pool: &[Candidate]) -> bool {
    pool.windows(2).all(|w| w[0].model_id == w[1].model_id)
}

fn log_failure(err: &DispatchError, started: std::time::Instant) {
    info!(
        provider = %err.provider_id,
        model = %err.model_id,
        http_status = err.status.unwrap_or(0),
        failure_kind = %err.kind,
        duration_ms = started.elapsed().as_millis() as u64,
        "model call failed"
    );
}

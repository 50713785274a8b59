//! 编排模块：多轮工具调用循环、并发扇出、流式事件与协作式取消。
//!
//! # Tool Orchestrator
//!
//! Runs one conversation as a state machine:
//!
//! ```text
//! Planning → AwaitingModel → (ToolsRequested | AnswerReady) → ExecutingTools → AwaitingModel → … → Terminal
//! ```
//!
//! - Each model call of the loop is one iteration. At most `max_iterations` model calls are
//!   issued, summary calls included. When the cap is reached and the model still asks for
//!   tools, the answer is synthesized locally from the text and results gathered so far.
//!   Summaries are only issued while a call remains for the model to read them.
//! - Requested tools run in waves: independent invocations concurrently, invocations of a
//!   tool that declares `depends_on_prior` alone and after everything before them. Results
//!   join the history in request order whatever order they finish in.
//! - Tokens, tool start/end and usage are pushed to the caller as they happen over a
//!   bounded channel; exactly one `done` or `error` closes every conversation.
//! - Cancellation is cooperative: it is observed after a model call returns and before each
//!   tool wave starts, and no further model call (summaries included) is issued once it is
//!   seen.

mod state;
mod summarize;
mod synthesis;
mod tools;

pub use state::{CancelHandle, OrchestrationState, Phase};
pub use summarize::{summarize_results, SummaryRound};
pub use synthesis::synthesize;
pub use tools::{ToolCollaborator, ToolRegistry};

use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::error_code::FailureKind;
use crate::registry::RequestScope;
use crate::routing::{Candidate, RolePools};
use crate::types::{
    CanonicalRequest, CanonicalResponse, FinishReason, GatewayEvent, Message, ModelRole,
    ToolCall, ToolChoice, ToolInvocation, ToolResult,
};
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ITERATIONS: u32 = 8;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hard cap on model calls per conversation.
    pub max_iterations: u32,
    /// Cumulative token ceiling across all model calls of a conversation.
    pub max_total_tokens: Option<u64>,
    /// Wall-clock ceiling of a conversation.
    pub conversation_timeout: Option<Duration>,
    pub tool_timeout: Duration,
    /// Fan-out limit within a wave. `None` runs every invocation of the wave at once.
    pub max_parallel_tools: Option<usize>,
    pub channel_capacity: usize,
    /// Role of every model call after the first.
    pub follow_up_role: ModelRole,
    /// Forward text as it streams in rather than once per model call.
    pub stream: bool,
    /// Summarize successful tool results longer than this many characters.
    pub summarize_over_chars: Option<usize>,
    pub summary_max_tokens: u32,
    /// Length of the result preview carried by `tool_end` events.
    pub tool_summary_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_total_tokens: None,
            conversation_timeout: Some(Duration::from_secs(600)),
            tool_timeout: Duration::from_secs(60),
            max_parallel_tools: None,
            channel_capacity: 64,
            follow_up_role: ModelRole::Synthesis,
            stream: true,
            summarize_over_chars: None,
            summary_max_tokens: 512,
            tool_summary_chars: 200,
        }
    }
}

/// Final record of a conversation, returned by [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct Outcome {
    pub conversation_id: Uuid,
    /// The `done` or `error` event that closed the stream.
    pub terminal: GatewayEvent,
    pub iterations: u32,
    /// Model calls issued, summary calls included.
    pub model_calls: u32,
    pub cumulative_tokens: u64,
    /// Request history as it stood at the end, tool results included.
    pub history: CanonicalRequest,
}

impl Outcome {
    pub fn finish_reason(&self) -> Option<&FinishReason> {
        match &self.terminal {
            GatewayEvent::Done { finish_reason } => Some(finish_reason),
            _ => None,
        }
    }
}

/// Event sender shared by the loop and concurrently running tools. A closed channel means
/// the caller went away and is treated as cancellation.
#[derive(Clone)]
struct Emitter {
    tx: mpsc::Sender<GatewayEvent>,
    cancel: CancelHandle,
}

impl Emitter {
    async fn emit(&self, event: GatewayEvent) {
        if self.tx.send(event).await.is_err() && !self.cancel.is_cancelled() {
            debug!("event receiver dropped, cancelling conversation");
            self.cancel.cancel();
        }
    }

    fn gone(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }
}

/// A running conversation: the caller's end of the event channel.
///
/// Dropping it disconnects the caller; the conversation notices at its next checkpoint.
#[derive(Debug)]
pub struct Conversation {
    id: Uuid,
    events: mpsc::Receiver<GatewayEvent>,
    cancel: CancelHandle,
    task: JoinHandle<Outcome>,
}

impl Conversation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain every remaining event, then wait for the conversation task.
    pub async fn finish(mut self) -> crate::Result<(Vec<GatewayEvent>, Outcome)> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.task.await.map_err(|e| {
            crate::Error::configuration(format!("conversation task failed: {}", e))
        })?;
        Ok((events, outcome))
    }
}

impl Stream for Conversation {
    type Item = GatewayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    tools: Arc<ToolRegistry>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(dispatcher: Arc<Dispatcher>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            dispatcher,
            tools,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Start a conversation on its own task and hand back the caller's end of it.
    pub fn spawn(self: &Arc<Self>, scope: RequestScope, pools: RolePools, request: CanonicalRequest) -> Conversation {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancelHandle::new();
        let state = OrchestrationState::new(cancel.clone());
        let id = state.conversation_id;
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run(&scope, &pools, request, state, tx).await });
        Conversation {
            id,
            events: rx,
            cancel,
            task,
        }
    }

    /// Run a conversation to its terminal event on the current task.
    pub async fn run(
        &self,
        scope: &RequestScope,
        pools: &RolePools,
        request: CanonicalRequest,
        mut state: OrchestrationState,
        events: mpsc::Sender<GatewayEvent>,
    ) -> Outcome {
        let emitter = Emitter {
            tx: events,
            cancel: state.cancel_handle().clone(),
        };
        let mut history = request;
        let terminal = self.drive(scope, pools, &mut history, &mut state, &emitter).await;
        state.transition(Phase::Terminal);

        match &terminal {
            GatewayEvent::Error { kind, message } => warn!(
                conversation_id = %state.conversation_id,
                iteration = state.iteration,
                kind = %kind,
                message = %message,
                "conversation failed"
            ),
            _ => info!(
                conversation_id = %state.conversation_id,
                iteration = state.iteration,
                tokens = state.cumulative_tokens,
                duration_ms = state.elapsed().as_millis() as u64,
                "conversation finished"
            ),
        }
        emitter.emit(terminal.clone()).await;

        Outcome {
            conversation_id: state.conversation_id,
            terminal,
            iterations: state.iteration,
            model_calls: state.model_calls,
            cumulative_tokens: state.cumulative_tokens,
            history,
        }
    }

    async fn drive(
        &self,
        scope: &RequestScope,
        pools: &RolePools,
        history: &mut CanonicalRequest,
        state: &mut OrchestrationState,
        emitter: &Emitter,
    ) -> GatewayEvent {
        let deadline = self.config.conversation_timeout.map(|t| Instant::now() + t);
        let max_iterations = self.config.max_iterations.max(1);
        if history.tools.is_empty() && !self.tools.is_empty() {
            history.tools = self.tools.specs();
        }
        let mut gathered: Vec<ToolResult> = Vec::new();
        let mut has_text = false;
        state.transition(Phase::AwaitingModel);

        loop {
            if emitter.gone() {
                return cancelled(state);
            }
            if let Some(reason) = self.ceiling(state, deadline) {
                return self.force_finish(reason, has_text, &gathered, &[], emitter).await;
            }

            let role = if state.iteration == 0 {
                history.desired_model_role
            } else {
                self.config.follow_up_role
            };
            let Some(pool) = pools.for_role(role) else {
                return GatewayEvent::error(
                    FailureKind::Configuration.as_str(),
                    format!("no model pool for role '{}'", role),
                );
            };
            let step = step_request(history, role, state.iteration);
            state.iteration += 1;
            state.model_calls += 1;
            debug!(
                conversation_id = %state.conversation_id,
                iteration = state.iteration,
                role = %role,
                "calling model"
            );

            let response = match self.dispatch(scope, role, pool, &step, deadline, emitter).await {
                None => {
                    return self
                        .force_finish(FinishReason::Deadline, has_text, &gathered, &[], emitter)
                        .await
                }
                Some(Err(err)) => return self.on_dispatch_error(err, has_text, emitter).await,
                Some(Ok(response)) => response,
            };

            if let Some(text) = &response.text {
                has_text = true;
                if !self.config.stream {
                    emitter.emit(GatewayEvent::token(text.clone())).await;
                }
            }
            self.account(scope, state, &response, emitter).await;

            if emitter.gone() {
                return cancelled(state);
            }

            if response.tool_calls.is_empty() {
                state.transition(Phase::AnswerReady);
                return GatewayEvent::done(response.finish_reason);
            }

            state.transition(Phase::ToolsRequested);
            let limit = if state.model_calls >= max_iterations {
                Some(FinishReason::IterationLimit)
            } else {
                self.ceiling(state, deadline)
            };
            if let Some(reason) = limit {
                return self
                    .force_finish(reason, has_text, &gathered, &response.tool_calls, emitter)
                    .await;
            }

            state.transition(Phase::ExecutingTools);
            let invocations: Vec<ToolInvocation> = response
                .tool_calls
                .iter()
                .enumerate()
                .map(|(position, call)| ToolInvocation {
                    call: call.clone(),
                    requested_at_iteration: state.iteration,
                    position,
                })
                .collect();
            let mut results = self.execute_tools(&invocations, emitter).await;
            if emitter.gone() {
                return cancelled(state);
            }

            // One call stays reserved for the model to read the results.
            let spare_calls = max_iterations.saturating_sub(state.model_calls + 1) as usize;
            if let (Some(threshold), Some(pool)) = (
                self.config.summarize_over_chars,
                pools.for_role(ModelRole::Summarization),
            ) {
                let round = summarize_results(
                    &self.dispatcher,
                    scope,
                    pool,
                    &mut results,
                    threshold,
                    self.config.summary_max_tokens,
                    spare_calls,
                )
                .await;
                state.model_calls += round.issued;
                for summary in &round.responses {
                    self.account(scope, state, summary, emitter).await;
                }
            }

            let appended = std::iter::once(Message::assistant_tool_calls(
                response.text.clone(),
                response.tool_calls.clone(),
            ))
            .chain(results.iter().map(Message::from_tool_result));
            *history = history.with_appended(appended);
            gathered.extend(results);

            if emitter.gone() {
                return cancelled(state);
            }
            state.transition(Phase::AwaitingModel);
        }
    }

    /// Token budget or deadline reached.
    fn ceiling(&self, state: &OrchestrationState, deadline: Option<Instant>) -> Option<FinishReason> {
        if self
            .config
            .max_total_tokens
            .map_or(false, |max| state.cumulative_tokens >= max)
        {
            return Some(FinishReason::TokenBudget);
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            return Some(FinishReason::Deadline);
        }
        None
    }

    /// One role-level model call, forwarding streamed text as tokens. `None` when the
    /// conversation deadline passed first.
    async fn dispatch(
        &self,
        scope: &RequestScope,
        role: ModelRole,
        pool: &[Candidate],
        request: &CanonicalRequest,
        deadline: Option<Instant>,
        emitter: &Emitter,
    ) -> Option<Result<CanonicalResponse, DispatchError>> {
        let call = self.forward_call(scope, role, pool, request, emitter);
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call).await.ok(),
            None => Some(call.await),
        }
    }

    async fn forward_call(
        &self,
        scope: &RequestScope,
        role: ModelRole,
        pool: &[Candidate],
        request: &CanonicalRequest,
        emitter: &Emitter,
    ) -> Result<CanonicalResponse, DispatchError> {
        if !self.config.stream {
            return self
                .dispatcher
                .call_for_role(scope, role, pool, request, None)
                .await;
        }

        let (sink, mut chunks) = mpsc::channel::<String>(self.config.channel_capacity.max(1));
        let call = self
            .dispatcher
            .call_for_role(scope, role, pool, request, Some(&sink));
        tokio::pin!(call);
        let result = loop {
            tokio::select! {
                biased;
                Some(chunk) = chunks.recv() => emitter.emit(GatewayEvent::token(chunk)).await,
                result = &mut call => break result,
            }
        };
        while let Ok(chunk) = chunks.try_recv() {
            emitter.emit(GatewayEvent::token(chunk)).await;
        }
        result
    }

    async fn account(
        &self,
        scope: &RequestScope,
        state: &mut OrchestrationState,
        response: &CanonicalResponse,
        emitter: &Emitter,
    ) {
        state.cumulative_tokens += response.usage.total();
        emitter
            .emit(GatewayEvent::Usage {
                provider_id: response.provider_id.clone(),
                model_id: response.model_id.clone(),
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
                cost_estimate: self.dispatcher.estimate_cost(scope, response),
            })
            .await;
    }

    async fn on_dispatch_error(&self, err: DispatchError, has_text: bool, emitter: &Emitter) -> GatewayEvent {
        if err.kind == FailureKind::ContentPolicy {
            info!(
                provider = %err.provider_id,
                model = %err.model_id,
                "model refused, ending with a refusal note"
            );
            let separator = if has_text { "\n\n" } else { "" };
            emitter
                .emit(GatewayEvent::token(format!(
                    "{}The model declined to answer this request.",
                    separator
                )))
                .await;
            return GatewayEvent::done(FinishReason::ContentFilter);
        }
        GatewayEvent::error(err.kind.as_str(), err.to_string())
    }

    async fn force_finish(
        &self,
        reason: FinishReason,
        has_text: bool,
        gathered: &[ToolResult],
        pending: &[ToolCall],
        emitter: &Emitter,
    ) -> GatewayEvent {
        info!(
            reason = %reason,
            results = gathered.len(),
            pending = pending.len(),
            "ceiling reached, answering from gathered results"
        );
        let text = synthesize(&reason, has_text, gathered, pending, self.config.tool_summary_chars);
        emitter.emit(GatewayEvent::token(text)).await;
        GatewayEvent::done(reason)
    }

    /// Run every invocation wave by wave and return results in request order.
    async fn execute_tools(&self, invocations: &[ToolInvocation], emitter: &Emitter) -> Vec<ToolResult> {
        let mut finished: Vec<(usize, ToolResult)> = Vec::with_capacity(invocations.len());
        for wave in self.tools.plan_waves(invocations) {
            if emitter.gone() {
                debug!(skipped = wave.len(), "cancelled, not starting next tool wave");
                break;
            }
            let width = self.config.max_parallel_tools.unwrap_or(wave.len()).max(1);
            let runs: Vec<_> = wave
                .into_iter()
                .map(|i| self.run_tool(&invocations[i], emitter))
                .collect();
            let mut done: Vec<(usize, ToolResult)> = stream::iter(runs).buffer_unordered(width).collect().await;
            finished.append(&mut done);
        }
        finished.sort_by_key(|(position, _)| *position);
        finished.into_iter().map(|(_, result)| result).collect()
    }

    async fn run_tool(&self, invocation: &ToolInvocation, emitter: &Emitter) -> (usize, ToolResult) {
        let call = &invocation.call;
        emitter
            .emit(GatewayEvent::ToolStart {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .await;
        let result = self.tools.execute(invocation, self.config.tool_timeout).await;
        emitter
            .emit(GatewayEvent::ToolEnd {
                call_id: result.call_id.clone(),
                name: result.name.clone(),
                summary: result.summary(self.config.tool_summary_chars),
                is_error: result.is_error,
                took_ms: result.took_ms,
            })
            .await;
        (invocation.position, result)
    }
}

/// The request for one model call. A forced tool choice applies to the first call only, so
/// the model can answer once it has results.
fn step_request(history: &CanonicalRequest, role: ModelRole, iteration: u32) -> CanonicalRequest {
    let mut step = history.clone();
    step.desired_model_role = role;
    if iteration > 0 && matches!(step.tool_choice, ToolChoice::Required | ToolChoice::Tool(_)) {
        step.tool_choice = ToolChoice::Auto;
    }
    step
}

fn cancelled(state: &OrchestrationState) -> GatewayEvent {
    info!(
        conversation_id = %state.conversation_id,
        iteration = state.iteration,
        "conversation cancelled"
    );
    GatewayEvent::done(FinishReason::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_tool_choice_only_on_first_call() {
        let request = CanonicalRequest::from_prompt("find it").with_tool_choice(ToolChoice::Required);
        assert_eq!(
            step_request(&request, ModelRole::Planning, 0).tool_choice,
            ToolChoice::Required
        );
        let later = step_request(&request, ModelRole::Synthesis, 1);
        assert_eq!(later.tool_choice, ToolChoice::Auto);
        assert_eq!(later.desired_model_role, ModelRole::Synthesis);
        assert_eq!(request.tool_choice, ToolChoice::Required);
    }

    #[tokio::test]
    async fn test_emitter_marks_disconnect_as_cancel() {
        let (tx, rx) = mpsc::channel(1);
        let emitter = Emitter {
            tx,
            cancel: CancelHandle::new(),
        };
        assert!(!emitter.gone());
        drop(rx);
        emitter.emit(GatewayEvent::token("late")).await;
        assert!(emitter.gone());
        assert!(emitter.cancel.is_cancelled());
    }
}

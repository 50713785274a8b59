//! Per-conversation state machine.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    AwaitingModel,
    ToolsRequested,
    AnswerReady,
    ExecutingTools,
    Terminal,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (_, Terminal) => self != Terminal,
            (Planning, AwaitingModel) => true,
            (AwaitingModel, ToolsRequested | AnswerReady) => true,
            (ToolsRequested, ExecutingTools) => true,
            (ExecutingTools, AwaitingModel) => true,
            _ => false,
        }
    }
}

/// Cooperative cancellation flag shared between the caller and one conversation.
/// Checked only after a model call or a tool wave returns; in-flight work is never aborted.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct OrchestrationState {
    pub conversation_id: Uuid,
    /// Conversation iterations issued so far.
    pub iteration: u32,
    /// Every model call so far, summary calls included. Capped by `max_iterations`.
    pub model_calls: u32,
    pub cumulative_tokens: u64,
    cancel: CancelHandle,
    phase: Phase,
    started: Instant,
}

impl OrchestrationState {
    pub fn new(cancel: CancelHandle) -> Self {
        Self {
            conversation_id: Uuid::new_v4(),
            iteration: 0,
            model_calls: 0,
            cumulative_tokens: 0,
            cancel,
            phase: Phase::Planning,
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    pub fn transition(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(
            conversation_id = %self.conversation_id,
            iteration = self.iteration,
            from = ?self.phase,
            to = ?next,
            "phase transition"
        );
        self.phase = next;
    }
}

//! Optional condensing of oversized tool results on the summarization pool.
//!
//! Summaries for one iteration are issued concurrently; each goes through
//! [`Dispatcher::call_for_role`] so the selector spreads them across the pool. They are
//! auxiliary calls and do not count as conversation iterations, but the caller bounds how
//! many may be issued so the model-call cap holds.

use crate::dispatch::Dispatcher;
use crate::registry::RequestScope;
use crate::routing::Candidate;
use crate::types::{CanonicalRequest, CanonicalResponse, Message, ModelRole, ToolResult};
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

const SUMMARY_PROMPT: &str = "Condense the tool output below. Keep every fact, figure, name \
and URL that could answer the user's question. Reply with the condensed text only.";

fn summary_request(result: &ToolResult, max_tokens: u32) -> CanonicalRequest {
    CanonicalRequest::new(vec![Message::user(format!(
        "Tool: {}\n\n{}",
        result.name,
        result.content_text()
    ))])
    .with_system(SUMMARY_PROMPT)
    .with_role(ModelRole::Summarization)
    .with_max_tokens(max_tokens)
}

/// Summary calls issued for one batch of tool results.
#[derive(Debug, Default)]
pub struct SummaryRound {
    /// Calls issued, failed ones included.
    pub issued: u32,
    /// Responses of the calls that succeeded, for usage accounting.
    pub responses: Vec<CanonicalResponse>,
}

/// Replace the content of successful results longer than `threshold` characters with a
/// model-written summary. At most `max_calls` results are summarized, in request order;
/// the rest and any whose summary failed keep their original content.
pub async fn summarize_results(
    dispatcher: &Dispatcher,
    scope: &RequestScope,
    pool: &[Candidate],
    results: &mut [ToolResult],
    threshold: usize,
    max_tokens: u32,
    max_calls: usize,
) -> SummaryRound {
    let mut targets: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_error && r.content_text().chars().count() > threshold)
        .map(|(i, _)| i)
        .collect();
    if targets.len() > max_calls {
        debug!(
            oversized = targets.len(),
            max_calls,
            "model-call cap leaves no room for every summary"
        );
        targets.truncate(max_calls);
    }
    if targets.is_empty() {
        return SummaryRound::default();
    }

    let requests: Vec<CanonicalRequest> = targets
        .iter()
        .map(|&i| summary_request(&results[i], max_tokens))
        .collect();
    let calls = requests.iter().map(|req| {
        dispatcher.call_for_role(scope, ModelRole::Summarization, pool, req, None)
    });
    let outcomes = join_all(calls).await;

    let mut responses = Vec::new();
    for (&index, outcome) in targets.iter().zip(outcomes) {
        match outcome {
            Ok(response) => {
                if let Some(summary) = response.text.as_deref().filter(|t| !t.trim().is_empty()) {
                    results[index].content = Value::String(summary.trim().to_string());
                }
                responses.push(response);
            }
            Err(e) => warn!(
                tool = %results[index].name,
                error = %e,
                "summary failed, keeping full tool output"
            ),
        }
    }
    SummaryRound {
        issued: targets.len() as u32,
        responses,
    }
}

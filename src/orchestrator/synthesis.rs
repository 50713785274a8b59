//! Locally composed answers for conversations stopped by a ceiling.

use crate::types::{FinishReason, ToolCall, ToolResult};

fn limit_name(reason: &FinishReason) -> &'static str {
    match reason {
        FinishReason::IterationLimit => "iteration limit",
        FinishReason::TokenBudget => "token budget",
        FinishReason::Deadline => "time limit",
        _ => "conversation limit",
    }
}

/// Build the closing text from what the conversation already holds. No model call is made.
///
/// `has_text` tells whether the caller already received answer text; the synthesized part
/// then starts on a new paragraph.
pub fn synthesize(
    reason: &FinishReason,
    has_text: bool,
    results: &[ToolResult],
    pending: &[ToolCall],
    summary_chars: usize,
) -> String {
    let mut out = String::new();
    if has_text {
        out.push_str("\n\n");
    }
    out.push_str(&format!("Stopped at the {}.", limit_name(reason)));

    if !results.is_empty() {
        out.push_str(" Results gathered so far:\n");
        for result in results {
            let marker = if result.is_error { " (failed)" } else { "" };
            out.push_str(&format!(
                "\n- {}{}: {}",
                result.name,
                marker,
                result.summary(summary_chars)
            ));
        }
    } else if !has_text {
        out.push_str(" No answer could be produced in time.");
    }

    if !pending.is_empty() {
        let names: Vec<&str> = pending.iter().map(|c| c.name.as_str()).collect();
        out.push_str(&format!("\n\nNot run: {}.", names.join(", ")));
    }
    out
}

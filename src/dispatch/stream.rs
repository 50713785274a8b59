//! Streamed-body accumulation: frames → deltas → one canonical response.

use crate::drivers::{FormatAdapter, StreamDelta};
use crate::error_code::FailureKind;
use crate::transport::frames;
use crate::types::{FinishReason, ToolCall, Usage};
use crate::utils::ToolCallAssembler;
use crate::BoxStream;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StreamFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Default)]
pub(crate) struct Accumulated {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish: Option<FinishReason>,
    pub usage: Usage,
    /// At least one text chunk reached the sink; the call can no longer be retried.
    pub forwarded: bool,
    pub failure: Option<StreamFailure>,
}

/// Drain a streamed body until it ends, fails, or `deadline` passes. Text is forwarded to
/// `sink` as it arrives unless `hold_text` is set.
pub(crate) async fn accumulate(
    adapter: &dyn FormatAdapter,
    body: BoxStream<'static, Bytes>,
    deadline: Instant,
    sink: Option<&mpsc::Sender<String>>,
    hold_text: bool,
) -> Accumulated {
    let mut acc = Accumulated::default();
    let mut assembler = ToolCallAssembler::new();
    let mut frames = frames(body, adapter.framing());

    'frames: loop {
        let frame = match tokio::time::timeout_at(deadline, frames.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                acc.failure = Some(StreamFailure {
                    kind: FailureKind::Transient,
                    message: e.to_string(),
                });
                break;
            }
            Ok(None) => break,
            Err(_) => {
                acc.failure = Some(StreamFailure {
                    kind: FailureKind::Transient,
                    message: "stream timed out".into(),
                });
                break;
            }
        };

        let deltas = match adapter.parse_stream_event(&frame) {
            Ok(deltas) => deltas,
            Err(e) => {
                warn!(family = %adapter.family(), error = %e, "skipping unparseable stream frame");
                continue;
            }
        };
        for delta in deltas {
            match delta {
                StreamDelta::Text(text) => {
                    acc.text.push_str(&text);
                    if !hold_text {
                        if let Some(sink) = sink {
                            // A closed sink means the caller went away; keep draining for usage.
                            if sink.send(text).await.is_ok() {
                                acc.forwarded = true;
                            }
                        }
                    }
                }
                StreamDelta::ToolCallStart { index, id, name } => assembler.on_started(index, id, name),
                StreamDelta::ToolCallArgs { index, fragment } => assembler.on_partial(index, &fragment),
                StreamDelta::ToolCallComplete {
                    index,
                    id,
                    name,
                    arguments,
                } => assembler.on_complete(index, id, name, arguments),
                StreamDelta::Usage(usage) => acc.usage.absorb(usage),
                StreamDelta::Finish(reason) => acc.finish = Some(reason),
                StreamDelta::Error { code, message } => {
                    acc.failure = Some(StreamFailure {
                        kind: FailureKind::classify(200, code.as_deref(), &message),
                        message,
                    });
                    break 'frames;
                }
            }
        }
    }

    acc.tool_calls = assembler.finalize();
    acc
}

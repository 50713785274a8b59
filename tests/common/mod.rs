//! Shared fixtures: a scripted transport and a few collaborator tools.

#![allow(dead_code)]

use ai_gateway::catalog::ProviderFamily;
use ai_gateway::drivers::WirePayload;
use ai_gateway::registry::ProviderEntry;
use ai_gateway::transport::{Transport, TransportError, TransportResponse};
use ai_gateway::{ToolCollaborator, ToolOutput, ToolSpec};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Barrier;

/// One canned reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Json { status: u16, body: Value, headers: Vec<(String, String)> },
    Sse(Vec<Value>),
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Reply::Json { status: 200, body, headers: Vec::new() }
    }

    pub fn status(status: u16, body: Value) -> Self {
        Reply::Json { status, body, headers: Vec::new() }
    }

    pub fn with_header(self, name: &str, value: &str) -> Self {
        match self {
            Reply::Json { status, body, mut headers } => {
                headers.push((name.to_string(), value.to_string()));
                Reply::Json { status, body, headers }
            }
            other => other,
        }
    }

    fn into_response(self) -> TransportResponse {
        match self {
            Reply::Json { status, body, headers } => {
                let mut resp = TransportResponse::from_bytes(status, body.to_string());
                for (name, value) in headers {
                    resp = resp.with_header(&name, value);
                }
                resp
            }
            Reply::Sse(frames) => {
                let mut chunks: Vec<String> = frames.iter().map(|f| format!("data: {}\n\n", f)).collect();
                chunks.push("data: [DONE]\n\n".to_string());
                TransportResponse::from_chunks(200, chunks)
            }
        }
    }
}

/// What the transport was asked to send.
#[derive(Debug, Clone)]
pub struct Sent {
    pub provider_id: String,
    pub model: String,
    pub body: Value,
    pub at: Instant,
}

/// Transport that answers from per-model queues and records every request.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    sent: Mutex<Vec<Sent>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, model: &str, reply: Reply) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn models(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.model).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, entry: &ProviderEntry, payload: &WirePayload) -> ai_gateway::Result<TransportResponse> {
        let model = payload.body["model"].as_str().unwrap_or_default().to_string();
        self.sent.lock().unwrap().push(Sent {
            provider_id: entry.id.clone(),
            model: model.clone(),
            body: payload.body.clone(),
            at: Instant::now(),
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&model)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(reply) => Ok(reply.into_response()),
            None => Err(TransportError::Other(format!("no scripted reply for '{}'", model)).into()),
        }
    }
}

pub fn openai_entry(id: &str) -> ProviderEntry {
    ProviderEntry::with_default_endpoint(id, ProviderFamily::OpenAiCompatible)
        .unwrap()
        .with_credential("sk-test")
}

/// OpenAI chat completion with text.
pub fn text_reply(text: &str, input: u64, output: u64) -> Reply {
    Reply::ok(json!({
        "choices": [{"message": {"role": "assistant", "content": text}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": input, "completion_tokens": output}
    }))
}

/// OpenAI chat completion requesting tools: `(id, name, arguments)`.
pub fn tool_reply(calls: &[(&str, &str, Value)], input: u64, output: u64) -> Reply {
    let tool_calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, args)| {
            json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": args.to_string()}
            })
        })
        .collect();
    Reply::ok(json!({
        "choices": [{
            "message": {"role": "assistant", "content": null, "tool_calls": tool_calls},
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": input, "completion_tokens": output}
    }))
}

pub fn rate_limited() -> Reply {
    Reply::status(
        429,
        json!({"error": {"message": "Rate limit reached", "type": "rate_limit_exceeded"}}),
    )
    .with_header("retry-after", "0")
}

/// Tool that echoes its arguments after an optional delay, optionally meeting a barrier first.
pub struct EchoTool {
    pub name: String,
    pub delay: Duration,
    pub barrier: Option<Arc<Barrier>>,
    pub after_prior: bool,
    pub invocations: AtomicUsize,
}

impl EchoTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            barrier: None,
            after_prior: false,
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Declare that the tool reads results of earlier calls in the same batch.
    pub fn after_prior(mut self) -> Self {
        self.after_prior = true;
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolCollaborator for EchoTool {
    fn spec(&self) -> ToolSpec {
        let spec = ToolSpec::new(
            self.name.clone(),
            format!("Echo tool {}", self.name),
            json!({
                "type": "object",
                "properties": {"q": {"type": "string"}},
                "required": ["q"]
            }),
        );
        if self.after_prior {
            spec.depends_on_prior()
        } else {
            spec
        }
    }

    async fn invoke(&self, name: &str, arguments: Value) -> ToolOutput {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        ToolOutput::text(format!("{} saw {}", name, arguments["q"].as_str().unwrap_or_default()))
    }
}

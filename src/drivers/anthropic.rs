//! Anthropic Messages API 适配器 — 实现 Anthropic 特有的请求/响应格式转换
//!
//! Anthropic Messages API adapter. Key differences from OpenAI:
//! - System prompt is a top-level `system` field, not a message.
//! - Content is an array of typed blocks (`text`, `tool_use`, `tool_result`).
//! - Tool results travel in a `user` turn; consecutive same-role turns are merged.
//! - `max_tokens` is required.
//! - Extended thinking uses `thinking.budget_tokens` and forbids sampling knobs.
//! - Streaming uses typed SSE events (`content_block_delta`, `message_delta`, ...).

use serde_json::{json, Value};
use std::collections::HashMap;

use crate::catalog::{ModelFormatProfile, ProviderFamily};
use crate::types::{
    CanonicalRequest, CanonicalResponse, FinishReason, Message, MessageRole, ReasoningEffort,
    ResponseFormat, ToolCall, ToolChoice, ToolSpec, Usage,
};
use crate::Result;

use super::{
    check_capabilities, emits_reasoning, invalid_body, new_call_id, parse_arguments, read_number,
    shape_messages, str_at, u64_at, FormatAdapter, StreamDelta, WirePayload, WireResponse,
};

/// Anthropic requires max_tokens; this is the fallback.
const DEFAULT_MAX_TOKENS: u32 = 4096;
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicAdapter;

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn message_blocks(m: &Message) -> (&'static str, Vec<Value>) {
    match m.role {
        MessageRole::Tool => {
            let mut block = json!({
                "type": "tool_result",
                "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                "content": m.content,
            });
            if m.is_error {
                block["is_error"] = json!(true);
            }
            ("user", vec![block])
        }
        MessageRole::Assistant => {
            let mut blocks = Vec::with_capacity(m.tool_calls.len() + 1);
            if !m.content.is_empty() {
                blocks.push(json!({ "type": "text", "text": m.content }));
            }
            blocks.extend(m.tool_calls.iter().map(|c| {
                json!({ "type": "tool_use", "id": c.id, "name": c.name, "input": c.arguments })
            }));
            ("assistant", blocks)
        }
        _ => ("user", vec![json!({ "type": "text", "text": m.content })]),
    }
}

/// Build `messages`, merging consecutive turns that land on the same wire role.
fn messages_to_wire(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for m in messages {
        let (role, blocks) = message_blocks(m);
        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(content) = last["content"].as_array_mut() {
                    content.extend(blocks);
                }
            }
            _ => out.push(json!({ "role": role, "content": blocks })),
        }
    }
    out
}

fn tool_choice_to_wire(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({ "type": "auto" }),
        ToolChoice::None => json!({ "type": "none" }),
        ToolChoice::Required => json!({ "type": "any" }),
        ToolChoice::Tool(name) => json!({ "type": "tool", "name": name }),
    }
}

fn tool_choice_from_wire(v: Option<&Value>) -> ToolChoice {
    let Some(v) = v else {
        return ToolChoice::Auto;
    };
    match v.get("type").and_then(Value::as_str) {
        Some("none") => ToolChoice::None,
        Some("any") => ToolChoice::Required,
        Some("tool") => v
            .get("name")
            .and_then(Value::as_str)
            .map(|n| ToolChoice::Tool(n.to_string()))
            .unwrap_or_default(),
        _ => ToolChoice::Auto,
    }
}

/// JSON-only instruction appended to the system text; the Messages API has no
/// response-format field.
fn json_instruction(format: &ResponseFormat) -> String {
    match format.schema() {
        Some(schema) => format!(
            "Respond with a single JSON object that conforms to this JSON Schema, and nothing else:\n{}",
            schema
        ),
        None => "Respond with a single JSON object and nothing else.".to_string(),
    }
}

/// Plain text of a block list or string (system prompts, tool results).
fn blocks_text(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str).map_or(true, |t| t == "text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

impl FormatAdapter for AnthropicAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::AnthropicMessages
    }

    fn to_wire(
        &self,
        profile: &ModelFormatProfile,
        request: &CanonicalRequest,
        model: &str,
        stream: bool,
    ) -> Result<WirePayload> {
        check_capabilities(profile, request, model)?;
        let (system, messages) = shape_messages(profile, request);

        let mut system = system.into_text();
        if let Some(format) = &request.response_format {
            if request.tools.is_empty() {
                let instruction = json_instruction(format);
                system = Some(match system {
                    Some(s) => format!("{}\n\n{}", s, instruction),
                    None => instruction,
                });
            }
        }

        let mut max_tokens = request
            .sampling
            .max_tokens
            .or(profile.max_output_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let thinking = if emits_reasoning(profile, request) {
            request.reasoning_effort.map(|e| e.budget_tokens())
        } else {
            None
        };

        let mut body = json!({
            "model": model,
            "messages": messages_to_wire(&messages),
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(budget) = thinking {
            // budget_tokens must stay below max_tokens.
            if max_tokens <= budget {
                max_tokens = budget + DEFAULT_MAX_TOKENS;
            }
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        } else {
            if let Some(t) = request.sampling.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = request.sampling.top_p {
                body["top_p"] = json!(p);
            }
        }
        body["max_tokens"] = json!(max_tokens);
        if !request.sampling.stop.is_empty() {
            body["stop_sequences"] = json!(request.sampling.stop);
        }

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    let mut tool = json!({ "name": t.name, "input_schema": t.parameters });
                    if let Some(d) = &t.description {
                        tool["description"] = json!(d);
                    }
                    tool
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = tool_choice_to_wire(&request.tool_choice);
        }

        Ok(WirePayload {
            path: "messages".into(),
            headers: vec![("anthropic-version".into(), API_VERSION.into())],
            body,
            stream,
        })
    }

    fn from_wire(&self, response: &WireResponse) -> CanonicalResponse {
        let body = &response.body;
        let usage = Usage::new(
            u64_at(body, "/usage/input_tokens")
                + u64_at(body, "/usage/cache_creation_input_tokens")
                + u64_at(body, "/usage/cache_read_input_tokens"),
            u64_at(body, "/usage/output_tokens"),
        );
        if !(200..300).contains(&response.status) || str_at(body, "/type") == Some("error") {
            return CanonicalResponse {
                finish_reason: FinishReason::Other("error".into()),
                usage,
                ..Default::default()
            };
        }

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in body.get("content").and_then(Value::as_array).into_iter().flatten() {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(new_call_id),
                    name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                    arguments: parse_arguments(block.get("input").unwrap_or(&Value::Null)),
                }),
                // thinking, redacted_thinking
                _ => {}
            }
        }

        CanonicalResponse {
            text: Some(text).filter(|t| !t.is_empty()),
            tool_calls,
            finish_reason: str_at(body, "/stop_reason")
                .map(map_stop_reason)
                .unwrap_or_default(),
            usage,
            ..Default::default()
        }
    }

    fn parse_stream_event(&self, data: &str) -> Result<Vec<StreamDelta>> {
        let v: Value = serde_json::from_str(data)?;
        let mut out = Vec::new();
        match v.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let usage = Usage::new(
                    u64_at(&v, "/message/usage/input_tokens")
                        + u64_at(&v, "/message/usage/cache_read_input_tokens"),
                    u64_at(&v, "/message/usage/output_tokens"),
                );
                if !usage.is_empty() {
                    out.push(StreamDelta::Usage(usage));
                }
            }
            Some("content_block_start") => {
                let index = u64_at(&v, "/index") as u32;
                let block = v.get("content_block").unwrap_or(&Value::Null);
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => out.push(StreamDelta::ToolCallStart {
                        index,
                        id: block.get("id").and_then(Value::as_str).map(String::from),
                        name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                    }),
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(Value::as_str).filter(|t| !t.is_empty()) {
                            out.push(StreamDelta::Text(t.to_string()));
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_delta") => {
                let index = u64_at(&v, "/index") as u32;
                match str_at(&v, "/delta/type") {
                    Some("text_delta") => {
                        if let Some(t) = str_at(&v, "/delta/text") {
                            out.push(StreamDelta::Text(t.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(f) = str_at(&v, "/delta/partial_json").filter(|f| !f.is_empty()) {
                            out.push(StreamDelta::ToolCallArgs {
                                index,
                                fragment: f.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Some("message_delta") => {
                if let Some(reason) = str_at(&v, "/delta/stop_reason") {
                    out.push(StreamDelta::Finish(map_stop_reason(reason)));
                }
                let output = u64_at(&v, "/usage/output_tokens");
                if output > 0 {
                    out.push(StreamDelta::Usage(Usage::new(
                        u64_at(&v, "/usage/input_tokens"),
                        output,
                    )));
                }
            }
            Some("error") => out.push(StreamDelta::Error {
                code: str_at(&v, "/error/type").map(String::from),
                message: str_at(&v, "/error/message").unwrap_or("stream error").to_string(),
            }),
            _ => {}
        }
        Ok(out)
    }

    fn decode_request(&self, body: &Value) -> Result<CanonicalRequest> {
        let family = self.family();
        let wire_messages = body
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid_body(family, "missing messages"))?;

        let mut tool_names: HashMap<String, String> = HashMap::new();
        let mut messages = Vec::new();
        for m in wire_messages {
            let role = m.get("role").and_then(Value::as_str).unwrap_or("user");
            let blocks: Vec<Value> = match m.get("content") {
                Some(Value::String(s)) => vec![json!({ "type": "text", "text": s })],
                Some(Value::Array(a)) => a.clone(),
                _ => Vec::new(),
            };

            if role == "assistant" {
                let mut text = String::new();
                let mut calls = Vec::new();
                for b in &blocks {
                    match b.get("type").and_then(Value::as_str) {
                        Some("text") => text.push_str(b.get("text").and_then(Value::as_str).unwrap_or_default()),
                        Some("tool_use") => {
                            let call = ToolCall::new(
                                b.get("id").and_then(Value::as_str).unwrap_or_default(),
                                b.get("name").and_then(Value::as_str).unwrap_or_default(),
                                b.get("input").cloned().unwrap_or_else(|| json!({})),
                            );
                            tool_names.insert(call.id.clone(), call.name.clone());
                            calls.push(call);
                        }
                        _ => {}
                    }
                }
                messages.push(if calls.is_empty() {
                    Message::assistant(text)
                } else {
                    Message::assistant_tool_calls(Some(text), calls)
                });
                continue;
            }

            for b in &blocks {
                match b.get("type").and_then(Value::as_str) {
                    Some("tool_result") => {
                        let id = b.get("tool_use_id").and_then(Value::as_str).unwrap_or_default();
                        let name = tool_names.get(id).cloned().unwrap_or_default();
                        let mut msg = Message::tool(id, name, blocks_text(b.get("content")));
                        msg.is_error = b.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                        messages.push(msg);
                    }
                    Some("text") => messages.push(Message::user(
                        b.get("text").and_then(Value::as_str).unwrap_or_default(),
                    )),
                    _ => {}
                }
            }
        }

        let mut request = CanonicalRequest::new(messages);
        let system = blocks_text(body.get("system"));
        if !system.is_empty() {
            request.system_prompt = Some(system);
        }
        request.tools = body
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| {
                        Some(ToolSpec {
                            name: t.get("name")?.as_str()?.to_string(),
                            description: t.get("description").and_then(Value::as_str).map(String::from),
                            parameters: t.get("input_schema").cloned().unwrap_or_else(|| json!({})),
                            depends_on_prior: false,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        request.tool_choice = tool_choice_from_wire(body.get("tool_choice"));
        request.sampling.temperature = read_number(body, "/temperature");
        request.sampling.top_p = read_number(body, "/top_p");
        request.sampling.max_tokens = body.get("max_tokens").and_then(Value::as_u64).map(|n| n as u32);
        request.sampling.stop = body
            .get("stop_sequences")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default();
        if str_at(body, "/thinking/type") == Some("enabled") {
            request.reasoning_effort = Some(ReasoningEffort::from_budget(u64_at(body, "/thinking/budget_tokens")));
        }
        Ok(request)
    }

    fn error_code(&self, body: &Value) -> Option<String> {
        str_at(body, "/error/type").map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProviderCatalog;

    fn profile() -> ModelFormatProfile {
        ModelFormatProfile::family_default(ProviderFamily::AnthropicMessages)
    }

    #[test]
    fn test_anthropic_build_request() {
        let req = CanonicalRequest::from_prompt("Hello").with_system("You are helpful");
        let payload = AnthropicAdapter.to_wire(&profile(), &req, "claude-3-5-haiku", false).unwrap();
        assert_eq!(payload.path, "messages");
        assert_eq!(payload.headers[0], ("anthropic-version".to_string(), API_VERSION.to_string()));
        assert_eq!(payload.body["system"], "You are helpful");
        assert_eq!(payload.body["messages"][0]["role"], "user");
        assert_eq!(payload.body["messages"][0]["content"][0]["text"], "Hello");
        assert_eq!(payload.body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_tool_results_merge_into_one_user_turn() {
        let call_a = ToolCall::new("tu_1", "search", json!({"q": "a"}));
        let call_b = ToolCall::new("tu_2", "search", json!({"q": "b"}));
        let mut failed = Message::tool("tu_2", "search", "boom");
        failed.is_error = true;
        let req = CanonicalRequest::new(vec![
            Message::user("find both"),
            Message::assistant_tool_calls(None, vec![call_a, call_b]),
            Message::tool("tu_1", "search", "result a"),
            failed,
        ]);
        let body = AnthropicAdapter.to_wire(&profile(), &req, "claude", false).unwrap().body;
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[2]["content"][1]["is_error"], true);
    }

    #[test]
    fn test_thinking_drops_temperature() {
        let profile = ProviderCatalog::builtin().profile_for(ProviderFamily::AnthropicMessages, "claude-sonnet-4-5");
        assert!(profile.supports_reasoning_parameter);
        let req = CanonicalRequest::from_prompt("think")
            .with_reasoning(ReasoningEffort::Medium)
            .with_temperature(0.3)
            .with_max_tokens(2000);
        let body = AnthropicAdapter.to_wire(&profile, &req, "claude-sonnet-4-5", false).unwrap().body;
        assert_eq!(body["thinking"]["budget_tokens"], 4096);
        assert!(body.get("temperature").is_none());
        assert!(body["max_tokens"].as_u64().unwrap() > 4096);
    }

    #[test]
    fn test_response_format_becomes_instruction() {
        let req = CanonicalRequest::from_prompt("list")
            .with_response_format(ResponseFormat::JsonObject);
        let body = AnthropicAdapter.to_wire(&profile(), &req, "claude", false).unwrap().body;
        assert!(body["system"].as_str().unwrap().contains("JSON object"));
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_anthropic_parse_response() {
        let body = json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 15}
        });
        let resp = AnthropicAdapter.from_wire(&WireResponse::new(200, body));
        assert_eq!(resp.text.as_deref(), Some("Let me check."));
        assert_eq!(resp.tool_calls[0].id, "toolu_1");
        assert_eq!(resp.tool_calls[0].arguments, json!({"city": "Paris"}));
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.usage, Usage::new(20, 15));
    }

    #[test]
    fn test_refusal_maps_to_content_filter() {
        let body = json!({"type": "message", "content": [], "stop_reason": "refusal", "usage": {"input_tokens": 5, "output_tokens": 0}});
        let resp = AnthropicAdapter.from_wire(&WireResponse::new(200, body));
        assert_eq!(resp.finish_reason, FinishReason::ContentFilter);
    }

    #[test]
    fn test_error_body() {
        let body = json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}});
        let resp = AnthropicAdapter.from_wire(&WireResponse::new(529, body.clone()));
        assert_eq!(resp.text, None);
        assert_eq!(AnthropicAdapter.error_code(&body).as_deref(), Some("overloaded_error"));
        assert_eq!(AnthropicAdapter.error_message(&body), "Overloaded");
    }

    #[test]
    fn test_stream_events() {
        let a = &AnthropicAdapter;
        assert_eq!(
            a.parse_stream_event(r#"{"type":"message_start","message":{"usage":{"input_tokens":25,"output_tokens":1}}}"#).unwrap(),
            vec![StreamDelta::Usage(Usage::new(25, 1))]
        );
        assert_eq!(
            a.parse_stream_event(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#).unwrap(),
            vec![StreamDelta::Text("Hi".into())]
        );
        assert_eq!(
            a.parse_stream_event(r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_9","name":"search","input":{}}}"#).unwrap(),
            vec![StreamDelta::ToolCallStart { index: 1, id: Some("toolu_9".into()), name: "search".into() }]
        );
        assert_eq!(
            a.parse_stream_event(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":1}"}}"#).unwrap(),
            vec![StreamDelta::ToolCallArgs { index: 1, fragment: "{\"q\":1}".into() }]
        );
        assert_eq!(
            a.parse_stream_event(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":12}}"#).unwrap(),
            vec![StreamDelta::Finish(FinishReason::Stop), StreamDelta::Usage(Usage::new(0, 12))]
        );
        assert!(a.parse_stream_event(r#"{"type":"ping"}"#).unwrap().is_empty());
    }

    #[test]
    fn test_decode_request_recovers_tool_names() {
        let body = json!({
            "model": "claude",
            "system": [{"type": "text", "text": "rules"}],
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "search", "input": {"q": 1}}]},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]}
            ],
            "thinking": {"type": "enabled", "budget_tokens": 16384}
        });
        let req = AnthropicAdapter.decode_request(&body).unwrap();
        assert_eq!(req.system_prompt.as_deref(), Some("rules"));
        assert_eq!(req.messages[2].name.as_deref(), Some("search"));
        assert_eq!(req.reasoning_effort, Some(ReasoningEffort::High));
    }
}

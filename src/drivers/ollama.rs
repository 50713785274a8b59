//! Ollama `/api/chat` adapter.
//!
//! Sampling lives under `options` (`num_predict` for the token cap), tool-call
//! arguments are JSON objects rather than strings and carry no ids, the structured
//! hint is `format` (`"json"` or a schema), and streams are newline-delimited JSON
//! with a final `done: true` line holding the counts.

use serde_json::{json, Map, Value};

use crate::catalog::{ModelFormatProfile, ProviderFamily};
use crate::transport::Framing;
use crate::types::{
    CanonicalRequest, CanonicalResponse, FinishReason, Message, MessageRole, ReasoningEffort,
    ResponseFormat, ToolCall, Usage,
};
use crate::Result;

use super::openai::{tool_content, tools_from_wire, tools_to_wire};
use super::{
    check_capabilities, emits_reasoning, emits_response_format, invalid_body, new_call_id,
    parse_arguments, read_number, shape_messages, str_at, u64_at, FormatAdapter, StreamDelta,
    WirePayload, WireResponse,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct OllamaAdapter;

fn map_done_reason(reason: &str, has_calls: bool) -> FinishReason {
    match reason {
        "stop" if has_calls => FinishReason::ToolCalls,
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        other => FinishReason::Other(other.to_string()),
    }
}

fn tool_calls_from_wire(v: Option<&Value>) -> Vec<ToolCall> {
    v.and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|c| {
                    Some(ToolCall {
                        id: c
                            .get("id")
                            .and_then(Value::as_str)
                            .map(String::from)
                            .unwrap_or_else(new_call_id),
                        name: str_at(c, "/function/name")?.to_string(),
                        arguments: parse_arguments(c.pointer("/function/arguments").unwrap_or(&Value::Null)),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn message_to_wire(m: &Message) -> Value {
    match m.role {
        MessageRole::Tool => {
            let mut msg = json!({ "role": "tool", "content": tool_content(m) });
            if let Some(name) = &m.name {
                msg["tool_name"] = json!(name);
            }
            msg
        }
        MessageRole::Assistant if m.has_tool_calls() => json!({
            "role": "assistant",
            "content": m.content,
            "tool_calls": m.tool_calls.iter().map(|c| json!({
                "function": { "name": c.name, "arguments": c.arguments },
            })).collect::<Vec<_>>(),
        }),
        role => json!({ "role": role.as_str(), "content": m.content }),
    }
}

fn usage_of(v: &Value) -> Usage {
    Usage::new(u64_at(v, "/prompt_eval_count"), u64_at(v, "/eval_count"))
}

impl FormatAdapter for OllamaAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OllamaChat
    }

    fn framing(&self) -> Framing {
        Framing::Ndjson
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

        let mut wire_messages = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system.into_text() {
            wire_messages.push(json!({ "role": "system", "content": system }));
        }
        wire_messages.extend(messages.iter().map(message_to_wire));

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": stream,
        });

        let sampling = &request.sampling;
        let mut options = Map::new();
        if let Some(t) = sampling.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(p) = sampling.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if let Some(max) = sampling.max_tokens.or(profile.max_output_tokens) {
            options.insert("num_predict".into(), json!(max));
        }
        if !sampling.stop.is_empty() {
            options.insert("stop".into(), json!(sampling.stop));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

        // Ollama has no tool_choice.
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(tools_to_wire(&request.tools));
        }
        if emits_response_format(profile, request) {
            if let Some(format) = &request.response_format {
                body["format"] = match format.schema() {
                    Some(schema) => schema.clone(),
                    None => json!("json"),
                };
            }
        }
        if emits_reasoning(profile, request) {
            body["think"] = json!(true);
        }

        Ok(WirePayload {
            path: "api/chat".into(),
            headers: Vec::new(),
            body,
            stream,
        })
    }

    fn from_wire(&self, response: &WireResponse) -> CanonicalResponse {
        let body = &response.body;
        let usage = usage_of(body);
        if !(200..300).contains(&response.status) || body.get("error").is_some() {
            return CanonicalResponse {
                finish_reason: FinishReason::Other("error".into()),
                usage,
                ..Default::default()
            };
        }

        let tool_calls = tool_calls_from_wire(body.pointer("/message/tool_calls"));
        let finish_reason = map_done_reason(
            str_at(body, "/done_reason").unwrap_or("stop"),
            !tool_calls.is_empty(),
        );
        CanonicalResponse {
            text: str_at(body, "/message/content")
                .filter(|t| !t.is_empty())
                .map(String::from),
            tool_calls,
            finish_reason,
            usage,
            ..Default::default()
        }
    }

    fn parse_stream_event(&self, data: &str) -> Result<Vec<StreamDelta>> {
        let v: Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            return Ok(vec![StreamDelta::Error {
                code: None,
                message: err.as_str().map(String::from).unwrap_or_else(|| err.to_string()),
            }]);
        }

        let mut out = Vec::new();
        if let Some(t) = str_at(&v, "/message/content").filter(|t| !t.is_empty()) {
            out.push(StreamDelta::Text(t.to_string()));
        }
        let calls = tool_calls_from_wire(v.pointer("/message/tool_calls"));
        let has_calls = !calls.is_empty();
        for (index, call) in calls.into_iter().enumerate() {
            out.push(StreamDelta::ToolCallComplete {
                index: index as u32,
                id: Some(call.id),
                name: call.name,
                arguments: call.arguments,
            });
        }
        if v.get("done").and_then(Value::as_bool).unwrap_or(false) {
            out.push(StreamDelta::Finish(map_done_reason(
                str_at(&v, "/done_reason").unwrap_or("stop"),
                has_calls,
            )));
            out.push(StreamDelta::Usage(usage_of(&v)));
        }
        Ok(out)
    }

    fn decode_request(&self, body: &Value) -> Result<CanonicalRequest> {
        let family = self.family();
        let wire_messages = body
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid_body(family, "missing messages"))?;

        let mut system_parts = Vec::new();
        let mut messages: Vec<Message> = Vec::new();
        for m in wire_messages {
            let content = m.get("content").and_then(Value::as_str).unwrap_or_default();
            match m.get("role").and_then(Value::as_str).unwrap_or("user") {
                "system" => system_parts.push(content.to_string()),
                "assistant" => {
                    let calls = tool_calls_from_wire(m.get("tool_calls"));
                    messages.push(if calls.is_empty() {
                        Message::assistant(content)
                    } else {
                        Message::assistant_tool_calls(Some(content.to_string()), calls)
                    });
                }
                "tool" => {
                    let name = m.get("tool_name").and_then(Value::as_str).unwrap_or_default();
                    // Results answer the most recent unanswered call with that name.
                    let answered: Vec<&str> = messages
                        .iter()
                        .filter_map(|p| p.tool_call_id.as_deref())
                        .collect();
                    let id = messages
                        .iter()
                        .flat_map(|p| p.tool_calls.iter())
                        .find(|c| c.name == name && !answered.contains(&c.id.as_str()))
                        .map(|c| c.id.clone())
                        .unwrap_or_else(new_call_id);
                    messages.push(Message::tool(id, name, content));
                }
                _ => messages.push(Message::user(content)),
            }
        }

        let mut request = CanonicalRequest::new(messages);
        if !system_parts.is_empty() {
            request.system_prompt = Some(system_parts.join("\n\n"));
        }
        request.tools = tools_from_wire(body.get("tools"));
        request.sampling.temperature = read_number(body, "/options/temperature");
        request.sampling.top_p = read_number(body, "/options/top_p");
        request.sampling.max_tokens = body
            .pointer("/options/num_predict")
            .and_then(Value::as_u64)
            .map(|n| n as u32);
        request.sampling.stop = body
            .pointer("/options/stop")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default();
        request.response_format = match body.get("format") {
            Some(Value::String(s)) if s == "json" => Some(ResponseFormat::JsonObject),
            Some(schema @ Value::Object(_)) => Some(ResponseFormat::JsonSchema {
                name: "response".into(),
                schema: schema.clone(),
                strict: false,
            }),
            _ => None,
        };
        if body.get("think").and_then(Value::as_bool).unwrap_or(false) {
            request.reasoning_effort = Some(ReasoningEffort::Medium);
        }
        Ok(request)
    }

    fn error_code(&self, _body: &Value) -> Option<String> {
        None
    }
}

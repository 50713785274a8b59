//! OpenAI Chat Completions 适配器 — 覆盖所有 OpenAI 兼容主机
//!
//! OpenAI Chat Completions adapter. Also serves every host that clones the API
//! (Groq, Mistral, DeepSeek, OpenRouter, Together, vLLM, ...):
//! - system text is a `system` message (or `developer` for reasoning models);
//! - tool calls carry arguments as a JSON-encoded string;
//! - reasoning models take `max_completion_tokens` and reject sampling knobs;
//! - streams are SSE with `choices[0].delta`, usage arrives in a final chunk when
//!   `stream_options.include_usage` is set.

use serde_json::{json, Value};

use crate::catalog::{ModelFormatProfile, ProviderFamily};
use crate::types::{
    CanonicalRequest, CanonicalResponse, FinishReason, Message, MessageRole, ReasoningEffort,
    ResponseFormat, ToolCall, ToolChoice, ToolSpec, Usage,
};
use crate::Result;

use super::{
    check_capabilities, emits_reasoning, emits_response_format, invalid_body, new_call_id,
    parse_arguments, read_number, shape_messages, str_at, u64_at, FormatAdapter, StreamDelta,
    SystemSlot, WirePayload, WireResponse,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiAdapter;

pub(crate) fn map_finish(reason: &str) -> FinishReason {
    match reason {
        "stop" | "end_turn" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

/// Tool result text for families without an error flag.
pub(crate) fn tool_content(m: &Message) -> String {
    if m.is_error {
        format!("Error: {}", m.content)
    } else {
        m.content.clone()
    }
}

fn tool_call_to_wire(call: &ToolCall) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": { "name": call.name, "arguments": call.arguments_string() },
    })
}

fn message_to_wire(m: &Message) -> Value {
    match m.role {
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": tool_content(m),
        }),
        MessageRole::Assistant if m.has_tool_calls() => {
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            json!({
                "role": "assistant",
                "content": content,
                "tool_calls": m.tool_calls.iter().map(tool_call_to_wire).collect::<Vec<_>>(),
            })
        }
        role => json!({ "role": role.as_str(), "content": m.content }),
    }
}

pub(crate) fn tools_to_wire(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            let mut function = json!({ "name": t.name, "parameters": t.parameters });
            if let Some(d) = &t.description {
                function["description"] = json!(d);
            }
            json!({ "type": "function", "function": function })
        })
        .collect()
}

pub(crate) fn tools_from_wire(tools: Option<&Value>) -> Vec<ToolSpec> {
    tools
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    let f = t.get("function").unwrap_or(t);
                    Some(ToolSpec {
                        name: f.get("name")?.as_str()?.to_string(),
                        description: f.get("description").and_then(Value::as_str).map(String::from),
                        parameters: f.get("parameters").cloned().unwrap_or_else(|| json!({})),
                        depends_on_prior: false,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn response_format_to_wire(format: &ResponseFormat) -> Value {
    match format {
        ResponseFormat::JsonObject => json!({ "type": "json_object" }),
        ResponseFormat::JsonSchema { name, schema, strict } => json!({
            "type": "json_schema",
            "json_schema": { "name": name, "schema": schema, "strict": strict },
        }),
    }
}

pub(crate) fn response_format_from_wire(v: &Value) -> Option<ResponseFormat> {
    match v.get("type").and_then(Value::as_str)? {
        "json_object" => Some(ResponseFormat::JsonObject),
        "json_schema" => {
            let js = v.get("json_schema")?;
            Some(ResponseFormat::JsonSchema {
                name: js.get("name").and_then(Value::as_str).unwrap_or("response").to_string(),
                schema: js.get("schema").cloned().unwrap_or_else(|| json!({})),
                strict: js.get("strict").and_then(Value::as_bool).unwrap_or(false),
            })
        }
        _ => None,
    }
}

fn tool_choice_to_wire(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Tool(name) => json!({ "type": "function", "function": { "name": name } }),
    }
}

fn tool_choice_from_wire(v: Option<&Value>) -> ToolChoice {
    match v {
        Some(Value::String(s)) if s == "none" => ToolChoice::None,
        Some(Value::String(s)) if s == "required" => ToolChoice::Required,
        Some(obj @ Value::Object(_)) => str_at(obj, "/function/name")
            .map(|n| ToolChoice::Tool(n.to_string()))
            .unwrap_or_default(),
        _ => ToolChoice::Auto,
    }
}

fn tool_calls_from_wire(calls: Option<&Value>) -> Vec<ToolCall> {
    calls
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|c| {
                    let name = str_at(c, "/function/name")?;
                    Some(ToolCall {
                        id: c
                            .get("id")
                            .and_then(Value::as_str)
                            .map(String::from)
                            .unwrap_or_else(new_call_id),
                        name: name.to_string(),
                        arguments: parse_arguments(c.pointer("/function/arguments").unwrap_or(&Value::Null)),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Message content as a string: plain string or an array of text parts.
fn content_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            Some(text)
        }
        _ => None,
    }
}

impl FormatAdapter for OpenAiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAiCompatible
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
        match system {
            SystemSlot::Native(s) => wire_messages.push(json!({ "role": "system", "content": s })),
            SystemSlot::Developer(s) => {
                wire_messages.push(json!({ "role": "developer", "content": s }))
            }
            SystemSlot::None => {}
        }
        wire_messages.extend(messages.iter().map(message_to_wire));

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": stream,
        });

        let sampling = &request.sampling;
        // Reasoning models reject sampling knobs and the legacy token field.
        if profile.supports_reasoning_parameter {
            if let Some(max) = sampling.max_tokens.or(profile.max_output_tokens) {
                body["max_completion_tokens"] = json!(max);
            }
        } else {
            if let Some(t) = sampling.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = sampling.top_p {
                body["top_p"] = json!(p);
            }
            if let Some(max) = sampling.max_tokens.or(profile.max_output_tokens) {
                body["max_tokens"] = json!(max);
            }
        }
        if !sampling.stop.is_empty() {
            body["stop"] = json!(sampling.stop);
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(tools_to_wire(&request.tools));
            body["tool_choice"] = tool_choice_to_wire(&request.tool_choice);
        }
        if emits_response_format(profile, request) {
            if let Some(format) = &request.response_format {
                body["response_format"] = response_format_to_wire(format);
            }
        }
        if emits_reasoning(profile, request) {
            if let Some(effort) = request.reasoning_effort {
                body["reasoning_effort"] = json!(effort.as_str());
            }
        }
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }

        Ok(WirePayload {
            path: "chat/completions".into(),
            headers: Vec::new(),
            body,
            stream,
        })
    }

    fn from_wire(&self, response: &WireResponse) -> CanonicalResponse {
        let body = &response.body;
        let usage = Usage::new(
            u64_at(body, "/usage/prompt_tokens"),
            u64_at(body, "/usage/completion_tokens"),
        );
        if !(200..300).contains(&response.status) || body.get("error").is_some() {
            return CanonicalResponse {
                finish_reason: FinishReason::Other("error".into()),
                usage,
                ..Default::default()
            };
        }

        let message = body.pointer("/choices/0/message");
        let refusal = message.and_then(|m| m.get("refusal")).and_then(Value::as_str);
        let mut finish_reason = str_at(body, "/choices/0/finish_reason")
            .map(map_finish)
            .unwrap_or_default();
        let text = match refusal {
            Some(r) => {
                finish_reason = FinishReason::ContentFilter;
                Some(r.to_string())
            }
            None => content_text(message.and_then(|m| m.get("content"))),
        };

        CanonicalResponse {
            text: text.filter(|t| !t.is_empty()),
            tool_calls: tool_calls_from_wire(message.and_then(|m| m.get("tool_calls"))),
            finish_reason,
            usage,
            ..Default::default()
        }
    }

    fn parse_stream_event(&self, data: &str) -> Result<Vec<StreamDelta>> {
        let v: Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            return Ok(vec![StreamDelta::Error {
                code: self.error_code(&v),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string(),
            }]);
        }

        let mut out = Vec::new();
        if let Some(choice) = v.pointer("/choices/0") {
            if let Some(text) = str_at(choice, "/delta/content").filter(|t| !t.is_empty()) {
                out.push(StreamDelta::Text(text.to_string()));
            }
            if let Some(refusal) = str_at(choice, "/delta/refusal").filter(|t| !t.is_empty()) {
                out.push(StreamDelta::Text(refusal.to_string()));
                out.push(StreamDelta::Finish(FinishReason::ContentFilter));
            }
            if let Some(calls) = choice.pointer("/delta/tool_calls").and_then(Value::as_array) {
                for (pos, tc) in calls.iter().enumerate() {
                    let index = tc.get("index").and_then(Value::as_u64).unwrap_or(pos as u64) as u32;
                    if let Some(name) = str_at(tc, "/function/name") {
                        out.push(StreamDelta::ToolCallStart {
                            index,
                            id: tc.get("id").and_then(Value::as_str).map(String::from),
                            name: name.to_string(),
                        });
                    }
                    if let Some(args) = str_at(tc, "/function/arguments").filter(|a| !a.is_empty()) {
                        out.push(StreamDelta::ToolCallArgs {
                            index,
                            fragment: args.to_string(),
                        });
                    }
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                out.push(StreamDelta::Finish(map_finish(reason)));
            }
        }
        if v.get("usage").map_or(false, Value::is_object) {
            out.push(StreamDelta::Usage(Usage::new(
                u64_at(&v, "/usage/prompt_tokens"),
                u64_at(&v, "/usage/completion_tokens"),
            )));
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
        let mut messages = Vec::new();
        for m in wire_messages {
            let role = m.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = content_text(m.get("content")).unwrap_or_default();
            match role {
                "system" | "developer" => system_parts.push(content),
                "assistant" => {
                    let calls = tool_calls_from_wire(m.get("tool_calls"));
                    messages.push(if calls.is_empty() {
                        Message::assistant(content)
                    } else {
                        Message::assistant_tool_calls(Some(content), calls)
                    });
                }
                "tool" => messages.push(Message::tool(
                    m.get("tool_call_id").and_then(Value::as_str).unwrap_or_default(),
                    m.get("name").and_then(Value::as_str).unwrap_or_default(),
                    content,
                )),
                _ => messages.push(Message::user(content)),
            }
        }

        let mut request = CanonicalRequest::new(messages);
        if !system_parts.is_empty() {
            request.system_prompt = Some(system_parts.join("\n\n"));
        }
        request.tools = tools_from_wire(body.get("tools"));
        request.tool_choice = tool_choice_from_wire(body.get("tool_choice"));
        request.sampling.temperature = read_number(body, "/temperature");
        request.sampling.top_p = read_number(body, "/top_p");
        request.sampling.max_tokens = body
            .get("max_tokens")
            .or_else(|| body.get("max_completion_tokens"))
            .and_then(Value::as_u64)
            .map(|n| n as u32);
        request.sampling.stop = match body.get("stop") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(a)) => a.iter().filter_map(|s| s.as_str().map(String::from)).collect(),
            _ => Vec::new(),
        };
        request.response_format = body.get("response_format").and_then(response_format_from_wire);
        request.reasoning_effort = body
            .get("reasoning_effort")
            .and_then(|v| serde_json::from_value::<ReasoningEffort>(v.clone()).ok());
        Ok(request)
    }
}

//! Gemini Generate API 适配器 — 实现 Google Gemini 特有的请求/响应格式转换
//!
//! Google Gemini generateContent adapter. Key differences:
//! - Uses `contents` instead of `messages`, with `parts` instead of `content`.
//! - Roles: `user` and `model`. System text uses `system_instruction`.
//! - Tool calls are `functionCall` parts without ids; results are `functionResponse`
//!   parts matched by name, so ids are generated on the way back.
//! - `generationConfig` wraps sampling, the JSON response hint and `thinkingConfig`.
//! - Schemas are sanitized: Gemini rejects `$schema` and `additionalProperties`.
//! - Streaming (`?alt=sse`) sends whole response objects per event.

use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};

use crate::catalog::{ModelFormatProfile, ProviderFamily};
use crate::types::{
    CanonicalRequest, CanonicalResponse, FinishReason, Message, MessageRole, ReasoningEffort,
    ResponseFormat, ToolCall, ToolChoice, ToolSpec, Usage,
};
use crate::Result;

use super::{
    check_capabilities, emits_reasoning, emits_response_format, invalid_body, new_call_id,
    parse_arguments, read_number, shape_messages, str_at, u64_at, FormatAdapter, StreamDelta,
    WirePayload, WireResponse,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiAdapter;

const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties"];

/// Strip schema keywords Gemini refuses, at every depth.
pub(crate) fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn map_finish(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "IMAGE_SAFETY" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_ascii_lowercase()),
    }
}

fn message_parts(m: &Message) -> (&'static str, Vec<Value>) {
    match m.role {
        MessageRole::Tool => {
            let key = if m.is_error { "error" } else { "content" };
            let mut response = Map::new();
            response.insert(key.to_string(), json!(m.content));
            (
                "user",
                vec![json!({
                    "functionResponse": {
                        "name": m.name.clone().unwrap_or_default(),
                        "response": response,
                    }
                })],
            )
        }
        MessageRole::Assistant => {
            let mut parts = Vec::with_capacity(m.tool_calls.len() + 1);
            if !m.content.is_empty() {
                parts.push(json!({ "text": m.content }));
            }
            parts.extend(
                m.tool_calls
                    .iter()
                    .map(|c| json!({ "functionCall": { "name": c.name, "args": c.arguments } })),
            );
            ("model", parts)
        }
        _ => ("user", vec![json!({ "text": m.content })]),
    }
}

fn contents_to_wire(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for m in messages {
        let (role, parts) = message_parts(m);
        if parts.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["parts"].as_array_mut() {
                    existing.extend(parts);
                }
            }
            _ => out.push(json!({ "role": role, "parts": parts })),
        }
    }
    out
}

fn tool_config(choice: &ToolChoice) -> Value {
    let config = match choice {
        ToolChoice::Auto => json!({ "mode": "AUTO" }),
        ToolChoice::None => json!({ "mode": "NONE" }),
        ToolChoice::Required => json!({ "mode": "ANY" }),
        ToolChoice::Tool(name) => json!({ "mode": "ANY", "allowedFunctionNames": [name] }),
    };
    json!({ "functionCallingConfig": config })
}

fn tool_choice_from_wire(v: Option<&Value>) -> ToolChoice {
    let Some(config) = v.and_then(|v| v.get("functionCallingConfig")) else {
        return ToolChoice::Auto;
    };
    match config.get("mode").and_then(Value::as_str) {
        Some("NONE") => ToolChoice::None,
        Some("ANY") => match config.pointer("/allowedFunctionNames/0").and_then(Value::as_str) {
            Some(name) => ToolChoice::Tool(name.to_string()),
            None => ToolChoice::Required,
        },
        _ => ToolChoice::Auto,
    }
}

/// Text and function calls of one candidate; thought parts are skipped.
fn candidate_parts(candidate: &Value) -> (String, Vec<ToolCall>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    for part in candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
        if let Some(fc) = part.get("functionCall") {
            calls.push(ToolCall {
                id: fc
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(new_call_id),
                name: fc.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                arguments: parse_arguments(fc.get("args").unwrap_or(&Value::Null)),
            });
        }
    }
    (text, calls)
}

fn usage_of(body: &Value) -> Usage {
    Usage::new(
        u64_at(body, "/usageMetadata/promptTokenCount"),
        u64_at(body, "/usageMetadata/candidatesTokenCount")
            + u64_at(body, "/usageMetadata/thoughtsTokenCount"),
    )
}

/// Finish reason for a candidate; `STOP` with function calls means the model wants tools.
fn finish_of(body: &Value, has_calls: bool) -> Option<FinishReason> {
    if str_at(body, "/promptFeedback/blockReason").is_some() {
        return Some(FinishReason::ContentFilter);
    }
    let reason = map_finish(str_at(body, "/candidates/0/finishReason")?);
    Some(if has_calls && reason == FinishReason::Stop {
        FinishReason::ToolCalls
    } else {
        reason
    })
}

impl FormatAdapter for GeminiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::GeminiGenerate
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

        let mut body = json!({ "contents": contents_to_wire(&messages) });
        if let Some(system) = system.into_text() {
            body["system_instruction"] = json!({ "parts": [{ "text": system }] });
        }

        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    let mut decl = json!({ "name": t.name, "parameters": sanitize_schema(&t.parameters) });
                    if let Some(d) = &t.description {
                        decl["description"] = json!(d);
                    }
                    decl
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
            body["toolConfig"] = tool_config(&request.tool_choice);
        }

        let sampling = &request.sampling;
        let mut config = Map::new();
        if let Some(t) = sampling.temperature {
            config.insert("temperature".into(), json!(t));
        }
        if let Some(p) = sampling.top_p {
            config.insert("topP".into(), json!(p));
        }
        if let Some(max) = sampling.max_tokens.or(profile.max_output_tokens) {
            config.insert("maxOutputTokens".into(), json!(max));
        }
        if !sampling.stop.is_empty() {
            config.insert("stopSequences".into(), json!(sampling.stop));
        }
        if emits_response_format(profile, request) {
            config.insert("responseMimeType".into(), json!("application/json"));
            if let Some(schema) = request.response_format.as_ref().and_then(ResponseFormat::schema) {
                config.insert("responseSchema".into(), sanitize_schema(schema));
            }
        }
        if emits_reasoning(profile, request) {
            if let Some(effort) = request.reasoning_effort {
                config.insert(
                    "thinkingConfig".into(),
                    json!({ "thinkingBudget": effort.budget_tokens() }),
                );
            }
        }
        if !config.is_empty() {
            body["generationConfig"] = Value::Object(config);
        }

        let path = if stream {
            format!("models/{}:streamGenerateContent?alt=sse", model)
        } else {
            format!("models/{}:generateContent", model)
        };
        Ok(WirePayload {
            path,
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

        let (text, tool_calls) = body
            .pointer("/candidates/0")
            .map(candidate_parts)
            .unwrap_or_default();
        let finish_reason = finish_of(body, !tool_calls.is_empty()).unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

        CanonicalResponse {
            text: Some(text).filter(|t| !t.is_empty()),
            tool_calls,
            finish_reason,
            usage,
            ..Default::default()
        }
    }

    fn parse_stream_event(&self, data: &str) -> Result<Vec<StreamDelta>> {
        let v: Value = serde_json::from_str(data)?;
        if v.get("error").is_some() {
            return Ok(vec![StreamDelta::Error {
                code: self.error_code(&v),
                message: self.error_message(&v),
            }]);
        }

        let mut out = Vec::new();
        let (text, calls) = v.pointer("/candidates/0").map(candidate_parts).unwrap_or_default();
        if !text.is_empty() {
            out.push(StreamDelta::Text(text));
        }
        let has_calls = !calls.is_empty();
        for (index, call) in calls.into_iter().enumerate() {
            out.push(StreamDelta::ToolCallComplete {
                index: index as u32,
                id: Some(call.id),
                name: call.name,
                arguments: call.arguments,
            });
        }
        if let Some(reason) = finish_of(&v, has_calls) {
            out.push(StreamDelta::Finish(reason));
        }
        let usage = usage_of(&v);
        if !usage.is_empty() {
            out.push(StreamDelta::Usage(usage));
        }
        Ok(out)
    }

    fn decode_request(&self, body: &Value) -> Result<CanonicalRequest> {
        let family = self.family();
        let contents = body
            .get("contents")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid_body(family, "missing contents"))?;

        // functionResponse parts carry only a name; pair them with pending calls in order.
        let mut pending: HashMap<String, VecDeque<String>> = HashMap::new();
        let mut messages = Vec::new();
        for content in contents {
            let role = content.get("role").and_then(Value::as_str).unwrap_or("user");
            let parts = content.get("parts").and_then(Value::as_array).cloned().unwrap_or_default();

            if role == "model" {
                let mut text = String::new();
                let mut calls = Vec::new();
                for p in &parts {
                    if let Some(t) = p.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                    if let Some(fc) = p.get("functionCall") {
                        let name = fc.get("name").and_then(Value::as_str).unwrap_or_default();
                        let id = new_call_id();
                        pending.entry(name.to_string()).or_default().push_back(id.clone());
                        calls.push(ToolCall::new(id, name, fc.get("args").cloned().unwrap_or_else(|| json!({}))));
                    }
                }
                messages.push(if calls.is_empty() {
                    Message::assistant(text)
                } else {
                    Message::assistant_tool_calls(Some(text), calls)
                });
                continue;
            }

            for p in &parts {
                if let Some(t) = p.get("text").and_then(Value::as_str) {
                    messages.push(Message::user(t));
                } else if let Some(fr) = p.get("functionResponse") {
                    let name = fr.get("name").and_then(Value::as_str).unwrap_or_default();
                    let id = pending
                        .get_mut(name)
                        .and_then(VecDeque::pop_front)
                        .unwrap_or_else(new_call_id);
                    let response = fr.get("response").unwrap_or(&Value::Null);
                    let (content, is_error) = match (response.get("content"), response.get("error")) {
                        (Some(Value::String(s)), _) => (s.clone(), false),
                        (_, Some(Value::String(s))) => (s.clone(), true),
                        _ => (response.to_string(), false),
                    };
                    let mut msg = Message::tool(id, name, content);
                    msg.is_error = is_error;
                    messages.push(msg);
                }
            }
        }

        let mut request = CanonicalRequest::new(messages);
        let system = body.get("system_instruction").or_else(|| body.get("systemInstruction"));
        if let Some(parts) = system.and_then(|s| s.get("parts")).and_then(Value::as_array) {
            let text: Vec<&str> = parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect();
            if !text.is_empty() {
                request.system_prompt = Some(text.join("\n\n"));
            }
        }
        request.tools = body
            .pointer("/tools/0/functionDeclarations")
            .and_then(Value::as_array)
            .map(|decls| {
                decls
                    .iter()
                    .filter_map(|d| {
                        Some(ToolSpec {
                            name: d.get("name")?.as_str()?.to_string(),
                            description: d.get("description").and_then(Value::as_str).map(String::from),
                            parameters: d.get("parameters").cloned().unwrap_or_else(|| json!({})),
                            depends_on_prior: false,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        request.tool_choice = tool_choice_from_wire(body.get("toolConfig"));

        request.sampling.temperature = read_number(body, "/generationConfig/temperature");
        request.sampling.top_p = read_number(body, "/generationConfig/topP");
        request.sampling.max_tokens = body
            .pointer("/generationConfig/maxOutputTokens")
            .and_then(Value::as_u64)
            .map(|n| n as u32);
        request.sampling.stop = body
            .pointer("/generationConfig/stopSequences")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default();
        if str_at(body, "/generationConfig/responseMimeType") == Some("application/json") {
            request.response_format = Some(match body.pointer("/generationConfig/responseSchema") {
                Some(schema) => ResponseFormat::JsonSchema {
                    name: "response".into(),
                    schema: schema.clone(),
                    strict: false,
                },
                None => ResponseFormat::JsonObject,
            });
        }
        if let Some(budget) = body
            .pointer("/generationConfig/thinkingConfig/thinkingBudget")
            .and_then(Value::as_u64)
        {
            request.reasoning_effort = Some(ReasoningEffort::from_budget(budget));
        }
        Ok(request)
    }

    fn error_code(&self, body: &Value) -> Option<String> {
        str_at(body, "/error/status")
            .map(String::from)
            .or_else(|| body.pointer("/error/code").and_then(Value::as_u64).map(|c| c.to_string()))
    }
}

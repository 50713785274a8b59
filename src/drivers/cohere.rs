//! Cohere Chat v2 adapter.
//!
//! Close to the OpenAI shape with a few twists: assistant commentary alongside tool
//! calls goes in `tool_plan`, `tool_choice` only knows `REQUIRED` and `NONE`, response
//! content is an array of typed parts, and streams use named events
//! (`content-delta`, `tool-call-start`, `message-end`, ...).

use serde_json::{json, Value};

use crate::catalog::{ModelFormatProfile, ProviderFamily};
use crate::types::{
    CanonicalRequest, CanonicalResponse, FinishReason, Message, MessageRole, ReasoningEffort,
    ResponseFormat, ToolCall, ToolChoice, Usage,
};
use crate::Result;

use super::openai::{tool_content, tools_from_wire, tools_to_wire};
use super::{
    check_capabilities, emits_reasoning, emits_response_format, invalid_body, new_call_id,
    parse_arguments, read_number, shape_messages, str_at, u64_at, FormatAdapter, StreamDelta,
    WirePayload, WireResponse,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct CohereAdapter;

fn map_finish(reason: &str) -> FinishReason {
    match reason {
        "COMPLETE" | "STOP_SEQUENCE" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "TOOL_CALL" => FinishReason::ToolCalls,
        "ERROR_TOXIC" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_ascii_lowercase()),
    }
}

/// Usage from `tokens`, falling back to `billed_units`.
fn usage_at(v: &Value, base: &str) -> Usage {
    let tokens = Usage::new(
        u64_at(v, &format!("{}/tokens/input_tokens", base)),
        u64_at(v, &format!("{}/tokens/output_tokens", base)),
    );
    if !tokens.is_empty() {
        return tokens;
    }
    Usage::new(
        u64_at(v, &format!("{}/billed_units/input_tokens", base)),
        u64_at(v, &format!("{}/billed_units/output_tokens", base)),
    )
}

/// Text of a string or an array of `{type: text|document, ...}` parts.
fn content_text(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| {
                p.get("text")
                    .and_then(Value::as_str)
                    .or_else(|| p.pointer("/document/data").and_then(Value::as_str))
            })
            .collect(),
        _ => String::new(),
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
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": tool_content(m),
        }),
        MessageRole::Assistant if m.has_tool_calls() => {
            let mut msg = json!({
                "role": "assistant",
                "tool_calls": m.tool_calls.iter().map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments_string() },
                })).collect::<Vec<_>>(),
            });
            if !m.content.is_empty() {
                msg["tool_plan"] = json!(m.content);
            }
            msg
        }
        role => json!({ "role": role.as_str(), "content": m.content }),
    }
}

impl FormatAdapter for CohereAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::CohereChat
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
        if let Some(t) = sampling.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = sampling.top_p {
            body["p"] = json!(p);
        }
        if let Some(max) = sampling.max_tokens.or(profile.max_output_tokens) {
            body["max_tokens"] = json!(max);
        }
        if !sampling.stop.is_empty() {
            body["stop_sequences"] = json!(sampling.stop);
        }

        if !request.tools.is_empty() {
            // A forced single tool becomes REQUIRED over just that tool.
            let tools = match &request.tool_choice {
                ToolChoice::Tool(name) => request.tools.iter().filter(|t| &t.name == name).cloned().collect(),
                _ => request.tools.clone(),
            };
            body["tools"] = Value::Array(tools_to_wire(&tools));
            match request.tool_choice {
                ToolChoice::Required | ToolChoice::Tool(_) => body["tool_choice"] = json!("REQUIRED"),
                ToolChoice::None => body["tool_choice"] = json!("NONE"),
                ToolChoice::Auto => {}
            }
        }
        if emits_response_format(profile, request) {
            if let Some(format) = &request.response_format {
                let mut rf = json!({ "type": "json_object" });
                if let Some(schema) = format.schema() {
                    rf["json_schema"] = schema.clone();
                }
                body["response_format"] = rf;
            }
        }
        if emits_reasoning(profile, request) {
            if let Some(effort) = request.reasoning_effort {
                body["thinking"] = json!({ "type": "enabled", "token_budget": effort.budget_tokens() });
            }
        }

        Ok(WirePayload {
            path: "chat".into(),
            headers: Vec::new(),
            body,
            stream,
        })
    }

    fn from_wire(&self, response: &WireResponse) -> CanonicalResponse {
        let body = &response.body;
        let usage = usage_at(body, "/usage");
        if !(200..300).contains(&response.status) {
            return CanonicalResponse {
                finish_reason: FinishReason::Other("error".into()),
                usage,
                ..Default::default()
            };
        }

        let message = body.get("message");
        let text = content_text(message.and_then(|m| m.get("content")));
        CanonicalResponse {
            text: Some(text).filter(|t| !t.is_empty()),
            tool_calls: tool_calls_from_wire(message.and_then(|m| m.get("tool_calls"))),
            finish_reason: str_at(body, "/finish_reason").map(map_finish).unwrap_or_default(),
            usage,
            ..Default::default()
        }
    }

    fn parse_stream_event(&self, data: &str) -> Result<Vec<StreamDelta>> {
        let v: Value = serde_json::from_str(data)?;
        let index = u64_at(&v, "/index") as u32;
        let mut out = Vec::new();
        match v.get("type").and_then(Value::as_str) {
            Some("content-delta") => {
                if let Some(t) = str_at(&v, "/delta/message/content/text").filter(|t| !t.is_empty()) {
                    out.push(StreamDelta::Text(t.to_string()));
                }
            }
            Some("tool-call-start") => {
                let call = v.pointer("/delta/message/tool_calls").unwrap_or(&Value::Null);
                out.push(StreamDelta::ToolCallStart {
                    index,
                    id: call.get("id").and_then(Value::as_str).map(String::from),
                    name: str_at(call, "/function/name").unwrap_or_default().to_string(),
                });
                if let Some(args) = str_at(call, "/function/arguments").filter(|a| !a.is_empty()) {
                    out.push(StreamDelta::ToolCallArgs {
                        index,
                        fragment: args.to_string(),
                    });
                }
            }
            Some("tool-call-delta") => {
                if let Some(args) = str_at(&v, "/delta/message/tool_calls/function/arguments") {
                    out.push(StreamDelta::ToolCallArgs {
                        index,
                        fragment: args.to_string(),
                    });
                }
            }
            Some("message-end") => {
                if let Some(reason) = str_at(&v, "/delta/finish_reason") {
                    if reason == "ERROR" {
                        out.push(StreamDelta::Error {
                            code: Some(reason.to_string()),
                            message: str_at(&v, "/delta/error").unwrap_or("stream error").to_string(),
                        });
                    } else {
                        out.push(StreamDelta::Finish(map_finish(reason)));
                    }
                }
                let usage = usage_at(&v, "/delta/usage");
                if !usage.is_empty() {
                    out.push(StreamDelta::Usage(usage));
                }
            }
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

        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for m in wire_messages {
            let role = m.get("role").and_then(Value::as_str).unwrap_or("user");
            match role {
                "system" => system_parts.push(content_text(m.get("content"))),
                "assistant" => {
                    let calls = tool_calls_from_wire(m.get("tool_calls"));
                    if calls.is_empty() {
                        messages.push(Message::assistant(content_text(m.get("content"))));
                    } else {
                        let plan = m.get("tool_plan").and_then(Value::as_str).map(String::from);
                        messages.push(Message::assistant_tool_calls(plan, calls));
                    }
                }
                "tool" => {
                    let id = m.get("tool_call_id").and_then(Value::as_str).unwrap_or_default();
                    let name = messages
                        .iter()
                        .rev()
                        .flat_map(|prior: &Message| prior.tool_calls.iter())
                        .find(|c| c.id == id)
                        .map(|c| c.name.clone())
                        .unwrap_or_default();
                    messages.push(Message::tool(id, name, content_text(m.get("content"))));
                }
                _ => messages.push(Message::user(content_text(m.get("content")))),
            }
        }

        let mut request = CanonicalRequest::new(messages);
        if !system_parts.is_empty() {
            request.system_prompt = Some(system_parts.join("\n\n"));
        }
        request.tools = tools_from_wire(body.get("tools"));
        request.tool_choice = match body.get("tool_choice").and_then(Value::as_str) {
            Some("REQUIRED") => ToolChoice::Required,
            Some("NONE") => ToolChoice::None,
            _ => ToolChoice::Auto,
        };
        request.sampling.temperature = read_number(body, "/temperature");
        request.sampling.top_p = read_number(body, "/p");
        request.sampling.max_tokens = body.get("max_tokens").and_then(Value::as_u64).map(|n| n as u32);
        request.sampling.stop = body
            .get("stop_sequences")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default();
        if let Some(rf) = body.get("response_format") {
            request.response_format = Some(match rf.get("json_schema") {
                Some(schema) => ResponseFormat::JsonSchema {
                    name: "response".into(),
                    schema: schema.clone(),
                    strict: false,
                },
                None => ResponseFormat::JsonObject,
            });
        }
        if str_at(body, "/thinking/type") == Some("enabled") {
            request.reasoning_effort = Some(ReasoningEffort::from_budget(u64_at(body, "/thinking/token_budget")));
        }
        Ok(request)
    }

    fn error_code(&self, body: &Value) -> Option<String> {
        str_at(body, "/error/code").or_else(|| str_at(body, "/code")).map(String::from)
    }

    fn error_message(&self, body: &Value) -> String {
        str_at(body, "/message")
            .or_else(|| str_at(body, "/error/message"))
            .map(String::from)
            .unwrap_or_else(|| super::truncate(&body.to_string(), 500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolSpec;

    fn profile() -> ModelFormatProfile {
        ModelFormatProfile::family_default(ProviderFamily::CohereChat)
    }

    fn tools() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("search", "Search", json!({"type": "object"})),
            ToolSpec::new("fetch", "Fetch", json!({"type": "object"})),
        ]
    }

    #[test]
    fn test_cohere_build_request() {
        let req = CanonicalRequest::from_prompt("hi")
            .with_system("sys")
            .with_tools(tools())
            .with_tool_choice(ToolChoice::Tool("fetch".into()));
        let payload = CohereAdapter.to_wire(&profile(), &req, "command-r-plus", false).unwrap();
        assert_eq!(payload.path, "chat");
        assert_eq!(payload.body["messages"][0]["role"], "system");
        assert_eq!(payload.body["tool_choice"], "REQUIRED");
        assert_eq!(payload.body["tools"].as_array().unwrap().len(), 1);
        assert_eq!(payload.body["tools"][0]["function"]["name"], "fetch");
    }

    #[test]
    fn test_tool_plan_carries_assistant_text() {
        let call = ToolCall::new("c1", "search", json!({"q": "x"}));
        let req = CanonicalRequest::new(vec![
            Message::user("q"),
            Message::assistant_tool_calls(Some("I will search.".into()), vec![call]),
            Message::tool("c1", "search", "found"),
        ]);
        let body = CohereAdapter.to_wire(&profile(), &req, "command-r", false).unwrap().body;
        assert_eq!(body["messages"][1]["tool_plan"], "I will search.");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"], "{\"q\":\"x\"}");
        assert_eq!(body["messages"][2]["tool_call_id"], "c1");
    }

    #[test]
    fn test_cohere_parse_response() {
        let body = json!({
            "id": "abc",
            "finish_reason": "COMPLETE",
            "message": {"role": "assistant", "content": [{"type": "text", "text": "Hello!"}]},
            "usage": {"billed_units": {"input_tokens": 5, "output_tokens": 2}, "tokens": {"input_tokens": 70, "output_tokens": 2}}
        });
        let resp = CohereAdapter.from_wire(&WireResponse::new(200, body));
        assert_eq!(resp.text.as_deref(), Some("Hello!"));
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage, Usage::new(70, 2));
    }

    #[test]
    fn test_error_message_top_level() {
        let body = json!({"message": "invalid api token"});
        assert_eq!(CohereAdapter.error_message(&body), "invalid api token");
        assert_eq!(CohereAdapter.error_code(&body), None);
    }

    #[test]
    fn test_stream_events() {
        let a = &CohereAdapter;
        assert_eq!(
            a.parse_stream_event(r#"{"type":"content-delta","index":0,"delta":{"message":{"content":{"text":"Hi"}}}}"#).unwrap(),
            vec![StreamDelta::Text("Hi".into())]
        );
        assert_eq!(
            a.parse_stream_event(r#"{"type":"tool-call-start","index":0,"delta":{"message":{"tool_calls":{"id":"t1","type":"function","function":{"name":"search","arguments":""}}}}}"#).unwrap(),
            vec![StreamDelta::ToolCallStart { index: 0, id: Some("t1".into()), name: "search".into() }]
        );
        assert_eq!(
            a.parse_stream_event(r#"{"type":"tool-call-delta","index":0,"delta":{"message":{"tool_calls":{"function":{"arguments":"{}"}}}}}"#).unwrap(),
            vec![StreamDelta::ToolCallArgs { index: 0, fragment: "{}".into() }]
        );
        assert_eq!(
            a.parse_stream_event(r#"{"type":"message-end","delta":{"finish_reason":"TOOL_CALL","usage":{"billed_units":{"input_tokens":3,"output_tokens":9}}}}"#).unwrap(),
            vec![StreamDelta::Finish(FinishReason::ToolCalls), StreamDelta::Usage(Usage::new(3, 9))]
        );
    }
}

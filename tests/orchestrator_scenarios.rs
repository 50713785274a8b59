//! End-to-end conversations over a scripted transport.

mod common;

use ai_gateway::{
    CanonicalRequest, FinishReason, Gateway, GatewayEvent, ModelRole, OrchestratorConfig, ToolCollaborator,
};
use common::{openai_entry, rate_limited, text_reply, tool_reply, EchoTool, Reply, ScriptedTransport};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        stream: false,
        ..Default::default()
    }
}

fn gateway(
    transport: &Arc<ScriptedTransport>,
    planning: &[&str],
    synthesis: &[&str],
    tools: Vec<Arc<dyn ToolCollaborator>>,
    config: OrchestratorConfig,
) -> Gateway {
    let mut builder = Gateway::builder()
        .provider(openai_entry("p1"))
        .role(ModelRole::Planning, planning.iter().copied())
        .role(ModelRole::Synthesis, synthesis.iter().copied())
        .role(ModelRole::FinalAnswer, synthesis.iter().copied())
        .transport(transport.clone())
        .orchestrator_config(config);
    for tool in tools {
        builder = builder.tool(tool);
    }
    builder.build().expect("gateway builds")
}

fn text_of(events: &[GatewayEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            GatewayEvent::Token { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn assert_single_terminal(events: &[GatewayEvent]) {
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1, "{:?}", events);
    assert!(events.last().map_or(false, GatewayEvent::is_terminal));
}

/// `tool` messages of a recorded OpenAI request body, as `(tool_call_id, content)`.
fn tool_messages(body: &Value) -> Vec<(String, String)> {
    body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| m["role"] == "tool")
        .map(|m| {
            (
                m["tool_call_id"].as_str().unwrap().to_string(),
                m["content"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_plain_answer() {
    let transport = ScriptedTransport::new();
    transport.script("m1", text_reply("Paris.", 12, 3));
    let gw = gateway(&transport, &["m1"], &["m1"], vec![], config());

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("Capital of France?"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(text_of(&events), "Paris.");
    assert!(events.iter().any(|e| matches!(
        e,
        GatewayEvent::Usage { input_tokens: 12, output_tokens: 3, .. }
    )));
    assert_eq!(events.last(), Some(&GatewayEvent::done(FinishReason::Stop)));
    assert_single_terminal(&events);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.cumulative_tokens, 15);
}

#[tokio::test]
async fn test_streamed_answer_arrives_in_chunks() {
    let transport = ScriptedTransport::new();
    transport.script(
        "m1",
        Reply::Sse(vec![
            json!({"choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
        ]),
    );
    let gw = gateway(&transport, &["m1"], &["m1"], vec![], OrchestratorConfig::default());

    let (events, _) = gw
        .chat(CanonicalRequest::from_prompt("hi"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    let tokens: Vec<&GatewayEvent> = events
        .iter()
        .filter(|e| matches!(e, GatewayEvent::Token { .. }))
        .collect();
    assert_eq!(tokens.len(), 2);
    assert_eq!(text_of(&events), "Hello");
    assert_eq!(events.last(), Some(&GatewayEvent::done(FinishReason::Stop)));
    assert_eq!(transport.sent()[0].body["stream"], json!(true));
}

#[tokio::test]
async fn test_rate_limit_rotates_to_second_model() {
    let transport = ScriptedTransport::new();
    transport.script("m1", rate_limited());
    transport.script("m2", text_reply("from m2", 4, 2));
    let gw = gateway(&transport, &["m1", "m2"], &["m1", "m2"], vec![], config());

    let (events, _) = gw
        .chat(CanonicalRequest::from_prompt("hello"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(transport.models(), vec!["m1", "m2"]);
    assert_eq!(text_of(&events), "from m2");
    assert_eq!(events.last(), Some(&GatewayEvent::done(FinishReason::Stop)));
}

#[tokio::test]
async fn test_parallel_tools_keep_request_order() {
    let transport = ScriptedTransport::new();
    transport.script(
        "m1",
        tool_reply(
            &[("c1", "alpha", json!({"q": "one"})), ("c2", "beta", json!({"q": "two"}))],
            10,
            5,
        ),
    );
    transport.script("m2", text_reply("Both done.", 20, 4));

    // Each tool waits for the other: only concurrent execution gets past the barrier.
    let barrier = Arc::new(Barrier::new(2));
    let alpha = Arc::new(
        EchoTool::new("alpha")
            .with_barrier(barrier.clone())
            .with_delay(Duration::from_millis(50)),
    );
    let beta = Arc::new(EchoTool::new("beta").with_barrier(barrier));
    let gw = gateway(
        &transport,
        &["m1"],
        &["m2"],
        vec![alpha.clone(), beta.clone()],
        OrchestratorConfig {
            tool_timeout: Duration::from_secs(5),
            ..config()
        },
    );

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("compare one and two"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    // First call from the planning pool, the follow-up from the synthesis pool.
    assert_eq!(transport.models(), vec!["m1", "m2"]);
    assert_eq!(alpha.invocations(), 1);
    assert_eq!(beta.invocations(), 1);

    let ends: Vec<(&str, bool)> = events
        .iter()
        .filter_map(|e| match e {
            GatewayEvent::ToolEnd { name, is_error, .. } => Some((name.as_str(), *is_error)),
            _ => None,
        })
        .collect();
    assert_eq!(ends, vec![("beta", false), ("alpha", false)]);

    let fed_back = tool_messages(&transport.sent()[1].body);
    assert_eq!(
        fed_back,
        vec![
            ("c1".to_string(), "alpha saw one".to_string()),
            ("c2".to_string(), "beta saw two".to_string()),
        ]
    );
    assert_eq!(text_of(&events), "Both done.");
    assert_eq!(outcome.finish_reason(), Some(&FinishReason::Stop));
    assert_eq!(outcome.cumulative_tokens, 39);
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_iteration_cap_synthesizes_answer() {
    let transport = ScriptedTransport::new();
    for i in 0..5 {
        let id = format!("c{}", i);
        transport.script("m1", tool_reply(&[(id.as_str(), "alpha", json!({"q": "again"}))], 5, 5));
    }
    let alpha = Arc::new(EchoTool::new("alpha"));
    let gw = gateway(
        &transport,
        &["m1"],
        &["m1"],
        vec![alpha.clone()],
        OrchestratorConfig {
            max_iterations: 3,
            ..config()
        },
    );

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("loop forever"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(transport.calls(), 3);
    assert_eq!(outcome.iterations, 3);
    // Tools requested by the last allowed call are not run.
    assert_eq!(alpha.invocations(), 2);
    assert_eq!(events.last(), Some(&GatewayEvent::done(FinishReason::IterationLimit)));
    let text = text_of(&events);
    assert!(text.contains("Stopped at the iteration limit."), "{}", text);
    assert!(text.contains("- alpha: alpha saw again"), "{}", text);
    assert!(text.contains("Not run: alpha."), "{}", text);
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_cancel_during_tools_stops_before_next_call() {
    let transport = ScriptedTransport::new();
    transport.script("m1", tool_reply(&[("c1", "alpha", json!({"q": "slow"}))], 5, 5));
    transport.script("m1", text_reply("never sent", 5, 5));
    let alpha = Arc::new(EchoTool::new("alpha").with_delay(Duration::from_millis(200)));
    let gw = gateway(&transport, &["m1"], &["m1"], vec![alpha.clone()], config());

    let mut conversation = gw.chat(CanonicalRequest::from_prompt("go")).unwrap();
    while let Some(event) = conversation.next().await {
        if matches!(event, GatewayEvent::ToolStart { .. }) {
            conversation.cancel();
            break;
        }
    }
    let (rest, outcome) = conversation.finish().await.unwrap();

    assert_eq!(transport.calls(), 1);
    assert_eq!(alpha.invocations(), 1);
    assert_eq!(rest.last(), Some(&GatewayEvent::done(FinishReason::Cancelled)));
    assert_eq!(outcome.finish_reason(), Some(&FinishReason::Cancelled));
    assert_single_terminal(&rest);
}

#[tokio::test]
async fn test_cancel_during_tools_skips_later_waves() {
    let transport = ScriptedTransport::new();
    transport.script(
        "m1",
        tool_reply(
            &[
                ("c1", "alpha", json!({"q": "slow"})),
                ("c2", "beta", json!({"q": "needs alpha"})),
            ],
            5,
            5,
        ),
    );
    transport.script("m1", text_reply("never sent", 5, 5));
    let alpha = Arc::new(EchoTool::new("alpha").with_delay(Duration::from_millis(200)));
    let beta = Arc::new(EchoTool::new("beta").after_prior());
    let gw = gateway(&transport, &["m1"], &["m1"], vec![alpha.clone(), beta.clone()], config());

    let mut conversation = gw.chat(CanonicalRequest::from_prompt("go")).unwrap();
    while let Some(event) = conversation.next().await {
        if matches!(event, GatewayEvent::ToolStart { .. }) {
            conversation.cancel();
            break;
        }
    }
    let (rest, outcome) = conversation.finish().await.unwrap();

    assert_eq!(alpha.invocations(), 1);
    assert_eq!(beta.invocations(), 0);
    assert!(!rest.iter().any(|e| matches!(
        e,
        GatewayEvent::ToolStart { name, .. } if name == "beta"
    )));
    assert_eq!(transport.calls(), 1);
    assert_eq!(outcome.finish_reason(), Some(&FinishReason::Cancelled));
    assert_single_terminal(&rest);
}

#[tokio::test]
async fn test_token_budget_stops_before_running_tools() {
    let transport = ScriptedTransport::new();
    transport.script("m1", tool_reply(&[("c1", "alpha", json!({"q": "x"}))], 40, 10));
    let alpha = Arc::new(EchoTool::new("alpha"));
    let gw = gateway(
        &transport,
        &["m1"],
        &["m1"],
        vec![alpha.clone()],
        OrchestratorConfig {
            max_total_tokens: Some(30),
            ..config()
        },
    );

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("expensive"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(alpha.invocations(), 0);
    assert_eq!(outcome.finish_reason(), Some(&FinishReason::TokenBudget));
    let text = text_of(&events);
    assert!(text.contains("Stopped at the token budget."), "{}", text);
    assert!(text.contains("Not run: alpha."), "{}", text);
}

#[tokio::test]
async fn test_deadline_answers_from_gathered_results() {
    let transport = ScriptedTransport::new();
    transport.script("m1", tool_reply(&[("c1", "alpha", json!({"q": "late"}))], 5, 5));
    transport.script("m1", text_reply("too late", 5, 5));
    let alpha = Arc::new(EchoTool::new("alpha").with_delay(Duration::from_millis(300)));
    let gw = gateway(
        &transport,
        &["m1"],
        &["m1"],
        vec![alpha],
        OrchestratorConfig {
            conversation_timeout: Some(Duration::from_millis(100)),
            ..config()
        },
    );

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("hurry"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(transport.calls(), 1);
    assert_eq!(outcome.finish_reason(), Some(&FinishReason::Deadline));
    let text = text_of(&events);
    assert!(text.contains("Stopped at the time limit."), "{}", text);
    assert!(text.contains("alpha saw late"), "{}", text);
}

#[tokio::test]
async fn test_unknown_tool_is_reported_to_the_model() {
    let transport = ScriptedTransport::new();
    transport.script("m1", tool_reply(&[("c1", "nope", json!({}))], 5, 5));
    transport.script("m1", text_reply("I could not look that up.", 5, 5));
    let gw = gateway(&transport, &["m1"], &["m1"], vec![Arc::new(EchoTool::new("alpha"))], config());

    let (events, _) = gw
        .chat(CanonicalRequest::from_prompt("use a tool"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert!(events
        .iter()
        .any(|e| matches!(e, GatewayEvent::ToolEnd { is_error: true, .. })));
    let fed_back = tool_messages(&transport.sent()[1].body);
    assert_eq!(fed_back.len(), 1);
    assert!(fed_back[0].1.starts_with("Error: "), "{:?}", fed_back);
    assert_eq!(events.last(), Some(&GatewayEvent::done(FinishReason::Stop)));
}

#[tokio::test]
async fn test_refusal_ends_with_content_filter() {
    let transport = ScriptedTransport::new();
    transport.script(
        "m1",
        Reply::status(
            400,
            json!({"error": {"code": "content_policy_violation", "message": "flagged by the safety system"}}),
        ),
    );
    let gw = gateway(&transport, &["m1"], &["m1"], vec![], config());

    let (events, _) = gw
        .chat(CanonicalRequest::from_prompt("something bad"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(transport.calls(), 1);
    assert!(text_of(&events).contains("declined"));
    assert_eq!(events.last(), Some(&GatewayEvent::done(FinishReason::ContentFilter)));
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_permanent_failure_is_a_terminal_error() {
    let transport = ScriptedTransport::new();
    transport.script(
        "m1",
        Reply::status(401, json!({"error": {"message": "Incorrect API key provided"}})),
    );
    let gw = gateway(&transport, &["m1"], &["m1"], vec![], config());

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("hello"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(transport.calls(), 1);
    match events.last() {
        Some(GatewayEvent::Error { kind, message }) => {
            assert_eq!(kind, "permanent");
            assert!(message.contains("Incorrect API key"), "{}", message);
        }
        other => panic!("expected error event, got {:?}", other),
    }
    assert!(outcome.finish_reason().is_none());
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_dropped_receiver_cancels_conversation() {
    let transport = ScriptedTransport::new();
    transport.script("m1", tool_reply(&[("c1", "alpha", json!({"q": "x"}))], 5, 5));
    transport.script("m1", text_reply("unused", 5, 5));
    let alpha = Arc::new(EchoTool::new("alpha").with_delay(Duration::from_millis(100)));
    let gw = gateway(&transport, &["m1"], &["m1"], vec![alpha], config());

    let orchestrator = gw.orchestrator().clone();
    let pools = gw.pools(&gw.scope()).unwrap();
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    drop(rx);
    let state = ai_gateway::orchestrator::OrchestrationState::new(Default::default());
    let outcome = orchestrator
        .run(&gw.scope(), &pools, CanonicalRequest::from_prompt("bye"), state, tx)
        .await;

    assert_eq!(outcome.finish_reason(), Some(&FinishReason::Cancelled));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_long_tool_output_summarized_on_its_own_pool() {
    let transport = ScriptedTransport::new();
    let long_query = "northern lights forecast ".repeat(8);
    transport.script("m1", tool_reply(&[("c1", "alpha", json!({"q": long_query}))], 10, 2));
    transport.script("ms", text_reply("aurora likely tonight", 5, 1));
    transport.script("m1", text_reply("Go outside after ten.", 20, 2));

    let gw = Gateway::builder()
        .provider(openai_entry("p1"))
        .role(ModelRole::Planning, ["m1"])
        .role(ModelRole::Synthesis, ["m1"])
        .role(ModelRole::Summarization, ["ms"])
        .tool(Arc::new(EchoTool::new("alpha")))
        .transport(transport.clone())
        .orchestrator_config(OrchestratorConfig {
            stream: false,
            summarize_over_chars: Some(40),
            ..Default::default()
        })
        .build()
        .unwrap();

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("Will I see the aurora?"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(transport.models(), vec!["m1", "ms", "m1"]);
    // Summary calls are not iterations, but their tokens and calls count.
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.model_calls, 3);
    assert_eq!(outcome.cumulative_tokens, 40);
    assert!(events.iter().any(|e| matches!(
        e,
        GatewayEvent::Usage { model_id, .. } if model_id == "ms"
    )));

    let last = transport.sent().pop().unwrap();
    assert_eq!(
        tool_messages(&last.body),
        vec![("c1".to_string(), "aurora likely tonight".to_string())]
    );
    assert_eq!(text_of(&events), "Go outside after ten.");
}

fn summarizing_gateway(transport: &Arc<ScriptedTransport>, tool: Arc<EchoTool>, max_iterations: u32) -> Gateway {
    Gateway::builder()
        .provider(openai_entry("p1"))
        .role(ModelRole::Planning, ["m1"])
        .role(ModelRole::Synthesis, ["m1"])
        .role(ModelRole::Summarization, ["ms"])
        .tool(tool)
        .transport(transport.clone())
        .orchestrator_config(OrchestratorConfig {
            stream: false,
            max_iterations,
            summarize_over_chars: Some(40),
            ..Default::default()
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_summaries_skipped_when_no_call_remains() {
    let transport = ScriptedTransport::new();
    let long_query = "northern lights forecast ".repeat(8);
    transport.script("m1", tool_reply(&[("c1", "alpha", json!({"q": long_query}))], 10, 2));
    transport.script("ms", text_reply("never sent", 5, 1));
    transport.script("m1", text_reply("Go outside after ten.", 20, 2));
    let gw = summarizing_gateway(&transport, Arc::new(EchoTool::new("alpha")), 2);

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("Will I see the aurora?"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(transport.models(), vec!["m1", "m1"]);
    assert!(transport.calls() <= 2);
    assert_eq!(outcome.model_calls, 2);
    let last = transport.sent().pop().unwrap();
    assert_eq!(
        tool_messages(&last.body),
        vec![("c1".to_string(), format!("alpha saw {}", long_query))]
    );
    assert_eq!(text_of(&events), "Go outside after ten.");
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_summaries_limited_to_spare_model_calls() {
    let transport = ScriptedTransport::new();
    let first = "northern lights forecast ".repeat(8);
    let second = "cloud cover by the hour ".repeat(8);
    transport.script(
        "m1",
        tool_reply(
            &[
                ("c1", "alpha", json!({"q": first})),
                ("c2", "alpha", json!({"q": second})),
            ],
            10,
            2,
        ),
    );
    transport.script("ms", text_reply("aurora likely tonight", 5, 1));
    transport.script("ms", text_reply("never sent", 5, 1));
    transport.script("m1", text_reply("Go outside after ten.", 20, 2));
    let gw = summarizing_gateway(&transport, Arc::new(EchoTool::new("alpha")), 3);

    let (events, outcome) = gw
        .chat(CanonicalRequest::from_prompt("Will I see the aurora?"))
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(transport.models(), vec!["m1", "ms", "m1"]);
    assert!(transport.calls() <= 3);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.model_calls, 3);
    let last = transport.sent().pop().unwrap();
    assert_eq!(
        tool_messages(&last.body),
        vec![
            ("c1".to_string(), "aurora likely tonight".to_string()),
            ("c2".to_string(), format!("alpha saw {}", second)),
        ]
    );
    assert_eq!(outcome.finish_reason(), Some(&FinishReason::Stop));
    assert_single_terminal(&events);
}

#[tokio::test]
async fn test_cancel_during_tools_issues_no_summary() {
    let transport = ScriptedTransport::new();
    let long_query = "northern lights forecast ".repeat(8);
    transport.script("m1", tool_reply(&[("c1", "alpha", json!({"q": long_query}))], 5, 5));
    transport.script("ms", text_reply("never sent", 5, 1));
    transport.script("m1", text_reply("never sent", 5, 5));
    let alpha = Arc::new(EchoTool::new("alpha").with_delay(Duration::from_millis(200)));
    let gw = summarizing_gateway(&transport, alpha.clone(), 8);

    let mut conversation = gw.chat(CanonicalRequest::from_prompt("go")).unwrap();
    while let Some(event) = conversation.next().await {
        if matches!(event, GatewayEvent::ToolStart { .. }) {
            conversation.cancel();
            break;
        }
    }
    let (rest, outcome) = conversation.finish().await.unwrap();

    assert_eq!(transport.models(), vec!["m1"]);
    assert_eq!(alpha.invocations(), 1);
    assert_eq!(outcome.model_calls, 1);
    assert_eq!(rest.last(), Some(&GatewayEvent::done(FinishReason::Cancelled)));
    assert_single_terminal(&rest);
}

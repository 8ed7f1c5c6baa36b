//! End-to-end tool workflow against a mock server

use serde_json::{json, Value};
use studio_core::{
    Agent, Conversation, ErrorKind, FallbackParser, ParameterProperty, ParameterSchema, Role,
    StudioClient, ToolDefinition, ToolRegistry, ToolWorkflow, WorkflowOptions,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> StudioClient {
    StudioClient::with_base_url(format!("{}/v1", server.uri())).unwrap()
}

fn reply(message: Value, prompt_tokens: u32, completion_tokens: u32) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "m1",
        "choices": [{"index": 0, "message": message, "finish_reason": "stop"}],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    }))
}

fn tool_call(id: &str, name: &str, arguments: &str) -> Value {
    json!({"id": id, "type": "function", "function": {"name": name, "arguments": arguments}})
}

/// First request gets `first`, every later one gets `rest`
async fn two_round_server(first: ResponseTemplate, rest: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(first)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(rest)
        .mount(&server)
        .await;
    server
}

async fn request_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
        .collect()
}

fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_fn(
        ToolDefinition::from_schema("get_current_time", "Current local time", &ParameterSchema::new()),
        |_args| async { Ok("12:00".to_string()) },
    );
    registry.register_fn(
        ToolDefinition::from_schema(
            "list_directory",
            "List a directory",
            &ParameterSchema::new().with_required("path", ParameterProperty::string("Directory")),
        ),
        |args| async move {
            let path = serde_json::from_str::<Value>(&args)
                .ok()
                .and_then(|v| v["path"].as_str().map(str::to_string))
                .unwrap_or_default();
            Ok(format!("listing of {}", path))
        },
    );
    registry
}

fn workflow(server: &MockServer) -> ToolWorkflow {
    ToolWorkflow::new(client_for(server), WorkflowOptions::new("m1"))
}

#[tokio::test]
async fn reply_without_tool_calls_is_final() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(reply(json!({"role": "assistant", "content": "4"}), 10, 1))
        .expect(1)
        .mount(&server)
        .await;

    let mut conversation = Conversation::new(None);
    conversation.append_user("What is 2+2?");

    let result = workflow(&server)
        .run(&mut conversation, &registry(), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(result.final_response, "4");
    assert!(result.executed_tool_calls.is_empty());
    assert_eq!(result.total_usage.total_tokens, 11);

    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation.messages()[1].role, Role::Assistant);
    assert_eq!(conversation.messages()[1].text(), "4");

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies[0]["tools"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn tool_calls_run_in_order_before_final_round() {
    let first = reply(
        json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [
                tool_call("call_1", "get_current_time", "{}"),
                tool_call("call_2", "list_directory", "{\"path\": \"/tmp\"}")
            ]
        }),
        20,
        5,
    );
    let second = reply(json!({"role": "assistant", "content": "It is noon."}), 40, 4);
    let server = two_round_server(first, second).await;

    let mut conversation = Conversation::new(Some("You are helpful".to_string()));
    conversation.append_user("What time is it, and what is in /tmp?");

    let result = workflow(&server)
        .run(&mut conversation, &registry(), &CancellationToken::new())
        .await;

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.final_response, "It is noon.");
    let ids: Vec<&str> = result
        .executed_tool_calls
        .iter()
        .map(|c| c.tool_call.id.as_str())
        .collect();
    assert_eq!(ids, vec!["call_1", "call_2"]);
    assert_eq!(result.executed_tool_calls[1].result, "listing of /tmp");
    assert_eq!(result.total_usage.prompt_tokens, 60);
    assert_eq!(result.total_usage.completion_tokens, 9);
    assert_eq!(result.total_usage.total_tokens, 69);

    let roles: Vec<Role> = conversation.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Tool,
            Role::Assistant
        ]
    );
    assert_eq!(conversation.messages()[3].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(conversation.messages()[4].text(), "listing of /tmp");

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0].get("tools").is_some());
    assert!(bodies[1].get("tools").is_none());

    let final_messages = bodies[1]["messages"].as_array().unwrap();
    assert_eq!(final_messages.len(), 5);
    assert_eq!(final_messages[3]["role"], "tool");
    assert_eq!(final_messages[3]["content"], "12:00");
    assert_eq!(final_messages[4]["tool_call_id"], "call_2");
}

#[tokio::test]
async fn handler_failure_is_reported_to_model() {
    let first = reply(
        json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [tool_call("call_1", "get_current_time", "{}")]
        }),
        10,
        3,
    );
    let second = reply(json!({"role": "assistant", "content": "Clock is down."}), 15, 4);
    let server = two_round_server(first, second).await;

    let mut registry = ToolRegistry::new();
    registry.register_fn(
        ToolDefinition::from_schema("get_current_time", "Current local time", &ParameterSchema::new()),
        |_args| async { Err(anyhow::anyhow!("clock unavailable")) },
    );

    let mut conversation = Conversation::new(None);
    conversation.append_user("What time is it?");
    let result = workflow(&server)
        .run(&mut conversation, &registry, &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(result.final_response, "Clock is down.");
    let call = &result.executed_tool_calls[0];
    assert!(!call.success);
    assert_eq!(call.error_message.as_deref(), Some("clock unavailable"));

    let bodies = request_bodies(&server).await;
    assert_eq!(
        bodies[1]["messages"][2]["content"],
        "Tool execution failed: clock unavailable"
    );
}

#[tokio::test]
async fn unknown_tool_gets_not_found_reply() {
    let first = reply(
        json!({
            "role": "assistant",
            "tool_calls": [tool_call("call_1", "launch_rocket", "{}")]
        }),
        10,
        3,
    );
    let second = reply(json!({"role": "assistant", "content": "I cannot do that."}), 10, 3);
    let server = two_round_server(first, second).await;

    let mut conversation = Conversation::new(None);
    conversation.append_user("Launch it");
    let result = workflow(&server)
        .run(&mut conversation, &registry(), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(
        result.executed_tool_calls[0].reply_text(),
        "Tool execution failed: Tool not found: launch_rocket"
    );
}

#[tokio::test]
async fn final_round_failure_keeps_executed_calls() {
    let first = reply(
        json!({
            "role": "assistant",
            "tool_calls": [tool_call("call_1", "get_current_time", "{}")]
        }),
        10,
        3,
    );
    let server = two_round_server(first, ResponseTemplate::new(500)).await;

    let mut conversation = Conversation::new(None);
    conversation.append_user("What time is it?");
    let result = workflow(&server)
        .run(&mut conversation, &registry(), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ServerUnavailable));
    assert!(result.error_message.is_some());
    assert_eq!(result.executed_tool_calls.len(), 1);
    assert!(result.executed_tool_calls[0].success);
    assert_eq!(result.total_usage.total_tokens, 13);
}

#[tokio::test]
async fn cancellation_between_handlers_keeps_finished_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(reply(
            json!({
                "role": "assistant",
                "tool_calls": [
                    tool_call("call_1", "stop_after", "{}"),
                    tool_call("call_2", "get_current_time", "{}")
                ]
            }),
            10,
            3,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut registry = registry();
    registry.register_fn(
        ToolDefinition::from_schema("stop_after", "Cancels the run", &ParameterSchema::new()),
        move |_args| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Ok("stopped".to_string())
            }
        },
    );

    let mut conversation = Conversation::new(None);
    conversation.append_user("Do both");
    let result = workflow(&server)
        .run(&mut conversation, &registry, &cancel)
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(result.executed_tool_calls.len(), 1);
    assert_eq!(result.executed_tool_calls[0].tool_call.id, "call_1");
    assert_eq!(result.executed_tool_calls[0].result, "stopped");

    let messages = conversation.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(messages[2].text(), "stopped");
    assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_2"));
    assert_eq!(messages[3].text(), "Tool execution cancelled");
}

#[tokio::test]
async fn first_round_failure_executes_nothing() {
    let client = StudioClient::with_base_url("http://127.0.0.1:1/v1").unwrap();
    let mut conversation = Conversation::new(None);
    conversation.append_user("hello");

    let result = ToolWorkflow::new(client, WorkflowOptions::new("m1"))
        .run(&mut conversation, &registry(), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ServerUnavailable));
    assert!(result.executed_tool_calls.is_empty());
    assert_eq!(conversation.len(), 1);
}

#[tokio::test]
async fn agent_recovers_json_tool_call_from_content() {
    let first = reply(
        json!({
            "role": "assistant",
            "content": "Sure.\n```json\n{\"name\": \"list_directory\", \"arguments\": {\"path\": \"src\"}}\n```"
        }),
        10,
        10,
    );
    let second = reply(json!({"role": "assistant", "content": "src has files."}), 10, 3);
    let server = two_round_server(first, second).await;

    let mut agent = Agent::new(client_for(&server), "m1").with_registry(registry());
    let result = agent.send("What is in src?", &CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.final_response, "src has files.");
    assert_eq!(result.executed_tool_calls.len(), 1);
    let call = &result.executed_tool_calls[0];
    assert!(call.tool_call.id.starts_with("fallback_"));
    assert_eq!(call.result, "listing of src");

    let assistant = &agent.conversation().messages()[1];
    assert_eq!(assistant.requested_tool_calls().len(), 1);
    assert_eq!(agent.conversation().len(), 4);
}

#[tokio::test]
async fn agent_infers_tool_call_from_keywords() {
    let first = reply(
        json!({"role": "assistant", "content": "Let me check the current time for you."}),
        10,
        10,
    );
    let second = reply(json!({"role": "assistant", "content": "It is 12:00."}), 10, 3);
    let server = two_round_server(first, second).await;

    let mut agent = Agent::new(client_for(&server), "m1").with_registry(registry());
    let result = agent.send("time?", &CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.executed_tool_calls.len(), 1);
    assert_eq!(result.executed_tool_calls[0].tool_call.name(), "get_current_time");
    assert_eq!(result.final_response, "It is 12:00.");
}

#[tokio::test]
async fn agent_without_fallback_takes_prose_as_final() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(reply(
            json!({"role": "assistant", "content": "Let me check the current time."}),
            10,
            10,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let mut agent = Agent::new(client_for(&server), "m1")
        .with_registry(registry())
        .with_fallback(None);
    let result = agent.send("time?", &CancellationToken::new()).await;

    assert!(result.success);
    assert!(result.executed_tool_calls.is_empty());
    assert_eq!(result.final_response, "Let me check the current time.");
}

#[tokio::test]
async fn heuristics_can_be_disabled_while_json_recovery_stays() {
    let parser = FallbackParser::without_heuristics();
    assert!(parser.detect("what time is it", &registry()).is_empty());

    let calls = parser.detect(r#"{"name": "get_current_time", "arguments": {}}"#, &registry());
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments(), "{}");
}

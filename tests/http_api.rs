//! Session protocol over the HTTP API.

mod common;

use common::read_events;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchboard::agent::{ModelChunk, ScriptedModel, ToolCallRequest};
use switchboard::events::EventType;
use switchboard::http;
use switchboard::secrets::StaticSecretResolver;

fn tools() -> Value {
    json!([
        {"id": "clock", "name": "clock", "kind": "built_in", "category": "time",
         "binding": {"type": "local", "module": "builtin::clock", "symbol": "now"}},
        {"id": "echo", "name": "echo", "kind": "built_in", "enabled": false,
         "binding": {"type": "local", "module": "builtin::text", "symbol": "echo"}}
    ])
}

async fn server(config: Value, model: ScriptedModel) -> String {
    let runtime = common::runtime(config, Arc::new(model), StaticSecretResolver::new());
    common::spawn(http::router(runtime)).await
}

fn answer(text: &str) -> Vec<ModelChunk> {
    vec![ModelChunk::Text(text.into())]
}

#[tokio::test]
async fn health_reports_stats() {
    let base = server(json!({}), ScriptedModel::default()).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"]["live"], 0);
    assert_eq!(body["pool"]["connections"], 0);
}

#[tokio::test]
async fn unknown_session_header_mints_a_new_session() {
    let base = server(json!({}), ScriptedModel::new([answer("hi")])).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat", base))
        .header("X-Session-ID", "forged-or-expired")
        .json(&json!({"message": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-session-status"], "created");
    assert_ne!(response.headers()["x-session-id"], "forged-or-expired");
    let (events, done) = read_events(response).await;
    assert!(done);
    assert_eq!(events.last().unwrap().event_type, EventType::Complete);
}

#[tokio::test]
async fn reject_unknown_answers_not_found() {
    let base = server(
        json!({"sessions": {"reject_unknown": true}}),
        ScriptedModel::new([answer("hi")]),
    )
    .await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat", base))
        .header("X-Session-ID", "forged-or-expired")
        .json(&json!({"message": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let base = server(json!({}), ScriptedModel::default()).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat", base))
        .json(&json!({"message": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn tool_toggles_are_scoped_to_the_session() {
    let base = server(json!({"tools": tools()}), ScriptedModel::new([answer("ok")])).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/chat", base))
        .json(&json!({"message": "hello"}))
        .send()
        .await
        .unwrap();
    let session = response.headers()["x-session-id"].to_str().unwrap().to_string();
    read_events(response).await;

    let toggled = client
        .put(format!("{}/v1/tools/echo", base))
        .header("X-Session-ID", &session)
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(toggled.status(), 200);

    let scoped: Value = client
        .get(format!("{}/v1/tools", base))
        .header("X-Session-ID", &session)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let defaults: Value = client
        .get(format!("{}/v1/tools", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let echo_enabled = |body: &Value| {
        body["tools"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["id"] == "echo")
            .map(|t| t["enabled"].clone())
            .unwrap()
    };
    assert_eq!(echo_enabled(&scoped), true);
    assert_eq!(echo_enabled(&defaults), false);

    let unknown_tool = client
        .put(format!("{}/v1/tools/nope", base))
        .header("X-Session-ID", &session)
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_tool.status(), 404);

    let no_session = client
        .put(format!("{}/v1/tools/echo", base))
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(no_session.status(), 400);
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let base = server(json!({}), ScriptedModel::new([answer("ok")])).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/chat", base))
        .json(&json!({"message": "hello"}))
        .send()
        .await
        .unwrap();
    let session = response.headers()["x-session-id"].to_str().unwrap().to_string();
    read_events(response).await;

    for _ in 0..2 {
        let deleted = client
            .delete(format!("{}/v1/sessions/{}", base, session))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), 204);
    }
    let abort = client
        .post(format!("{}/v1/sessions/{}/abort", base, session))
        .send()
        .await
        .unwrap();
    assert_eq!(abort.status(), 404);
}

#[tokio::test]
async fn busy_session_errors_still_echo_the_session() {
    let (tool_url, _counters) =
        common::persistent_server(Duration::ZERO, Duration::from_secs(30)).await;
    let model = ScriptedModel::new([
        vec![ModelChunk::ToolCall(ToolCallRequest {
            id: "c1".into(),
            name: "slow".into(),
            arguments: json!({}),
        })],
        vec![ModelChunk::Text("done".into())],
    ]);
    let runtime = common::runtime(
        json!({"tools": [
            {"id": "slow", "name": "slow", "kind": "remote",
             "binding": {"type": "remote", "endpoint": "ref://slow_url", "transport": "persistent"}}
        ]}),
        Arc::new(model),
        StaticSecretResolver::new().with("slow_url", tool_url),
    );
    let base = common::spawn(http::router(runtime)).await;
    let client = reqwest::Client::new();

    // the run holds the session until the slow call returns or is aborted
    let first = client
        .post(format!("{}/v1/chat", base))
        .json(&json!({"message": "go"}))
        .send()
        .await
        .unwrap();
    let session = first.headers()["x-session-id"].to_str().unwrap().to_string();

    let second = client
        .post(format!("{}/v1/chat", base))
        .header("X-Session-ID", &session)
        .json(&json!({"message": "again"}))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
    assert_eq!(second.headers()["x-session-id"], session.as_str());
    assert_eq!(second.headers()["x-session-status"], "resumed");
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"]["code"], "busy");

    let abort = client
        .post(format!("{}/v1/sessions/{}/abort", base, session))
        .send()
        .await
        .unwrap();
    assert_eq!(abort.status(), 202);
    let (_, done) = tokio::time::timeout(Duration::from_secs(5), read_events(first))
        .await
        .unwrap();
    assert!(done);
}

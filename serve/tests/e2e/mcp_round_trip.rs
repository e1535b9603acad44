//! MCP round-trip scenarios: tool-call fan-out and single follow-up.

use std::sync::{Arc, Mutex};

use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use weft::McpEndpoint;

use crate::common::{completion_reply, json_reply, post_chat, spawn_gateway, spawn_upstream};

/// Spawns a JSON-RPC MCP endpoint that records calls and answers with a
/// canned `result`.
async fn spawn_mcp_endpoint(result: Value) -> (String, Arc<Mutex<Vec<Value>>>) {
    let calls: Arc<Mutex<Vec<Value>>> = Arc::default();
    let state = (calls.clone(), result);
    async fn handler(
        State((calls, result)): State<(Arc<Mutex<Vec<Value>>>, Value)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let id = body.get("id").cloned().unwrap_or(Value::Null);
        calls.lock().unwrap().push(body);
        Json(json!({"jsonrpc": "2.0", "result": result, "id": id}))
    }
    let router = Router::new().route("/rpc", post(handler)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/rpc", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (url, calls)
}

fn tool_call_reply() -> axum::response::Response {
    json_reply(json!({
        "id": "chatcmpl-tools",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call-1",
                    "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"city\": \"Oslo\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }]
    }))
}

#[tokio::test]
async fn tool_call_fans_out_and_reinvokes_once() {
    let (mcp_url, mcp_calls) =
        spawn_mcp_endpoint(json!({"content": [{"type": "text", "text": "12 degrees"}]})).await;
    let (upstream, recorded) =
        spawn_upstream(vec![tool_call_reply(), completion_reply("It is 12 degrees in Oslo.")])
            .await;
    let gw = spawn_gateway(&upstream, |agent| {
        agent.mcp_endpoints = Some(vec![McpEndpoint {
            name: "lookup".into(),
            url: mcp_url.clone(),
            headers: None,
        }]);
    })
    .await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "messages": [{"role": "user", "content": "weather in Oslo?"}]}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    // The client sees the follow-up completion, not the tool_calls response.
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "It is 12 degrees in Oslo."
    );

    // Exactly one JSON-RPC tools/call hit the endpoint, with parsed arguments.
    let calls = mcp_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["jsonrpc"], "2.0");
    assert_eq!(calls[0]["method"], "tools/call");
    assert_eq!(calls[0]["params"]["name"], "lookup");
    assert_eq!(calls[0]["params"]["arguments"]["city"], "Oslo");
    assert_eq!(calls[0]["id"], "call-1");

    // Exactly two provider calls; the follow-up carries the tool message.
    let seen = recorded.bodies();
    assert_eq!(seen.len(), 2);
    let follow_up = seen[1]["messages"].as_array().unwrap();
    let tool_msg = follow_up
        .iter()
        .find(|m| m["role"] == "tool")
        .expect("tool message in follow-up");
    assert_eq!(tool_msg["tool_call_id"], "call-1");
    assert!(tool_msg["content"].as_str().unwrap().contains("12 degrees"));
    // The assistant tool_calls message precedes the tool result.
    assert!(follow_up.iter().any(|m| m["role"] == "assistant"));
}

#[tokio::test]
async fn unmatched_tool_calls_pass_through_unchanged() {
    let (upstream, recorded) = spawn_upstream(vec![tool_call_reply()]).await;
    // Endpoint registered under a different name: no round-trip.
    let (mcp_url, mcp_calls) = spawn_mcp_endpoint(json!({})).await;
    let gw = spawn_gateway(&upstream, |agent| {
        agent.mcp_endpoints = Some(vec![McpEndpoint {
            name: "translate".into(),
            url: mcp_url.clone(),
            headers: None,
        }]);
    })
    .await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
        "lookup"
    );
    assert_eq!(recorded.len(), 1);
    assert!(mcp_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_endpoint_still_gets_follow_up() {
    let (upstream, recorded) =
        spawn_upstream(vec![tool_call_reply(), completion_reply("done anyway")]).await;
    let gw = spawn_gateway(&upstream, |agent| {
        agent.mcp_endpoints = Some(vec![McpEndpoint {
            name: "lookup".into(),
            // Nothing listens here; the call fails per-endpoint.
            url: "http://127.0.0.1:1/rpc".into(),
            headers: None,
        }]);
    })
    .await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "done anyway");

    let seen = recorded.bodies();
    assert_eq!(seen.len(), 2);
    let tool_msg = seen[1]["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "tool")
        .cloned()
        .expect("tool message present despite endpoint failure");
    let content: Value = serde_json::from_str(tool_msg["content"].as_str().unwrap()).unwrap();
    assert_eq!(content["error"], "MCP call failed");
}

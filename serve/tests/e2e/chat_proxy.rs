//! Chat proxy scenarios: merge injection, pass-through, caching, traces.

use serde_json::json;

use crate::common::{
    completion_reply, json_reply, post_chat, spawn_gateway, spawn_upstream, wait_until,
};

#[tokio::test]
async fn proxies_body_and_prepends_tenant_prompt() {
    let (upstream, recorded) = spawn_upstream(vec![completion_reply("Hello there")]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there");

    // Default policy prepends the resolved tenant prompt.
    let seen = recorded.bodies();
    assert_eq!(seen.len(), 1);
    let messages = seen[0]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[0]["content"], "You are the acme support agent.");
    assert_eq!(messages[1]["content"], "hi");
    // Gateway extension fields never reach the upstream.
    assert!(seen[0].get("conversation_id").is_none());
}

#[tokio::test]
async fn second_call_is_served_from_cache() {
    let (upstream, _) =
        spawn_upstream(vec![completion_reply("one"), completion_reply("two")]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;
    let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});

    assert_eq!(post_chat(&gw.url, &gw.raw_key, &body).await.status(), 200);
    assert_eq!(gw.state.cache.len(), 1);
    assert_eq!(post_chat(&gw.url, &gw.raw_key, &body).await.status(), 200);
    assert_eq!(gw.state.cache.len(), 1);
}

#[tokio::test]
async fn upstream_error_status_passes_through() {
    let (upstream, _) = spawn_upstream(vec![axum::response::IntoResponse::into_response((
        axum::http::StatusCode::TOO_MANY_REQUESTS,
        axum::Json(json!({"error": {"message": "slow down", "type": "rate_limit_error"}})),
    ))])
    .await;
    let gw = spawn_gateway(&upstream, |_| {}).await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 429);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "slow down");
}

#[tokio::test]
async fn request_tools_survive_merge_when_agent_has_none() {
    let (upstream, recorded) = spawn_upstream(vec![completion_reply("ok")]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "user_tool"}}]
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let seen = recorded.bodies();
    assert_eq!(seen[0]["tools"][0]["function"]["name"], "user_tool");
}

#[tokio::test]
async fn agent_skills_take_precedence_in_merge() {
    let (upstream, recorded) = spawn_upstream(vec![completion_reply("ok")]).await;
    let gw = spawn_gateway(&upstream, |agent| {
        agent.skills = Some(vec![
            json!({"type": "function", "function": {"name": "search", "description": "agent search"}}),
        ]);
    })
    .await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"type": "function", "function": {"name": "search", "description": "request search"}},
                {"type": "function", "function": {"name": "calc"}}
            ]
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let tools = recorded.bodies()[0]["tools"].as_array().unwrap().clone();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0]["function"]["description"], "agent search");
    assert_eq!(tools[1]["function"]["name"], "calc");
}

#[tokio::test]
async fn completed_request_records_a_trace() {
    let (upstream, _) = spawn_upstream(vec![completion_reply("traced")]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let state = gw.state.clone();
    wait_until(|| {
        let state = state.clone();
        async move {
            state.recorder.flush().await;
            state
                .store
                .count_traces(chrono::Utc::now())
                .await
                .unwrap_or(0)
                >= 1
        }
    })
    .await;
}

#[tokio::test]
async fn unreachable_upstream_is_502() {
    let gw = spawn_gateway("http://127.0.0.1:1", |_| {}).await;
    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "upstream_unreachable");
}

#[tokio::test]
async fn scalar_json_body_passes_through() {
    let (upstream, _) = spawn_upstream(vec![json_reply(json!("plain"))]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;
    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<serde_json::Value>().await.unwrap(), json!("plain"));
}

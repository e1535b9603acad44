//! Auth middleware scenarios: 401 taxonomy, public paths, cache behavior.

use serde_json::json;
use weft::TenantStatus;

use crate::common::{completion_reply, post_chat, spawn_gateway, spawn_upstream};

#[tokio::test]
async fn health_needs_no_key() {
    let (upstream, _) = spawn_upstream(vec![]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;
    let resp = reqwest::get(format!("{}/health", gw.url)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_key_is_401() {
    let (upstream, _) = spawn_upstream(vec![]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gw.url))
        .json(&json!({"model": "m", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "missing_api_key");
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn unknown_key_is_401_invalid() {
    let (upstream, _) = spawn_upstream(vec![]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;
    let resp = post_chat(&gw.url, "wk-nope", &json!({"model": "m", "messages": []})).await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_api_key");
}

#[tokio::test]
async fn x_api_key_header_works() {
    let (upstream, _) = spawn_upstream(vec![completion_reply("hi")]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", gw.url))
        .header("x-api-key", &gw.raw_key)
        .json(&json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn inactive_tenant_is_401_after_invalidation() {
    let (upstream, _) = spawn_upstream(vec![completion_reply("a"), completion_reply("b")]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;
    let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});

    assert_eq!(post_chat(&gw.url, &gw.raw_key, &body).await.status(), 200);

    gw.state
        .store
        .set_tenant_status(gw.tenant_id, TenantStatus::Inactive)
        .await
        .unwrap();
    // Cached context still answers until the tenant's entries are dropped.
    assert_eq!(post_chat(&gw.url, &gw.raw_key, &body).await.status(), 200);

    gw.state.cache.invalidate_all_for_tenant(gw.tenant_id);
    let resp = post_chat(&gw.url, &gw.raw_key, &body).await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "tenant_inactive");
}

#[tokio::test]
async fn revoked_key_is_401_after_invalidation() {
    let (upstream, _) = spawn_upstream(vec![completion_reply("a")]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;
    let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
    assert_eq!(post_chat(&gw.url, &gw.raw_key, &body).await.status(), 200);

    let key_hash = weft::hash_api_key(&gw.raw_key);
    gw.state.store.revoke_api_key(&key_hash).await.unwrap();
    gw.state.cache.invalidate(&key_hash);

    let resp = post_chat(&gw.url, &gw.raw_key, &body).await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_api_key");
}

//! SSE pass-through scenarios: byte-exact forwarding and trace capture.

use serde_json::json;

use crate::common::{post_chat, spawn_gateway, spawn_upstream, sse_reply, wait_until};

const SSE_BODY: &[u8] = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
data: [DONE]\n\n";

#[tokio::test]
async fn downstream_bytes_match_upstream_exactly() {
    let (upstream, _) = spawn_upstream(vec![sse_reply(SSE_BODY)]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .contains("text/event-stream"));
    let bytes = resp.bytes().await.unwrap();
    assert_eq!(&bytes[..], SSE_BODY);
}

#[tokio::test]
async fn stream_completion_records_trace_with_capture() {
    let (upstream, _) = spawn_upstream(vec![sse_reply(SSE_BODY)]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    let _ = resp.bytes().await.unwrap();

    // The capture-driven trace lands after the stream is drained.
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
async fn malformed_events_still_stream_through() {
    const NOISY: &[u8] = b"data: not json at all\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n";
    let (upstream, _) = spawn_upstream(vec![sse_reply(NOISY)]).await;
    let gw = spawn_gateway(&upstream, |_| {}).await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({"model": "m", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(&resp.bytes().await.unwrap()[..], NOISY);
}

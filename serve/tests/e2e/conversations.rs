//! Conversation scenarios: context injection, persistence, snapshots.

use serde_json::json;

use crate::common::{completion_reply, post_chat, spawn_gateway, spawn_upstream, wait_until};

#[tokio::test]
async fn history_is_injected_on_the_next_turn() {
    let (upstream, recorded) = spawn_upstream(vec![
        completion_reply("Nice to meet you, Ada."),
        completion_reply("Your name is Ada."),
    ])
    .await;
    let gw = spawn_gateway(&upstream, |agent| {
        agent.conversations_enabled = true;
    })
    .await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({
            "model": "m",
            "conversation_id": "chat-1",
            "messages": [{"role": "user", "content": "My name is Ada."}]
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    // Persistence is off the response path; wait for the pair to land.
    let state = gw.state.clone();
    let tenant_id = gw.tenant_id;
    wait_until(|| {
        let state = state.clone();
        async move {
            let (conversation, _) = state
                .conversations
                .get_or_create_conversation(tenant_id, None, "chat-1", uuid::Uuid::new_v4())
                .await
                .unwrap();
            state
                .conversations
                .load_context(tenant_id, conversation.id)
                .await
                .map(|ctx| ctx.messages.len() == 2)
                .unwrap_or(false)
        }
    })
    .await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({
            "model": "m",
            "conversation_id": "chat-1",
            "messages": [{"role": "user", "content": "What is my name?"}]
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let seen = recorded.bodies();
    assert_eq!(seen.len(), 2);
    let messages = seen[1]["messages"].as_array().unwrap();
    // system prompt, injected user+assistant turn, then the new question.
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["content"], "My name is Ada.");
    assert_eq!(messages[2]["content"], "Nice to meet you, Ada.");
    assert_eq!(messages[3]["content"], "What is my name?");
}

#[tokio::test]
async fn partition_scopes_conversations() {
    let (upstream, recorded) = spawn_upstream(vec![
        completion_reply("answer one"),
        completion_reply("answer two"),
    ])
    .await;
    let gw = spawn_gateway(&upstream, |agent| {
        agent.conversations_enabled = true;
    })
    .await;

    for partition in ["proj-a", "proj-b"] {
        let resp = post_chat(
            &gw.url,
            &gw.raw_key,
            &json!({
                "model": "m",
                "conversation_id": "chat-1",
                "partition_id": partition,
                "messages": [{"role": "user", "content": "hello"}]
            }),
        )
        .await;
        assert_eq!(resp.status(), 200);
    }

    // Both requests went out stateless: same external id, different
    // partitions, so neither saw the other's history.
    for body in recorded.bodies() {
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }
}

#[tokio::test]
async fn crossing_the_token_limit_creates_a_snapshot() {
    let (upstream, recorded) = spawn_upstream(vec![
        completion_reply("A long and winding first answer about many things."),
        completion_reply("conversation about names and weather"),
        completion_reply("second answer"),
    ])
    .await;
    let gw = spawn_gateway(&upstream, |agent| {
        agent.conversations_enabled = true;
        // Tiny limit: the first stored pair crosses it.
        agent.conversation_token_limit = 10;
        agent.conversation_summary_model = Some("gpt-4o-mini".into());
    })
    .await;

    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({
            "model": "m",
            "conversation_id": "chat-1",
            "messages": [{"role": "user", "content": "Tell me about the weather in detail."}]
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    // Wait for the out-of-band summarization + snapshot.
    let state = gw.state.clone();
    let tenant_id = gw.tenant_id;
    wait_until(|| {
        let state = state.clone();
        async move {
            let (conversation, _) = state
                .conversations
                .get_or_create_conversation(tenant_id, None, "chat-1", uuid::Uuid::new_v4())
                .await
                .unwrap();
            state
                .conversations
                .load_context(tenant_id, conversation.id)
                .await
                .map(|ctx| {
                    ctx.latest_snapshot_summary.is_some() && ctx.messages.is_empty()
                })
                .unwrap_or(false)
        }
    })
    .await;

    // The summarization call used the configured summary model.
    let summarize_call = recorded
        .bodies()
        .into_iter()
        .find(|b| b["model"] == "gpt-4o-mini")
        .expect("summarization request reached the provider");
    assert!(summarize_call["messages"][1]["content"]
        .as_str()
        .unwrap()
        .contains("Tell me about the weather"));

    // The next turn is grounded on the summary, not the raw history.
    let resp = post_chat(
        &gw.url,
        &gw.raw_key,
        &json!({
            "model": "m",
            "conversation_id": "chat-1",
            "messages": [{"role": "user", "content": "And tomorrow?"}]
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let last = recorded.bodies().pop().unwrap();
    let injected = last["messages"].as_array().unwrap().clone();
    let summary_msg = injected
        .iter()
        .find(|m| {
            m["role"] == "system"
                && m["content"]
                    .as_str()
                    .unwrap_or("")
                    .starts_with("Previous conversation summary:")
        })
        .expect("summary message injected");
    assert!(summary_msg["content"]
        .as_str()
        .unwrap()
        .contains("conversation about names and weather"));
}

#[tokio::test]
async fn conversations_disabled_ignores_conversation_id() {
    let (upstream, recorded) = spawn_upstream(vec![
        completion_reply("one"),
        completion_reply("two"),
    ])
    .await;
    let gw = spawn_gateway(&upstream, |_| {}).await;

    for _ in 0..2 {
        let resp = post_chat(
            &gw.url,
            &gw.raw_key,
            &json!({
                "model": "m",
                "conversation_id": "chat-1",
                "messages": [{"role": "user", "content": "hi"}]
            }),
        )
        .await;
        assert_eq!(resp.status(), 200);
    }
    // No history ever injected; the extension field is still stripped.
    for body in recorded.bodies() {
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert!(body.get("conversation_id").is_none());
    }
}

//! The chat proxy handler.
//!
//! Per request: strip gateway extensions, apply the merge engine, inject
//! conversation context, dispatch to the resolved provider, then either pipe
//! SSE bytes straight through (capturing a parseable copy on the side) or run
//! the MCP tool round-trip on the JSON response. Trace recording and
//! conversation persistence happen off the critical path.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
    Extension, Json,
};
use serde_json::{json, Value};
use uuid::Uuid;
use weft::{
    merge,
    provider::forwardable_headers,
    provider_for, sse, ProviderKind, ProxyRequest, ProxyResponse, TenantContext, TraceDraft,
};

use crate::app::AppState;
use crate::response::{internal_error, upstream_unreachable};

const CHAT_PATH: &str = "/v1/chat/completions";

/// Gateway extension fields stripped from the body before proxying.
struct ConversationRef {
    conversation: Option<String>,
    partition: Option<String>,
}

/// An active conversation for this request, carried into the post-response
/// persistence task.
#[derive(Clone)]
struct ConversationSession {
    conversation_id: Uuid,
    user_text: String,
}

pub(crate) async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<TenantContext>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let received_at = Instant::now();
    let trace_id = Uuid::new_v4();
    let request_id = Uuid::now_v7().to_string();

    let mut body = body;
    let conversation_ref = extract_conversation_ref(&mut body);
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut outgoing = merge::apply(&body, &context);

    // Conversation context injection. Failures here degrade to a stateless
    // request: liveness over durability.
    let mut session = None;
    if context.agent_config.conversations_enabled {
        if let Some(conversation_ext) = conversation_ref.conversation.as_deref() {
            match resolve_conversation(
                &state,
                &context,
                conversation_ext,
                conversation_ref.partition.as_deref(),
            )
            .await
            {
                Ok((conversation_id, injection)) => {
                    inject_messages(&mut outgoing, injection);
                    if let Some(user_text) = last_user_text(&body) {
                        session = Some(ConversationSession {
                            conversation_id,
                            user_text,
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(
                        conversation = conversation_ext,
                        "conversation resolution failed, proxying statelessly: {}",
                        e
                    );
                }
            }
        }
    }

    let provider_config = context.resolved_provider_config.clone().unwrap_or_default();
    let provider = match provider_for(state.http.clone(), &provider_config, &state.fallback) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::error!(agent = %context.agent_id, "no usable provider: {}", e);
            return internal_error(&format!("provider not configured: {e}"));
        }
    };
    let provider_name = provider_kind_name(provider_config.provider);

    let proxy_request = ProxyRequest {
        path: CHAT_PATH.to_string(),
        body: outgoing.clone(),
        headers: forwardable_headers(
            headers
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        ),
    };

    let dispatched_at = Instant::now();
    let overhead_ms = duration_ms(received_at, dispatched_at);

    let response = match provider.proxy(proxy_request.clone()).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(provider = provider_name, "upstream dispatch failed: {}", e);
            state.recorder.record(TraceDraft {
                id: trace_id,
                tenant_id: context.tenant_id,
                request_id,
                model,
                provider: Some(provider_name.to_string()),
                endpoint: CHAT_PATH.to_string(),
                request_body: outgoing,
                response_body: None,
                latency_ms: duration_ms(received_at, Instant::now()),
                ttfb_ms: None,
                gateway_overhead_ms: Some(overhead_ms),
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
                status_code: None,
            });
            return upstream_unreachable(&e.to_string());
        }
    };

    match response {
        ProxyResponse::Stream {
            status,
            headers: upstream_headers,
            stream,
        } => {
            let recorder = state.recorder.clone();
            let persist_state = state.clone();
            let persist_context = context.clone();
            let request_body = outgoing.clone();
            let pipe = sse::passthrough(stream, move |capture| {
                let ttfb_ms = capture
                    .first_chunk_at
                    .map(|at| at.saturating_duration_since(dispatched_at).as_millis() as i64);
                let prompt_tokens = usage_i64(capture.usage.as_ref(), "prompt_tokens");
                let completion_tokens = usage_i64(capture.usage.as_ref(), "completion_tokens");
                let total_tokens = usage_i64(capture.usage.as_ref(), "total_tokens");
                let content = capture.content;
                recorder.record(TraceDraft {
                    id: trace_id,
                    tenant_id: persist_context.tenant_id,
                    request_id,
                    model,
                    provider: Some(provider_name.to_string()),
                    endpoint: CHAT_PATH.to_string(),
                    request_body,
                    response_body: Some(json!({
                        "content": content.clone(),
                        "chunk_count": capture.chunks.len(),
                        "usage": capture.usage,
                    })),
                    latency_ms: duration_ms(received_at, Instant::now()),
                    ttfb_ms,
                    gateway_overhead_ms: Some(overhead_ms),
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                    status_code: Some(status),
                });
                if let Some(session) = session {
                    tokio::spawn(persist_conversation(
                        persist_state,
                        persist_context,
                        session,
                        content,
                        trace_id,
                    ));
                }
            });
            proxied_response(status, &upstream_headers, Body::from_stream(pipe))
        }

        ProxyResponse::Json {
            status,
            headers: upstream_headers,
            body: response_body,
        } => {
            let (status, upstream_headers, final_body) = if (200..300).contains(&status) {
                match state
                    .mcp
                    .run(
                        provider.as_ref(),
                        &proxy_request,
                        &context.resolved_mcp_endpoints,
                        status,
                        upstream_headers,
                        response_body,
                    )
                    .await
                {
                    Ok(outcome) => {
                        if outcome.did_call_mcp {
                            tracing::debug!(trace = %trace_id, "mcp round-trip completed");
                        }
                        (outcome.status, outcome.headers, outcome.body)
                    }
                    Err(e) => {
                        tracing::error!("mcp follow-up failed: {}", e);
                        return upstream_unreachable(&e.to_string());
                    }
                }
            } else {
                (status, upstream_headers, response_body)
            };

            let usage = final_body.get("usage").filter(|u| !u.is_null()).cloned();
            state.recorder.record(TraceDraft {
                id: trace_id,
                tenant_id: context.tenant_id,
                request_id,
                model,
                provider: Some(provider_name.to_string()),
                endpoint: CHAT_PATH.to_string(),
                request_body: outgoing,
                response_body: Some(final_body.clone()),
                latency_ms: duration_ms(received_at, Instant::now()),
                ttfb_ms: None,
                gateway_overhead_ms: Some(overhead_ms),
                prompt_tokens: usage_i64(usage.as_ref(), "prompt_tokens"),
                completion_tokens: usage_i64(usage.as_ref(), "completion_tokens"),
                total_tokens: usage_i64(usage.as_ref(), "total_tokens"),
                status_code: Some(status),
            });

            if let Some(session) = session {
                if let Some(assistant_text) = assistant_text(&final_body) {
                    tokio::spawn(persist_conversation(
                        state.clone(),
                        context.clone(),
                        session,
                        assistant_text,
                        trace_id,
                    ));
                }
            }

            match serde_json::to_vec(&final_body) {
                Ok(bytes) => proxied_response(status, &upstream_headers, Body::from(bytes)),
                Err(e) => internal_error(&format!("response serialization failed: {e}")),
            }
        }

        ProxyResponse::Text {
            status,
            headers: upstream_headers,
            body: text,
        } => {
            state.recorder.record(TraceDraft {
                id: trace_id,
                tenant_id: context.tenant_id,
                request_id,
                model,
                provider: Some(provider_name.to_string()),
                endpoint: CHAT_PATH.to_string(),
                request_body: outgoing,
                response_body: Some(Value::String(text.clone())),
                latency_ms: duration_ms(received_at, Instant::now()),
                ttfb_ms: None,
                gateway_overhead_ms: Some(overhead_ms),
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
                status_code: Some(status),
            });
            proxied_response(status, &upstream_headers, Body::from(text))
        }
    }
}

/// Builds the pass-through response: upstream status and surviving headers,
/// gateway-supplied body.
fn proxied_response(status: u16, headers: &[(String, String)], body: Body) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(body)
        .unwrap_or_else(|e| internal_error(&format!("response build failed: {e}")))
}

fn duration_ms(from: Instant, to: Instant) -> i64 {
    to.saturating_duration_since(from).as_millis() as i64
}

fn provider_kind_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "openai",
        ProviderKind::Azure => "azure",
        ProviderKind::Ollama => "ollama",
    }
}

fn usage_i64(usage: Option<&Value>, field: &str) -> Option<i64> {
    usage?.get(field)?.as_i64()
}

/// Removes the gateway's custom extension fields from the body.
fn extract_conversation_ref(body: &mut Value) -> ConversationRef {
    let mut reference = ConversationRef {
        conversation: None,
        partition: None,
    };
    if let Some(obj) = body.as_object_mut() {
        reference.conversation = obj
            .remove("conversation_id")
            .and_then(|v| v.as_str().map(str::to_string));
        reference.partition = obj
            .remove("partition_id")
            .and_then(|v| v.as_str().map(str::to_string));
    }
    reference
}

/// Resolves partition + conversation and loads the injectable context.
async fn resolve_conversation(
    state: &Arc<AppState>,
    context: &TenantContext,
    conversation_ext: &str,
    partition_ext: Option<&str>,
) -> Result<(Uuid, Vec<Value>), weft::ConversationError> {
    let partition_id = match partition_ext {
        Some(ext) => Some(
            state
                .conversations
                .get_or_create_partition(context.tenant_id, ext)
                .await?
                .id,
        ),
        None => None,
    };
    let (conversation, _is_new) = state
        .conversations
        .get_or_create_conversation(
            context.tenant_id,
            partition_id,
            conversation_ext,
            context.agent_id,
        )
        .await?;
    let loaded = state
        .conversations
        .load_context(context.tenant_id, conversation.id)
        .await?;
    let injection = state.conversations.build_injection(&loaded);
    Ok((conversation.id, injection))
}

/// Inserts injected context after any leading `system` messages so prompt
/// policies and history compose in provider order.
fn inject_messages(body: &mut Value, injection: Vec<Value>) {
    if injection.is_empty() {
        return;
    }
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let position = messages
        .iter()
        .position(|m| m.get("role").and_then(Value::as_str) != Some("system"))
        .unwrap_or(messages.len());
    messages.splice(position..position, injection);
}

/// Text of the last `user` message; content may be a string or an array of
/// parts.
fn last_user_text(body: &Value) -> Option<String> {
    body.get("messages")?
        .as_array()?
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .and_then(|m| m.get("content"))
        .map(content_text)
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn assistant_text(body: &Value) -> Option<String> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")
        .map(content_text)
}

/// Post-response persistence: append the user/assistant pair, then check the
/// snapshot threshold and summarize out-of-band when crossed. Every failure
/// is logged and swallowed; nothing here can reach the client.
async fn persist_conversation(
    state: Arc<AppState>,
    context: TenantContext,
    session: ConversationSession,
    assistant_text: String,
    trace_id: Uuid,
) {
    if let Err(e) = state
        .conversations
        .store_messages(
            context.tenant_id,
            session.conversation_id,
            &session.user_text,
            &assistant_text,
            Some(trace_id),
        )
        .await
    {
        tracing::error!(conversation = %session.conversation_id, "message persistence failed: {}", e);
        return;
    }

    let loaded = match state
        .conversations
        .load_context(context.tenant_id, session.conversation_id)
        .await
    {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(conversation = %session.conversation_id, "context reload failed: {}", e);
            return;
        }
    };
    let limit = context.agent_config.conversation_token_limit as i64;
    if loaded.token_estimate < limit {
        return;
    }

    let Some(summary) = summarize(&state, &context, &loaded).await else {
        return;
    };
    match state
        .conversations
        .create_snapshot(
            context.tenant_id,
            session.conversation_id,
            &summary,
            loaded.messages.len() as i64,
        )
        .await
    {
        Ok(snapshot_id) => {
            tracing::info!(
                conversation = %session.conversation_id,
                snapshot = %snapshot_id,
                archived = loaded.messages.len(),
                "conversation snapshot created"
            );
        }
        Err(e) => {
            tracing::error!(conversation = %session.conversation_id, "snapshot insert failed: {}", e);
        }
    }
}

/// One summarization call against the agent's provider using
/// `conversation_summary_model` (the agent's regular provider config
/// otherwise). Returns `None` on any failure.
async fn summarize(
    state: &Arc<AppState>,
    context: &TenantContext,
    loaded: &weft::ConversationContext,
) -> Option<String> {
    let Some(model) = context
        .agent_config
        .conversation_summary_model
        .clone()
    else {
        tracing::warn!(
            agent = %context.agent_id,
            "token limit reached but no conversation_summary_model configured, skipping snapshot"
        );
        return None;
    };

    let provider_config = context.resolved_provider_config.clone().unwrap_or_default();
    let provider = provider_for(state.http.clone(), &provider_config, &state.fallback)
        .map_err(|e| tracing::error!("summarization provider unavailable: {}", e))
        .ok()?;

    let mut transcript = String::new();
    if let Some(previous) = &loaded.latest_snapshot_summary {
        transcript.push_str("Previous summary:\n");
        transcript.push_str(previous);
        transcript.push_str("\n\n");
    }
    for message in &loaded.messages {
        transcript.push_str(&message.role);
        transcript.push_str(": ");
        transcript.push_str(&message.content);
        transcript.push('\n');
    }

    let body = json!({
        "model": model,
        "stream": false,
        "messages": [
            {
                "role": "system",
                "content": "Summarize the conversation below. Keep facts, decisions, names, and \
                            unresolved questions; drop pleasantries. Answer with the summary only."
            },
            {"role": "user", "content": transcript}
        ]
    });
    let response = provider
        .proxy(ProxyRequest {
            path: CHAT_PATH.to_string(),
            body,
            headers: Vec::new(),
        })
        .await;
    match response {
        Ok(ProxyResponse::Json { status, body, .. }) if (200..300).contains(&status) => {
            assistant_text(&body).filter(|s| !s.is_empty())
        }
        Ok(other) => {
            tracing::error!("summarization returned status {}", other.status());
            None
        }
        Err(e) => {
            tracing::error!("summarization call failed: {}", e);
            None
        }
    }
}

//! Shared helpers for e2e tests: gateway spawn, seeding, and mock upstreams.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use config::{Mode, Settings};
use serde_json::Value;
use serve::AppState;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use uuid::Uuid;
use weft::{Agent, ProviderConfig, Tenant, TenantStatus};

/// 64 hex chars: a fixed 32-byte master key for tests.
pub const TEST_MASTER_KEY: &str =
    "0101010101010101010101010101010101010101010101010101010101010101";

pub fn test_settings(db_path: &std::path::Path) -> Settings {
    Settings {
        mode: Mode::Development,
        addr: "127.0.0.1:0".into(),
        db_path: db_path.to_path_buf(),
        db_pool_size: 4,
        cache_capacity: 100,
        master_key: Some(TEST_MASTER_KEY.into()),
        key_version: 1,
        openai_api_key: Some("sk-env-fallback".into()),
        azure_api_key: None,
        ollama_base_url: None,
        portal_jwt_secret: None,
        admin_jwt_secret: None,
    }
}

/// A seeded, running gateway plus the credentials to call it.
pub struct Gateway {
    pub state: Arc<AppState>,
    pub url: String,
    pub raw_key: String,
    pub tenant_id: Uuid,
    _db: NamedTempFile,
}

/// Spawns the gateway with one tenant (system prompt "You are the acme
/// support agent."), one agent pointed at `provider_base`, and one API key.
/// `configure` can adjust the agent row before insert.
pub async fn spawn_gateway(provider_base: &str, configure: impl FnOnce(&mut Agent)) -> Gateway {
    let db = NamedTempFile::new().unwrap();
    let state = AppState::from_settings(&test_settings(db.path())).await.unwrap();

    let tenant_id = Uuid::new_v4();
    let agent_id = Uuid::new_v4();
    state
        .store
        .insert_tenant(&Tenant {
            id: tenant_id,
            name: "acme".into(),
            parent_id: None,
            provider_config: None,
            system_prompt: Some("You are the acme support agent.".into()),
            skills: None,
            mcp_endpoints: None,
            status: TenantStatus::Active,
        })
        .await
        .unwrap();

    let mut agent = Agent {
        id: agent_id,
        tenant_id,
        name: "support".into(),
        provider_config: Some(ProviderConfig {
            base_url: Some(provider_base.to_string()),
            api_key: Some("sk-upstream".into()),
            ..ProviderConfig::default()
        }),
        system_prompt: None,
        skills: None,
        mcp_endpoints: None,
        merge_policies: None,
        conversations_enabled: false,
        conversation_token_limit: 4000,
        conversation_summary_model: None,
    };
    configure(&mut agent);
    state.store.insert_agent(&agent).await.unwrap();

    let raw_key = format!("wk-test-{}", Uuid::new_v4().simple());
    state
        .store
        .create_api_key(tenant_id, agent_id, &raw_key)
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(serve::run_serve_on_listener(listener, state.clone()));

    Gateway {
        state,
        url,
        raw_key,
        tenant_id,
        _db: db,
    }
}

/// Requests observed by a mock upstream, in arrival order.
#[derive(Clone, Default)]
pub struct Recorded(pub Arc<Mutex<Vec<Value>>>);

impl Recorded {
    pub fn bodies(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

#[derive(Clone)]
struct UpstreamState {
    recorded: Recorded,
    replies: Arc<Mutex<VecDeque<Response<Body>>>>,
}

async fn upstream_handler(
    State(state): State<UpstreamState>,
    Json(body): Json<Value>,
) -> Response {
    state.recorded.0.lock().unwrap().push(body);
    state
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| {
            Json(serde_json::json!({"error": "mock upstream out of replies"})).into_response()
        })
}

/// Spawns a mock chat-completions upstream that answers with `replies` in
/// order (the last reply is not repeated; running out returns an error body).
pub async fn spawn_upstream(replies: Vec<Response<Body>>) -> (String, Recorded) {
    let recorded = Recorded::default();
    let state = UpstreamState {
        recorded: recorded.clone(),
        replies: Arc::new(Mutex::new(replies.into())),
    };
    let router = Router::new()
        .route("/v1/chat/completions", post(upstream_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (url, recorded)
}

/// A plain JSON 200 reply.
pub fn json_reply(body: Value) -> Response<Body> {
    Json(body).into_response()
}

/// A canned assistant completion.
pub fn completion_reply(content: &str) -> Response<Body> {
    json_reply(serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
    }))
}

/// An SSE reply with the given raw bytes.
pub fn sse_reply(bytes: &'static [u8]) -> Response<Body> {
    Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(bytes))
        .unwrap()
}

/// POSTs a chat body to the gateway with the given key.
pub async fn post_chat(url: &str, key: &str, body: &Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{url}/v1/chat/completions"))
        .bearer_auth(key)
        .json(body)
        .send()
        .await
        .unwrap()
}

/// Polls `check` every 20 ms for up to 5 s.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}

//! Axum app: shared state and router.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use config::{Mode, Settings};
use weft::{
    ConversationManager, CryptoService, FallbackCredentials, McpRoundTrip, Resolver, SqliteStore,
    TenantCache, TraceRecorder,
};

use crate::auth::require_api_key;
use crate::chat::chat_completions;

/// Collaborators bound once at startup and shared by every request handler.
pub struct AppState {
    pub cache: TenantCache,
    pub resolver: Resolver,
    pub store: Arc<SqliteStore>,
    pub crypto: Arc<CryptoService>,
    pub conversations: ConversationManager,
    pub recorder: TraceRecorder,
    pub mcp: McpRoundTrip,
    pub http: reqwest::Client,
    pub fallback: FallbackCredentials,
}

impl AppState {
    /// Wires the full collaborator set from settings. Fails on an unusable
    /// master key or database path.
    pub async fn from_settings(
        settings: &Settings,
    ) -> Result<Arc<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let crypto = match &settings.master_key {
            Some(key) => Arc::new(CryptoService::new(key, settings.key_version)?),
            None => {
                // Settings::from_env already rejects this in production mode.
                debug_assert!(settings.mode != Mode::Production);
                tracing::warn!(
                    "ENCRYPTION_MASTER_KEY not set; using an ephemeral key (development only, \
                     stored content will be unreadable after restart)"
                );
                Arc::new(CryptoService::ephemeral(settings.key_version))
            }
        };
        let store = Arc::new(
            SqliteStore::with_pool_size(&settings.db_path, settings.db_pool_size).await?,
        );
        let http = reqwest::Client::new();
        Ok(Arc::new(AppState {
            cache: TenantCache::with_capacity(settings.cache_capacity),
            resolver: Resolver::new(store.clone()),
            conversations: ConversationManager::new(store.clone(), crypto.clone()),
            recorder: TraceRecorder::start(store.clone(), crypto.clone()),
            mcp: McpRoundTrip::new(http.clone()),
            store,
            crypto,
            http,
            fallback: FallbackCredentials {
                openai_api_key: settings.openai_api_key.clone(),
                azure_api_key: settings.azure_api_key.clone(),
                ollama_base_url: settings.ollama_base_url.clone(),
            },
        }))
    }
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

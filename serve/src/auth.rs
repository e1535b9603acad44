//! API-key auth middleware: extract, resolve via cache, attach context.
//!
//! Runs before every route; public prefixes pass straight through. The raw
//! key comes from `Authorization: Bearer <key>` or `x-api-key`, is hashed,
//! and hits the tenant cache first; a miss resolves against the store and
//! populates the cache. Failures short-circuit with a 401 JSON envelope.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use weft::{hash_api_key, ResolveError};

use crate::app::AppState;
use crate::response::{auth_error, internal_error};

/// Paths (and prefixes) that skip API-key auth. Admin/portal/dashboard carry
/// their own JWT auth in the delegated handlers.
const PUBLIC_PREFIXES: &[&str] = &["/dashboard", "/v1/admin", "/v1/portal"];
const PUBLIC_PATHS: &[&str] = &["/health", "/favicon.ico"];

pub(crate) fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path)
        || PUBLIC_PREFIXES
            .iter()
            .any(|prefix| path.starts_with(prefix))
}

/// Pulls the raw key out of `Authorization: Bearer` or `x-api-key`.
fn extract_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(key) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")) {
            let key = key.trim();
            if !key.is_empty() {
                return Some(key);
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

pub(crate) async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if is_public_path(request.uri().path()) {
        return next.run(request).await;
    }

    let Some(raw_key) = extract_key(request.headers()) else {
        return auth_error("missing_api_key", "missing API key");
    };
    let key_hash = hash_api_key(raw_key);

    let context = match state.cache.get(&key_hash) {
        Some(context) => context,
        None => match state.resolver.resolve(&key_hash).await {
            Ok(context) => {
                state.cache.set(key_hash, context.clone());
                context
            }
            Err(ResolveError::InvalidKey) | Err(ResolveError::Dangling(_)) => {
                return auth_error("invalid_api_key", "invalid API key");
            }
            Err(ResolveError::TenantInactive) => {
                return auth_error("tenant_inactive", "tenant is inactive");
            }
            Err(ResolveError::Store(e)) => {
                tracing::error!("auth store lookup failed: {}", e);
                return internal_error("authentication backend unavailable");
            }
        },
    };

    request.extensions_mut().insert(context);
    next.run(request).await
}

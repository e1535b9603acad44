//! HTTP error envelopes in the OpenAI error shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// 401 with an OpenAI-style error body; `code` is the auth taxonomy value
/// (`missing_api_key`, `invalid_api_key`, `tenant_inactive`).
pub(crate) fn auth_error(code: &str, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": message,
                "type": "authentication_error",
                "code": code,
            }
        })),
    )
        .into_response()
}

/// 500 for faults in the gateway itself (never for upstream statuses, which
/// pass through verbatim).
pub(crate) fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": {
                "message": message,
                "type": "server_error",
                "code": serde_json::Value::Null,
            }
        })),
    )
        .into_response()
}

/// 502 when the upstream could not be reached at all.
pub(crate) fn upstream_unreachable(detail: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": {
                "message": format!("upstream request failed: {detail}"),
                "type": "server_error",
                "code": "upstream_unreachable",
            }
        })),
    )
        .into_response()
}

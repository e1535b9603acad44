//! Upstream provider adapters behind one [`Provider`] contract.
//!
//! The gateway forwards the (merged) chat-completion body to the upstream
//! selected by `resolved_provider_config.provider` and hands back either a
//! parsed JSON/text response or a raw byte stream when the upstream answers
//! with `text/event-stream`. Status, headers, and body pass through verbatim;
//! only Azure error envelopes are normalized to the OpenAI shape.

mod azure;
mod openai;

pub use azure::AzureProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::tenant::{ProviderConfig, ProviderKind};

/// Default OpenAI API base URL when a config carries no `base_url`.
pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com";
/// Default Ollama base URL (its OpenAI-compatible surface lives under /v1).
pub const OLLAMA_DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Errors from provider adapters. Upstream non-2xx responses are not errors;
/// they pass through as responses with their original status.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider transport: {0}")]
    Transport(String),
    #[error("provider config incomplete: {0}")]
    Incomplete(&'static str),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

/// Request forwarded to an upstream: inbound path, rewritten body, and the
/// surviving inbound headers.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Inbound request path (e.g. `/v1/chat/completions`), appended to the
    /// adapter's base URL for OpenAI-compatible upstreams.
    pub path: String,
    pub body: Value,
    /// Already-filtered headers to forward; see [`forwardable_headers`].
    pub headers: Vec<(String, String)>,
}

/// Upstream answer: JSON, raw text, or an SSE byte stream.
pub enum ProxyResponse {
    Json {
        status: u16,
        headers: Vec<(String, String)>,
        body: Value,
    },
    Text {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    Stream {
        status: u16,
        headers: Vec<(String, String)>,
        stream: BoxStream<'static, Result<Bytes, ProviderError>>,
    },
}

impl ProxyResponse {
    pub fn status(&self) -> u16 {
        match self {
            ProxyResponse::Json { status, .. }
            | ProxyResponse::Text { status, .. }
            | ProxyResponse::Stream { status, .. } => *status,
        }
    }
}

/// One upstream adapter. Implementations must not retry and must surface
/// upstream statuses untouched; cancellation is inherited from the caller
/// (dropping the future aborts the upstream read).
#[async_trait]
pub trait Provider: Send + Sync {
    async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse, ProviderError>;
}

/// Provider credentials from the environment, used when the resolved config
/// omits its own.
#[derive(Debug, Clone, Default)]
pub struct FallbackCredentials {
    pub openai_api_key: Option<String>,
    pub azure_api_key: Option<String>,
    pub ollama_base_url: Option<String>,
}

/// Builds the adapter for a resolved provider config.
///
/// # Errors
///
/// [`ProviderError::Incomplete`] when the config (plus fallbacks) lacks a
/// required credential or endpoint.
pub fn provider_for(
    client: reqwest::Client,
    config: &ProviderConfig,
    fallback: &FallbackCredentials,
) -> Result<Box<dyn Provider>, ProviderError> {
    match config.provider {
        ProviderKind::OpenAi => {
            let api_key = config
                .api_key
                .clone()
                .or_else(|| fallback.openai_api_key.clone())
                .ok_or(ProviderError::Incomplete("openai api key"))?;
            let base_url = config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_BASE_URL.to_string());
            Ok(Box::new(OpenAiProvider::new(client, base_url, Some(api_key))))
        }
        ProviderKind::Ollama => {
            let base_url = config
                .base_url
                .clone()
                .or_else(|| fallback.ollama_base_url.clone())
                .unwrap_or_else(|| OLLAMA_DEFAULT_BASE_URL.to_string());
            // Local Ollama needs no key; one may still be configured for proxies.
            Ok(Box::new(OpenAiProvider::new(
                client,
                base_url,
                config.api_key.clone(),
            )))
        }
        ProviderKind::Azure => {
            let api_key = config
                .api_key
                .clone()
                .or_else(|| fallback.azure_api_key.clone())
                .ok_or(ProviderError::Incomplete("azure api key"))?;
            let endpoint = config
                .endpoint
                .clone()
                .ok_or(ProviderError::Incomplete("azure endpoint"))?;
            let deployment = config
                .deployment
                .clone()
                .ok_or(ProviderError::Incomplete("azure deployment"))?;
            let api_version = config
                .api_version
                .clone()
                .unwrap_or_else(|| azure::DEFAULT_API_VERSION.to_string());
            Ok(Box::new(AzureProvider::new(
                client,
                endpoint,
                deployment,
                api_version,
                api_key,
            )))
        }
    }
}

/// Headers that never cross the proxy: hop-by-hop, browser-only, and the
/// gateway's own credentials (the adapter sets upstream auth itself).
const DROPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "origin",
    "referer",
    "authorization",
    "x-api-key",
];

/// Filters inbound headers down to the forwardable set.
pub fn forwardable_headers<'a, I>(headers: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !DROPPED_HEADERS.contains(&lower.as_str())
        })
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Collects response headers worth passing downstream, dropping hop-by-hop
/// fields that no longer describe the gateway's response.
pub(crate) fn response_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !matches!(
                name.as_str(),
                "content-length" | "transfer-encoding" | "connection"
            )
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Shared adapter plumbing: sends the request and classifies the response as
/// stream / JSON / text by `Content-Type`.
pub(crate) async fn dispatch(
    builder: reqwest::RequestBuilder,
    body: &Value,
) -> Result<ProxyResponse, ProviderError> {
    let response = builder.json(body).send().await?;
    let status = response.status().as_u16();
    let headers = response_headers(response.headers());
    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    if is_sse {
        let stream = futures_util::StreamExt::map(response.bytes_stream(), |chunk| {
            chunk.map_err(ProviderError::from)
        });
        return Ok(ProxyResponse::Stream {
            status,
            headers,
            stream: Box::pin(stream),
        });
    }

    let text = response.text().await?;
    match serde_json::from_str::<Value>(&text) {
        Ok(body) => Ok(ProxyResponse::Json {
            status,
            headers,
            body,
        }),
        Err(_) => Ok(ProxyResponse::Text {
            status,
            headers,
            body: text,
        }),
    }
}

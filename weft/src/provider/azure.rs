//! Azure OpenAI adapter: deployment-scoped URL, `api-key` header, and error
//! envelopes normalized to the OpenAI `{error:{message,type,code,param}}`
//! shape so clients see one error format regardless of upstream.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{dispatch, Provider, ProviderError, ProxyRequest, ProxyResponse};

/// API version sent when the resolved config does not pin one.
pub const DEFAULT_API_VERSION: &str = "2024-06-01";

pub struct AzureProvider {
    client: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_version: String,
    api_key: String,
}

impl AzureProvider {
    pub fn new(
        client: reqwest::Client,
        endpoint: String,
        deployment: String,
        api_version: String,
        api_key: String,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            deployment,
            api_version,
            api_key,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

#[async_trait]
impl Provider for AzureProvider {
    async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse, ProviderError> {
        let mut builder = self.client.post(self.url());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = builder.header("api-key", &self.api_key);
        let response = dispatch(builder, &request.body).await?;

        // Non-2xx JSON/text bodies get the OpenAI error envelope; streams and
        // success responses pass through untouched.
        Ok(match response {
            ProxyResponse::Json {
                status,
                headers,
                body,
            } if !(200..300).contains(&status) => ProxyResponse::Json {
                status,
                headers,
                body: normalize_error(status, body),
            },
            ProxyResponse::Text {
                status,
                headers,
                body,
            } if !(200..300).contains(&status) => ProxyResponse::Json {
                status,
                headers,
                body: normalize_error(status, Value::String(body)),
            },
            other => other,
        })
    }
}

/// OpenAI error `type` for an HTTP status.
fn error_type_for_status(status: u16) -> &'static str {
    match status {
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        500..=599 => "server_error",
        _ => "invalid_request_error",
    }
}

/// Rewrites an Azure error body into the OpenAI envelope, keeping whatever
/// message/code detail the upstream provided.
fn normalize_error(status: u16, body: Value) -> Value {
    let upstream = body.get("error").cloned().unwrap_or(body);
    let message = upstream
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| upstream.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("upstream error (status {status})"));
    let code = upstream.get("code").cloned().unwrap_or(Value::Null);
    let param = upstream.get("param").cloned().unwrap_or(Value::Null);
    json!({
        "error": {
            "message": message,
            "type": error_type_for_status(status),
            "code": code,
            "param": param,
        }
    })
}

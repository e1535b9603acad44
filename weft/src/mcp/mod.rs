//! MCP tool-call round-trip for non-streaming responses.
//!
//! When an upstream JSON response carries `choices[0].message.tool_calls`,
//! each call whose name matches a resolved MCP endpoint is POSTed to that
//! endpoint as JSON-RPC 2.0 `tools/call` (in parallel, bounded timeout).
//! Results become `{role:"tool"}` messages; endpoint failures render as an
//! error payload in the tool message and never abort the round-trip. The
//! provider is then re-invoked exactly once with the extended message list —
//! no recursion, a follow-up that itself asks for tools is returned as-is.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use crate::provider::{Provider, ProviderError, ProxyRequest, ProxyResponse};
use crate::tenant::McpEndpoint;

/// Per-endpoint call timeout.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of [`McpRoundTrip::run`]: the body to return to the client and
/// whether any MCP endpoint was actually called.
#[derive(Debug)]
pub struct McpOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub did_call_mcp: bool,
}

/// One tool call extracted from an assistant message.
#[derive(Debug, Clone)]
struct ToolCall {
    id: Value,
    name: String,
    arguments: Value,
}

/// Executes tool round-trips against MCP endpoints.
pub struct McpRoundTrip {
    client: reqwest::Client,
    endpoint_timeout: Duration,
}

impl McpRoundTrip {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
        }
    }

    pub fn with_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout = timeout;
        self
    }

    /// Runs the round-trip over a non-streaming JSON response.
    ///
    /// Returns the response unchanged (`did_call_mcp == false`) when no tool
    /// call matches an endpoint.
    ///
    /// # Errors
    ///
    /// Only the single follow-up provider invocation can fail; endpoint
    /// failures are folded into tool messages.
    pub async fn run(
        &self,
        provider: &dyn Provider,
        original: &ProxyRequest,
        endpoints: &[McpEndpoint],
        status: u16,
        headers: Vec<(String, String)>,
        body: Value,
    ) -> Result<McpOutcome, ProviderError> {
        let unchanged = |body: Value, headers: Vec<(String, String)>| McpOutcome {
            status,
            headers,
            body,
            did_call_mcp: false,
        };

        let assistant = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .cloned();
        let tool_calls = extract_tool_calls(&body);
        if tool_calls.is_empty() || endpoints.is_empty() {
            return Ok(unchanged(body, headers));
        }

        let by_name: HashMap<&str, &McpEndpoint> =
            endpoints.iter().map(|ep| (ep.name.as_str(), ep)).collect();
        let matched: Vec<(&ToolCall, &McpEndpoint)> = tool_calls
            .iter()
            .filter_map(|call| by_name.get(call.name.as_str()).map(|ep| (call, *ep)))
            .collect();
        if matched.is_empty() {
            return Ok(unchanged(body, headers));
        }

        let tool_messages = futures_util::future::join_all(
            matched
                .iter()
                .map(|(call, endpoint)| self.call_endpoint(call, endpoint)),
        )
        .await;

        let mut messages = original
            .body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(assistant) = assistant {
            messages.push(assistant);
        }
        messages.extend(tool_messages);

        let mut follow_up_body = original.body.clone();
        if let Some(obj) = follow_up_body.as_object_mut() {
            obj.insert("messages".into(), Value::Array(messages));
        }
        let follow_up = ProxyRequest {
            path: original.path.clone(),
            body: follow_up_body,
            headers: original.headers.clone(),
        };

        match provider.proxy(follow_up).await? {
            ProxyResponse::Json {
                status,
                headers,
                body,
            } => Ok(McpOutcome {
                status,
                headers,
                body,
                did_call_mcp: true,
            }),
            ProxyResponse::Text {
                status,
                headers,
                body,
            } => Ok(McpOutcome {
                status,
                headers,
                body: Value::String(body),
                did_call_mcp: true,
            }),
            ProxyResponse::Stream { .. } => {
                // The follow-up reuses the non-streaming request, so an SSE
                // answer here is a protocol violation from the upstream.
                Err(ProviderError::Transport(
                    "unexpected event stream on MCP follow-up".into(),
                ))
            }
        }
    }

    /// POSTs one `tools/call` and renders the tool message. Failures become
    /// an `{error, detail}` content payload.
    async fn call_endpoint(&self, call: &ToolCall, endpoint: &McpEndpoint) -> Value {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {
                "name": call.name,
                "arguments": call.arguments,
            },
            "id": call.id,
        });
        let mut builder = self
            .client
            .post(&endpoint.url)
            .timeout(self.endpoint_timeout)
            .json(&payload);
        if let Some(headers) = &endpoint.headers {
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
        }

        let content = match builder.send().await {
            Ok(response) => match response.json::<Value>().await {
                Ok(body) => {
                    let result = body.get("result").cloned().unwrap_or(body);
                    serde_json::to_string(&result)
                        .unwrap_or_else(|_| "null".to_string())
                }
                Err(e) => error_content(&e.to_string()),
            },
            Err(e) => {
                tracing::warn!(endpoint = %endpoint.url, tool = %call.name, "mcp call failed: {}", e);
                error_content(&e.to_string())
            }
        };

        json!({
            "role": "tool",
            "tool_call_id": call.id,
            "content": content,
        })
    }
}

fn error_content(detail: &str) -> String {
    json!({"error": "MCP call failed", "detail": detail}).to_string()
}

/// Pulls `choices[0].message.tool_calls[]` out of a response body.
fn extract_tool_calls(body: &Value) -> Vec<ToolCall> {
    let calls = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array);
    let Some(calls) = calls else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|call| {
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .or_else(|| call.get("name"))
                .and_then(Value::as_str)?;
            let raw_args = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .or_else(|| call.get("arguments"));
            Some(ToolCall {
                id: call.get("id").cloned().unwrap_or(Value::Null),
                name: name.to_string(),
                arguments: parse_arguments(raw_args),
            })
        })
        .collect()
}

/// `arguments` may arrive as a JSON string (OpenAI) or an object; string
/// parse failure degrades to `{}`.
fn parse_arguments(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
        Some(v) => v.clone(),
        None => json!({}),
    }
}

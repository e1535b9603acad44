//! OpenAI-compatible adapter: `base_url + path`, `Authorization: Bearer`.
//!
//! Also serves Ollama, whose `/v1` surface speaks the same protocol; in that
//! case the bearer header is only sent when a key is configured.

use async_trait::async_trait;

use super::{dispatch, Provider, ProviderError, ProxyRequest, ProxyResponse};

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse, ProviderError> {
        let mut builder = self.client.post(self.url_for(&request.path));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        dispatch(builder, &request.body).await
    }
}

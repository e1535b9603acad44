//! Tenant, agent, and API-key model plus the resolved [`TenantContext`].
//!
//! Tenants form a forest via `parent_id`; agents live inside a tenant and own
//! API keys. Configuration fields (`provider_config`, `system_prompt`,
//! `skills`, `mcp_endpoints`) are optional at every level and resolved along
//! the agent → tenant → parent chain by [`resolve`](crate::resolve).
//!
//! Skills are kept as opaque JSON values (OpenAI tool definitions); the
//! gateway only ever reads their name for de-duplication, see [`skill_name`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tenant lifecycle status. Inactive tenants fail auth with `tenant_inactive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
}

/// API key lifecycle status. Only `active` keys resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
}

/// Upstream provider family for a resolved configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Azure,
    Ollama,
}

/// Provider connection settings carried on a tenant or agent.
///
/// `base_url` applies to OpenAI-compatible upstreams (including Ollama);
/// `endpoint`/`deployment`/`api_version` apply to Azure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

/// One MCP endpoint reachable via JSON-RPC `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpEndpoint {
    /// Tool name this endpoint serves; matched against `tool_calls[].function.name`.
    pub name: String,
    pub url: String,
    /// Extra headers sent on every call (e.g. an upstream API key).
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

/// How the agent's system prompt combines with the request's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemPromptPolicy {
    #[default]
    Prepend,
    Append,
    Overwrite,
    Ignore,
}

/// How resolved lists (skills, MCP endpoints) combine with request fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListPolicy {
    #[default]
    Merge,
    Overwrite,
    Ignore,
}

/// Per-agent merge policies. Defaults: `prepend` / `merge` / `merge`.
///
/// `mcp_endpoints` is parsed and retained but endpoint resolution always
/// unions with earlier-wins precedence; only `system_prompt` and `skills`
/// are consulted by the merge engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MergePolicies {
    #[serde(default)]
    pub system_prompt: SystemPromptPolicy,
    #[serde(default)]
    pub skills: ListPolicy,
    #[serde(default)]
    pub mcp_endpoints: ListPolicy,
}

/// Conversation flags carried on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub conversations_enabled: bool,
    pub conversation_token_limit: u32,
    pub conversation_summary_model: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            conversations_enabled: false,
            conversation_token_limit: 4000,
            conversation_summary_model: None,
        }
    }
}

/// A tenant row. Forms a forest through `parent_id`; the resolver walks at
/// most ten hops so a mis-written cycle cannot hang resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub provider_config: Option<ProviderConfig>,
    pub system_prompt: Option<String>,
    pub skills: Option<Vec<Value>>,
    pub mcp_endpoints: Option<Vec<McpEndpoint>>,
    pub status: TenantStatus,
}

/// An agent row: a named configuration inside a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub provider_config: Option<ProviderConfig>,
    pub system_prompt: Option<String>,
    pub skills: Option<Vec<Value>>,
    pub mcp_endpoints: Option<Vec<McpEndpoint>>,
    pub merge_policies: Option<MergePolicies>,
    pub conversations_enabled: bool,
    pub conversation_token_limit: u32,
    pub conversation_summary_model: Option<String>,
}

impl Agent {
    /// Conversation flags as a standalone config (defaults applied by the store).
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            conversations_enabled: self.conversations_enabled,
            conversation_token_limit: self.conversation_token_limit,
            conversation_summary_model: self.conversation_summary_model.clone(),
        }
    }
}

/// An API-key row. The raw key is never stored; only its SHA-256 hash and the
/// first 12 characters (display prefix) persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub status: KeyStatus,
}

/// The fully resolved configuration attached to an authenticated request.
///
/// Produced by [`resolve::Resolver`](crate::resolve::Resolver) on cache miss
/// and cached by [`cache::TenantCache`](crate::cache::TenantCache) keyed by
/// the API-key hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub resolved_system_prompt: Option<String>,
    pub resolved_skills: Vec<Value>,
    pub resolved_mcp_endpoints: Vec<McpEndpoint>,
    pub resolved_provider_config: Option<ProviderConfig>,
    pub merge_policies: MergePolicies,
    pub agent_config: AgentConfig,
}

/// Name of a skill/tool definition: `function.name`, falling back to `name`.
///
/// Used for de-duplication during resolution and merging. Definitions without
/// either field never collide (treated as unnamed).
pub fn skill_name(skill: &Value) -> Option<&str> {
    skill
        .get("function")
        .and_then(|f| f.get("name"))
        .or_else(|| skill.get("name"))
        .and_then(Value::as_str)
}

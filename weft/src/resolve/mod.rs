//! Configuration resolution: API-key hash → [`TenantContext`].
//!
//! On a cache miss the resolver loads the key, its agent and tenant, then
//! walks the tenant parent chain (at most [`MAX_CHAIN_HOPS`] hops) and folds
//! the ordered chain `[agent, tenant, parent, …]` into a resolved view:
//!
//! - `provider_config`, `system_prompt`: first non-null entry wins.
//! - `skills`: union de-duplicated by `function.name`/`name`, earlier wins.
//! - `mcp_endpoints`: union de-duplicated by `name`, earlier wins.
//! - `merge_policies`, conversation flags: from the agent, with defaults.
//!
//! The schema does not enforce acyclicity; the hop cap is the safeguard, and
//! a visited-set warning is logged when a cycle is seen.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;
use crate::tenant::{
    skill_name, Agent, ApiKeyRecord, KeyStatus, McpEndpoint, MergePolicies, ProviderConfig,
    Tenant, TenantContext, TenantStatus,
};

/// Maximum parent hops during chain resolution. Exceeding it terminates the
/// walk with what has been gathered; it is not an error.
pub const MAX_CHAIN_HOPS: usize = 10;

/// Lookup surface the resolver needs; implemented by the SQLite store and by
/// in-memory fakes in tests.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Active API key by hex SHA-256 hash, or `None` when absent/revoked.
    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;
    async fn agent_by_id(&self, id: Uuid) -> Result<Option<Agent>, StoreError>;
    async fn tenant_by_id(&self, id: Uuid) -> Result<Option<Tenant>, StoreError>;
}

/// Resolution failures surfaced to the auth middleware.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No active key with this hash.
    #[error("invalid api key")]
    InvalidKey,
    /// The owning tenant is not active.
    #[error("tenant is inactive")]
    TenantInactive,
    /// The key points at a missing agent or tenant row.
    #[error("dangling reference: {0}")]
    Dangling(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One level of the agent → tenant → parent chain, in resolution order.
struct ChainLevel {
    provider_config: Option<ProviderConfig>,
    system_prompt: Option<String>,
    skills: Option<Vec<Value>>,
    mcp_endpoints: Option<Vec<McpEndpoint>>,
}

/// Walks the directory and produces resolved tenant contexts.
pub struct Resolver {
    directory: Arc<dyn Directory>,
}

impl Resolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Resolves a key hash to a full context.
    ///
    /// # Errors
    ///
    /// [`ResolveError::InvalidKey`] when no active key matches,
    /// [`ResolveError::TenantInactive`] when the owning tenant is inactive.
    pub async fn resolve(&self, key_hash: &str) -> Result<TenantContext, ResolveError> {
        let key = self
            .directory
            .api_key_by_hash(key_hash)
            .await?
            .filter(|k| k.status == KeyStatus::Active)
            .ok_or(ResolveError::InvalidKey)?;

        let agent = self
            .directory
            .agent_by_id(key.agent_id)
            .await?
            .ok_or(ResolveError::Dangling("agent"))?;
        let tenant = self
            .directory
            .tenant_by_id(key.tenant_id)
            .await?
            .ok_or(ResolveError::Dangling("tenant"))?;
        if tenant.status != TenantStatus::Active {
            return Err(ResolveError::TenantInactive);
        }

        let merge_policies = agent.merge_policies.unwrap_or_default();
        let agent_config = agent.agent_config();

        let mut chain = vec![ChainLevel {
            provider_config: agent.provider_config,
            system_prompt: agent.system_prompt,
            skills: agent.skills,
            mcp_endpoints: agent.mcp_endpoints,
        }];

        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(tenant.id);
        let mut next_parent = tenant.parent_id;
        chain.push(ChainLevel {
            provider_config: tenant.provider_config,
            system_prompt: tenant.system_prompt,
            skills: tenant.skills,
            mcp_endpoints: tenant.mcp_endpoints,
        });

        let mut hops = 0;
        while let Some(parent_id) = next_parent {
            if hops >= MAX_CHAIN_HOPS {
                tracing::warn!(
                    tenant_id = %tenant.id,
                    "tenant chain exceeded {} hops, truncating resolution",
                    MAX_CHAIN_HOPS
                );
                break;
            }
            if !visited.insert(parent_id) {
                tracing::warn!(
                    tenant_id = %tenant.id,
                    parent_id = %parent_id,
                    "tenant parent chain cycle detected, truncating resolution"
                );
                break;
            }
            let Some(parent) = self.directory.tenant_by_id(parent_id).await? else {
                break;
            };
            next_parent = parent.parent_id;
            chain.push(ChainLevel {
                provider_config: parent.provider_config,
                system_prompt: parent.system_prompt,
                skills: parent.skills,
                mcp_endpoints: parent.mcp_endpoints,
            });
            hops += 1;
        }

        Ok(fold_chain(
            chain,
            &agent.name,
            key.tenant_id,
            key.agent_id,
            merge_policies,
            agent_config,
        ))
    }
}

/// Folds the ordered chain into the resolved view. Earlier levels (agent
/// first) take precedence everywhere.
fn fold_chain(
    chain: Vec<ChainLevel>,
    agent_name: &str,
    tenant_id: Uuid,
    agent_id: Uuid,
    merge_policies: MergePolicies,
    agent_config: crate::tenant::AgentConfig,
) -> TenantContext {
    let mut resolved_provider_config = None;
    let mut resolved_system_prompt = None;
    let mut resolved_skills: Vec<Value> = Vec::new();
    let mut seen_skills: HashSet<String> = HashSet::new();
    let mut resolved_mcp_endpoints: Vec<McpEndpoint> = Vec::new();
    let mut seen_endpoints: HashSet<String> = HashSet::new();

    for level in chain {
        if resolved_provider_config.is_none() {
            resolved_provider_config = level.provider_config;
        }
        if resolved_system_prompt.is_none() {
            resolved_system_prompt = level.system_prompt;
        }
        if let Some(skills) = level.skills {
            for skill in skills {
                match skill_name(&skill) {
                    Some(name) => {
                        if seen_skills.insert(name.to_string()) {
                            resolved_skills.push(skill);
                        }
                    }
                    None => resolved_skills.push(skill),
                }
            }
        }
        if let Some(endpoints) = level.mcp_endpoints {
            for ep in endpoints {
                if seen_endpoints.insert(ep.name.clone()) {
                    resolved_mcp_endpoints.push(ep);
                }
            }
        }
    }

    TenantContext {
        tenant_id,
        agent_id,
        agent_name: agent_name.to_string(),
        resolved_system_prompt,
        resolved_skills,
        resolved_mcp_endpoints,
        resolved_provider_config,
        merge_policies,
        agent_config,
    }
}

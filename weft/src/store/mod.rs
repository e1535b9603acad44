//! SQLite persistence: directory lookups, conversation state, and traces.
//!
//! Connections are opened per call inside `spawn_blocking`; a semaphore
//! bounds concurrent database work to the configured pool size (default 10)
//! so storage can never monopolize the blocking pool. Conversation tables
//! carry `*_encrypted` + `*_iv` column pairs; trace rows go to per-month
//! tables (`traces_YYYYMM`) created on demand at flush time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::hash_api_key;
use crate::conversation::{Conversation, Partition, Snapshot, StoredMessage};
use crate::crypto::Encrypted;
use crate::resolve::Directory;
use crate::tenant::{
    Agent, ApiKeyRecord, KeyStatus, McpEndpoint, MergePolicies, ProviderConfig, Tenant,
    TenantStatus,
};
use crate::trace::TraceRow;

/// Default bound on concurrent store operations.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Storage failures. Trace writes swallow these (logged); conversation writes
/// surface them so the live response can proceed without persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(String),
    #[error("blocking task: {0}")]
    Task(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    parent_id       TEXT,
    provider_config TEXT,
    system_prompt   TEXT,
    skills          TEXT,
    mcp_endpoints   TEXT,
    status          TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS agents (
    id                         TEXT PRIMARY KEY,
    tenant_id                  TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    name                       TEXT NOT NULL,
    provider_config            TEXT,
    system_prompt              TEXT,
    skills                     TEXT,
    mcp_endpoints              TEXT,
    merge_policies             TEXT,
    conversations_enabled      INTEGER NOT NULL DEFAULT 0,
    conversation_token_limit   INTEGER NOT NULL DEFAULT 4000,
    conversation_summary_model TEXT
);

CREATE TABLE IF NOT EXISTS api_keys (
    id         TEXT PRIMARY KEY,
    tenant_id  TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    agent_id   TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    key_hash   TEXT NOT NULL UNIQUE,
    key_prefix TEXT NOT NULL,
    status     TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS partitions (
    id              TEXT PRIMARY KEY,
    tenant_id       TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    parent_id       TEXT REFERENCES partitions(id),
    external_id     TEXT NOT NULL,
    title_encrypted TEXT,
    title_iv        TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_partitions_scoped
    ON partitions(tenant_id, parent_id, external_id) WHERE parent_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_partitions_root
    ON partitions(tenant_id, external_id) WHERE parent_id IS NULL;

CREATE TABLE IF NOT EXISTS conversations (
    id             TEXT PRIMARY KEY,
    tenant_id      TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    agent_id       TEXT REFERENCES agents(id) ON DELETE SET NULL,
    partition_id   TEXT REFERENCES partitions(id),
    external_id    TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    last_active_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_scoped
    ON conversations(tenant_id, partition_id, external_id) WHERE partition_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_root
    ON conversations(tenant_id, external_id) WHERE partition_id IS NULL;

CREATE TABLE IF NOT EXISTS conversation_messages (
    id                TEXT PRIMARY KEY,
    conversation_id   TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role              TEXT NOT NULL,
    content_encrypted TEXT NOT NULL,
    content_iv        TEXT NOT NULL,
    key_version       INTEGER NOT NULL,
    token_estimate    INTEGER,
    trace_id          TEXT,
    snapshot_id       TEXT,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_live
    ON conversation_messages(conversation_id, created_at) WHERE snapshot_id IS NULL;

CREATE TABLE IF NOT EXISTS conversation_snapshots (
    id                TEXT PRIMARY KEY,
    conversation_id   TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    summary_encrypted TEXT NOT NULL,
    summary_iv        TEXT NOT NULL,
    key_version       INTEGER NOT NULL,
    messages_archived INTEGER NOT NULL,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_conversation
    ON conversation_snapshots(conversation_id, created_at);
"#;

/// SQLite-backed store shared by the resolver, conversation manager, and
/// trace recorder.
pub struct SqliteStore {
    path: PathBuf,
    permits: Arc<tokio::sync::Semaphore>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database and bootstraps the schema.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_pool_size(path, DEFAULT_POOL_SIZE).await
    }

    /// Like [`new`](Self::new) with an explicit concurrency bound.
    pub async fn with_pool_size(
        path: impl AsRef<Path>,
        pool_size: usize,
    ) -> Result<Self, StoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            permits: Arc::new(tokio::sync::Semaphore::new(pool_size.max(1))),
        };
        store
            .run(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    /// Runs a closure against a fresh connection on the blocking pool,
    /// bounded by the pool semaphore.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut conn = Connection::open(&path)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    // ----- seed / admin helpers -------------------------------------------

    pub async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let t = tenant.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO tenants (id, name, parent_id, provider_config, system_prompt, skills, mcp_endpoints, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    t.id.to_string(),
                    t.name,
                    t.parent_id.map(|p| p.to_string()),
                    to_json_column(&t.provider_config)?,
                    t.system_prompt,
                    to_json_column(&t.skills)?,
                    to_json_column(&t.mcp_endpoints)?,
                    status_str(t.status),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_tenant_status(
        &self,
        tenant_id: Uuid,
        status: TenantStatus,
    ) -> Result<(), StoreError> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE tenants SET status = ?1 WHERE id = ?2",
                params![status_str(status), tenant_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let a = agent.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO agents (id, tenant_id, name, provider_config, system_prompt, skills, mcp_endpoints,
                                     merge_policies, conversations_enabled, conversation_token_limit, conversation_summary_model)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    a.id.to_string(),
                    a.tenant_id.to_string(),
                    a.name,
                    to_json_column(&a.provider_config)?,
                    a.system_prompt,
                    to_json_column(&a.skills)?,
                    to_json_column(&a.mcp_endpoints)?,
                    to_json_column(&a.merge_policies)?,
                    a.conversations_enabled as i64,
                    a.conversation_token_limit as i64,
                    a.conversation_summary_model,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Creates an API key from its raw value. Only the SHA-256 hash and the
    /// first 12 characters are stored.
    pub async fn create_api_key(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        raw_key: &str,
    ) -> Result<ApiKeyRecord, StoreError> {
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            tenant_id,
            agent_id,
            key_hash: hash_api_key(raw_key),
            key_prefix: raw_key.chars().take(12).collect(),
            status: KeyStatus::Active,
        };
        let r = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO api_keys (id, tenant_id, agent_id, key_hash, key_prefix, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active')",
                params![
                    r.id.to_string(),
                    r.tenant_id.to_string(),
                    r.agent_id.to_string(),
                    r.key_hash,
                    r.key_prefix,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(record)
    }

    /// Marks a key revoked; the caller must also invalidate the cache entry.
    pub async fn revoke_api_key(&self, key_hash: &str) -> Result<(), StoreError> {
        let hash = key_hash.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE api_keys SET status = 'revoked' WHERE key_hash = ?1",
                params![hash],
            )?;
            Ok(())
        })
        .await
    }

    // ----- conversations ---------------------------------------------------

    pub(crate) async fn get_or_create_partition(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<Partition, StoreError> {
        let external = external_id.to_string();
        self.run(move |conn| {
            let tenant = tenant_id.to_string();
            conn.execute(
                "INSERT OR IGNORE INTO partitions (id, tenant_id, parent_id, external_id)
                 VALUES (?1, ?2, NULL, ?3)",
                params![Uuid::new_v4().to_string(), tenant, external],
            )?;
            conn.query_row(
                "SELECT id, tenant_id, parent_id, external_id FROM partitions
                 WHERE tenant_id = ?1 AND external_id = ?2 AND parent_id IS NULL",
                params![tenant, external],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .map_err(StoreError::from)
            .and_then(|(id, tenant_id, parent_id, external_id)| {
                Ok(Partition {
                    id: parse_uuid(&id)?,
                    tenant_id: parse_uuid(&tenant_id)?,
                    parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
                    external_id,
                })
            })
        })
        .await
    }

    pub(crate) async fn get_or_create_conversation(
        &self,
        tenant_id: Uuid,
        partition_id: Option<Uuid>,
        external_id: &str,
        agent_id: Uuid,
    ) -> Result<(Conversation, bool), StoreError> {
        let external = external_id.to_string();
        self.run(move |conn| {
            let tenant = tenant_id.to_string();
            let partition = partition_id.map(|p| p.to_string());
            let now = now_str();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO conversations (id, tenant_id, agent_id, partition_id, external_id, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    tenant,
                    agent_id.to_string(),
                    partition,
                    external,
                    now,
                ],
            )?;
            let is_new = inserted > 0;
            if !is_new {
                // Hit: touch last_active_at.
                match &partition {
                    Some(p) => conn.execute(
                        "UPDATE conversations SET last_active_at = ?1
                         WHERE tenant_id = ?2 AND partition_id = ?3 AND external_id = ?4",
                        params![now_str(), tenant, p, external],
                    )?,
                    None => conn.execute(
                        "UPDATE conversations SET last_active_at = ?1
                         WHERE tenant_id = ?2 AND partition_id IS NULL AND external_id = ?3",
                        params![now_str(), tenant, external],
                    )?,
                };
            }
            let row = match &partition {
                Some(p) => conn.query_row(
                    "SELECT id, tenant_id, agent_id, partition_id, external_id, created_at, last_active_at
                     FROM conversations
                     WHERE tenant_id = ?1 AND partition_id = ?2 AND external_id = ?3",
                    params![tenant, p, external],
                    conversation_from_row,
                )?,
                None => conn.query_row(
                    "SELECT id, tenant_id, agent_id, partition_id, external_id, created_at, last_active_at
                     FROM conversations
                     WHERE tenant_id = ?1 AND partition_id IS NULL AND external_id = ?2",
                    params![tenant, external],
                    conversation_from_row,
                )?,
            };
            Ok((conversation_from_raw(row)?, is_new))
        })
        .await
    }

    /// Live (un-snapshotted) messages in `created_at` order; the rowid breaks
    /// ties so a user row always precedes its paired assistant row.
    pub async fn live_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content_encrypted, content_iv, key_version,
                        token_estimate, trace_id, snapshot_id, created_at
                 FROM conversation_messages
                 WHERE conversation_id = ?1 AND snapshot_id IS NULL
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id.to_string()], message_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(message_from_raw(row?)?);
            }
            Ok(out)
        })
        .await
    }

    pub(crate) async fn latest_snapshot(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Snapshot>, StoreError> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, conversation_id, summary_encrypted, summary_iv, key_version,
                            messages_archived, created_at
                     FROM conversation_snapshots
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    params![conversation_id.to_string()],
                    snapshot_from_row,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            row.map(snapshot_from_raw).transpose()
        })
        .await
    }

    /// Inserts the user/assistant pair with one statement; the user row comes
    /// first in rowid order. Rows are append-only from here on.
    pub(crate) async fn insert_message_pair(
        &self,
        conversation_id: Uuid,
        user: (Encrypted, i64),
        assistant: (Encrypted, i64),
        key_version: u32,
        trace_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.run(move |conn| {
            let now = now_str();
            conn.execute(
                "INSERT INTO conversation_messages
                     (id, conversation_id, role, content_encrypted, content_iv, key_version,
                      token_estimate, trace_id, snapshot_id, created_at)
                 VALUES
                     (?1, ?2, 'user', ?3, ?4, ?5, ?6, ?7, NULL, ?8),
                     (?9, ?2, 'assistant', ?10, ?11, ?5, ?12, ?7, NULL, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    conversation_id.to_string(),
                    user.0.ciphertext,
                    user.0.iv,
                    key_version as i64,
                    user.1,
                    trace_id.map(|t| t.to_string()),
                    now,
                    Uuid::new_v4().to_string(),
                    assistant.0.ciphertext,
                    assistant.0.iv,
                    assistant.1,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Inserts a snapshot and stamps every live message with its id, in one
    /// transaction. This is the only update messages ever receive.
    pub(crate) async fn insert_snapshot(
        &self,
        conversation_id: Uuid,
        summary: &Encrypted,
        key_version: u32,
        messages_archived: i64,
    ) -> Result<Uuid, StoreError> {
        let summary = summary.clone();
        self.run(move |conn| {
            let snapshot_id = Uuid::new_v4();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversation_snapshots
                     (id, conversation_id, summary_encrypted, summary_iv, key_version, messages_archived, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    snapshot_id.to_string(),
                    conversation_id.to_string(),
                    summary.ciphertext,
                    summary.iv,
                    key_version as i64,
                    messages_archived,
                    now_str(),
                ],
            )?;
            tx.execute(
                "UPDATE conversation_messages SET snapshot_id = ?1
                 WHERE conversation_id = ?2 AND snapshot_id IS NULL",
                params![snapshot_id.to_string(), conversation_id.to_string()],
            )?;
            tx.commit()?;
            Ok(snapshot_id)
        })
        .await
    }

    // ----- traces ----------------------------------------------------------

    /// Inserts a trace batch, routing each row to its month table
    /// (`traces_YYYYMM`), creating tables on demand.
    pub async fn insert_traces(&self, rows: Vec<TraceRow>) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for row in &rows {
                let table = trace_table_for(&row.created_at);
                tx.execute_batch(&trace_table_ddl(&table))?;
                tx.execute(
                    &format!(
                        "INSERT INTO {table}
                             (id, tenant_id, request_id, model, provider, endpoint,
                              request_body_encrypted, request_body_iv,
                              response_body_encrypted, response_body_iv,
                              latency_ms, ttfb_ms, gateway_overhead_ms,
                              prompt_tokens, completion_tokens, total_tokens,
                              status_code, encryption_key_version, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                    ),
                    params![
                        row.id.to_string(),
                        row.tenant_id.to_string(),
                        row.request_id,
                        row.model,
                        row.provider,
                        row.endpoint,
                        row.request_body_encrypted,
                        row.request_body_iv,
                        row.response_body_encrypted,
                        row.response_body_iv,
                        row.latency_ms,
                        row.ttfb_ms,
                        row.gateway_overhead_ms,
                        row.prompt_tokens,
                        row.completion_tokens,
                        row.total_tokens,
                        row.status_code.map(|s| s as i64),
                        row.encryption_key_version as i64,
                        to_timestamp(&row.created_at),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Trace rows currently in one month table. Test/analytics helper.
    pub async fn count_traces(&self, month: DateTime<Utc>) -> Result<i64, StoreError> {
        self.run(move |conn| {
            let table = trace_table_for(&month);
            let count = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get::<_, i64>(0)
                })
                .or_else(|e| match e {
                    // Missing table: nothing was flushed for that month.
                    rusqlite::Error::SqliteFailure(_, _) => Ok(0),
                    other => Err(other),
                })?;
            Ok(count)
        })
        .await
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let hash = key_hash.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, tenant_id, agent_id, key_hash, key_prefix, status
                     FROM api_keys WHERE key_hash = ?1 AND status = 'active'",
                    params![hash],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            row.map(|(id, tenant_id, agent_id, key_hash, key_prefix, status)| {
                Ok(ApiKeyRecord {
                    id: parse_uuid(&id)?,
                    tenant_id: parse_uuid(&tenant_id)?,
                    agent_id: parse_uuid(&agent_id)?,
                    key_hash,
                    key_prefix,
                    status: if status == "active" {
                        KeyStatus::Active
                    } else {
                        KeyStatus::Revoked
                    },
                })
            })
            .transpose()
        })
        .await
    }

    async fn agent_by_id(&self, id: Uuid) -> Result<Option<Agent>, StoreError> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, tenant_id, name, provider_config, system_prompt, skills, mcp_endpoints,
                            merge_policies, conversations_enabled, conversation_token_limit, conversation_summary_model
                     FROM agents WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                            row.get::<_, Option<String>>(10)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            row.map(
                |(id, tenant_id, name, provider, prompt, skills, endpoints, policies, conv, limit, model)| {
                    Ok(Agent {
                        id: parse_uuid(&id)?,
                        tenant_id: parse_uuid(&tenant_id)?,
                        name,
                        provider_config: from_json_column::<ProviderConfig>(provider.as_deref())?,
                        system_prompt: prompt,
                        skills: from_json_column(skills.as_deref())?,
                        mcp_endpoints: from_json_column::<Vec<McpEndpoint>>(endpoints.as_deref())?,
                        merge_policies: from_json_column::<MergePolicies>(policies.as_deref())?,
                        conversations_enabled: conv != 0,
                        conversation_token_limit: limit.max(0) as u32,
                        conversation_summary_model: model,
                    })
                },
            )
            .transpose()
        })
        .await
    }

    async fn tenant_by_id(&self, id: Uuid) -> Result<Option<Tenant>, StoreError> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, parent_id, provider_config, system_prompt, skills, mcp_endpoints, status
                     FROM tenants WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            row.map(|(id, name, parent, provider, prompt, skills, endpoints, status)| {
                Ok(Tenant {
                    id: parse_uuid(&id)?,
                    name,
                    parent_id: parent.as_deref().map(parse_uuid).transpose()?,
                    provider_config: from_json_column::<ProviderConfig>(provider.as_deref())?,
                    system_prompt: prompt,
                    skills: from_json_column(skills.as_deref())?,
                    mcp_endpoints: from_json_column::<Vec<McpEndpoint>>(endpoints.as_deref())?,
                    status: if status == "active" {
                        TenantStatus::Active
                    } else {
                        TenantStatus::Inactive
                    },
                })
            })
            .transpose()
        })
        .await
    }
}

// ----- row/column helpers ---------------------------------------------------

fn status_str(status: TenantStatus) -> &'static str {
    match status {
        TenantStatus::Active => "active",
        TenantStatus::Inactive => "inactive",
    }
}

fn now_str() -> String {
    to_timestamp(&Utc::now())
}

fn to_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("uuid {s:?}: {e}")))
}

fn to_json_column<T: serde::Serialize>(value: &T) -> Result<Option<String>, StoreError> {
    let v = serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    if v.is_null() {
        return Ok(None);
    }
    Ok(Some(v.to_string()))
}

fn from_json_column<T: serde::de::DeserializeOwned>(
    column: Option<&str>,
) -> Result<Option<T>, StoreError> {
    column
        .map(|raw| {
            serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("json column: {e}")))
        })
        .transpose()
}

type ConversationRaw = (
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
);

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn conversation_from_raw(raw: ConversationRaw) -> Result<Conversation, StoreError> {
    let (id, tenant_id, agent_id, partition_id, external_id, created_at, last_active_at) = raw;
    Ok(Conversation {
        id: parse_uuid(&id)?,
        tenant_id: parse_uuid(&tenant_id)?,
        agent_id: agent_id.as_deref().map(parse_uuid).transpose()?,
        partition_id: partition_id.as_deref().map(parse_uuid).transpose()?,
        external_id,
        created_at: parse_timestamp(&created_at)?,
        last_active_at: parse_timestamp(&last_active_at)?,
    })
}

type MessageRaw = (
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
    Option<String>,
    String,
);

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn message_from_raw(raw: MessageRaw) -> Result<StoredMessage, StoreError> {
    let (id, conversation_id, role, ct, iv, key_version, tokens, trace_id, snapshot_id, created) =
        raw;
    Ok(StoredMessage {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        role,
        content_encrypted: ct,
        content_iv: iv,
        key_version: key_version.max(0) as u32,
        token_estimate: tokens,
        trace_id: trace_id.as_deref().map(parse_uuid).transpose()?,
        snapshot_id: snapshot_id.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_timestamp(&created)?,
    })
}

type SnapshotRaw = (String, String, String, String, i64, i64, String);

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn snapshot_from_raw(raw: SnapshotRaw) -> Result<Snapshot, StoreError> {
    let (id, conversation_id, ct, iv, key_version, archived, created) = raw;
    Ok(Snapshot {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        summary_encrypted: ct,
        summary_iv: iv,
        key_version: key_version.max(0) as u32,
        messages_archived: archived,
        created_at: parse_timestamp(&created)?,
    })
}

/// Month table name for a trace timestamp, e.g. `traces_202608`.
fn trace_table_for(created_at: &DateTime<Utc>) -> String {
    format!("traces_{}", created_at.format("%Y%m"))
}

fn trace_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
             id                      TEXT PRIMARY KEY,
             tenant_id               TEXT NOT NULL,
             request_id              TEXT NOT NULL,
             model                   TEXT,
             provider                TEXT,
             endpoint                TEXT,
             request_body_encrypted  TEXT NOT NULL,
             request_body_iv         TEXT NOT NULL,
             response_body_encrypted TEXT,
             response_body_iv        TEXT,
             latency_ms              INTEGER NOT NULL,
             ttfb_ms                 INTEGER,
             gateway_overhead_ms     INTEGER,
             prompt_tokens           INTEGER,
             completion_tokens       INTEGER,
             total_tokens            INTEGER,
             status_code             INTEGER,
             encryption_key_version  INTEGER NOT NULL,
             created_at              TEXT NOT NULL
         )"
    )
}

//! Conversation state: partitions, conversations, the append-only encrypted
//! message log, and summarization snapshots.
//!
//! Message content is encrypted at rest per tenant; rows are never updated
//! after insert except to set `snapshot_id` exactly once when archived. The
//! manager loads live (un-snapshotted) context in `created_at` order,
//! silently skipping rows it cannot decrypt, and builds the injection the
//! chat handler splices into the outgoing provider body.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoService;
use crate::store::{SqliteStore, StoreError};

/// A tenant-scoped hierarchical grouping of conversations.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub external_id: String,
}

/// One conversation, addressed externally by `(tenant, partition, external_id)`.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub partition_id: Option<Uuid>,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// A stored (still encrypted) message row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content_encrypted: String,
    pub content_iv: String,
    pub key_version: u32,
    pub token_estimate: Option<i64>,
    pub trace_id: Option<Uuid>,
    pub snapshot_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A stored (still encrypted) snapshot row.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub summary_encrypted: String,
    pub summary_iv: String,
    pub key_version: u32,
    pub messages_archived: i64,
    pub created_at: DateTime<Utc>,
}

/// A decrypted live message, ready for injection.
#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
    pub token_estimate: i64,
}

/// Decrypted view of a conversation's live window.
#[derive(Debug, Default)]
pub struct ConversationContext {
    pub messages: Vec<ContextMessage>,
    pub token_estimate: i64,
    pub latest_snapshot_id: Option<Uuid>,
    pub latest_snapshot_summary: Option<String>,
}

/// Conversation persistence failures. Decrypt failures are not here: those
/// rows are skipped, not surfaced.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encryption failed: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// `ceil(len/4)` fallback when a row carries no token estimate.
pub fn estimate_tokens(content: &str) -> i64 {
    ((content.len() + 3) / 4) as i64
}

/// Partition + conversation resolution, context load/inject, message store,
/// snapshot creation. One instance is shared by all request handlers.
pub struct ConversationManager {
    store: Arc<SqliteStore>,
    crypto: Arc<CryptoService>,
}

impl ConversationManager {
    pub fn new(store: Arc<SqliteStore>, crypto: Arc<CryptoService>) -> Self {
        Self { store, crypto }
    }

    /// Upserts a root partition by `(tenant, external_id, parent = NULL)`.
    pub async fn get_or_create_partition(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<Partition, ConversationError> {
        Ok(self
            .store
            .get_or_create_partition(tenant_id, external_id)
            .await?)
    }

    /// Upserts a conversation by `(tenant, partition, external_id)`. A hit
    /// touches `last_active_at`; a miss inserts and reports `is_new = true`.
    pub async fn get_or_create_conversation(
        &self,
        tenant_id: Uuid,
        partition_id: Option<Uuid>,
        external_id: &str,
        agent_id: Uuid,
    ) -> Result<(Conversation, bool), ConversationError> {
        Ok(self
            .store
            .get_or_create_conversation(tenant_id, partition_id, external_id, agent_id)
            .await?)
    }

    /// Loads the live window: latest snapshot summary (if decryptable) plus
    /// all un-snapshotted messages in `created_at` order. Rows that fail to
    /// decrypt are skipped with a warning.
    pub async fn load_context(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<ConversationContext, ConversationError> {
        let mut context = ConversationContext::default();

        if let Some(snapshot) = self.store.latest_snapshot(conversation_id).await? {
            match self.crypto.decrypt_str(
                tenant_id,
                &snapshot.summary_encrypted,
                &snapshot.summary_iv,
                snapshot.key_version,
            ) {
                Ok(summary) => {
                    context.latest_snapshot_id = Some(snapshot.id);
                    context.latest_snapshot_summary = Some(summary);
                }
                Err(e) => {
                    tracing::warn!(
                        snapshot_id = %snapshot.id,
                        "skipping undecryptable snapshot: {}", e
                    );
                }
            }
        }

        for row in self.store.live_messages(conversation_id).await? {
            let content = match self.crypto.decrypt_str(
                tenant_id,
                &row.content_encrypted,
                &row.content_iv,
                row.key_version,
            ) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(message_id = %row.id, "skipping undecryptable message: {}", e);
                    continue;
                }
            };
            let token_estimate = row
                .token_estimate
                .unwrap_or_else(|| estimate_tokens(&content));
            context.token_estimate += token_estimate;
            context.messages.push(ContextMessage {
                role: row.role,
                content,
                token_estimate,
            });
        }

        Ok(context)
    }

    /// Builds the messages injected ahead of the request's own: an optional
    /// synthetic summary message, then the live history in order.
    pub fn build_injection(&self, context: &ConversationContext) -> Vec<Value> {
        let mut messages = Vec::with_capacity(context.messages.len() + 1);
        if let Some(summary) = &context.latest_snapshot_summary {
            messages.push(json!({
                "role": "system",
                "content": format!("Previous conversation summary:\n{summary}"),
            }));
        }
        for msg in &context.messages {
            messages.push(json!({"role": msg.role, "content": msg.content}));
        }
        messages
    }

    /// Encrypts and appends the user/assistant pair in one statement (user
    /// row first). New rows carry `snapshot_id = NULL`.
    pub async fn store_messages(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        user_content: &str,
        assistant_content: &str,
        trace_id: Option<Uuid>,
    ) -> Result<(), ConversationError> {
        let user = self.crypto.encrypt_str(tenant_id, user_content)?;
        let assistant = self.crypto.encrypt_str(tenant_id, assistant_content)?;
        let key_version = self.crypto.key_version();
        self.store
            .insert_message_pair(
                conversation_id,
                (user, estimate_tokens(user_content)),
                (assistant, estimate_tokens(assistant_content)),
                key_version,
                trace_id,
            )
            .await?;
        Ok(())
    }

    /// Encrypts the summary, inserts the snapshot row, then stamps every
    /// currently-live message with the new snapshot id.
    pub async fn create_snapshot(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        summary_text: &str,
        messages_archived: i64,
    ) -> Result<Uuid, ConversationError> {
        let summary = self.crypto.encrypt_str(tenant_id, summary_text)?;
        let snapshot_id = self
            .store
            .insert_snapshot(
                conversation_id,
                &summary,
                self.crypto.key_version(),
                messages_archived,
            )
            .await?;
        Ok(snapshot_id)
    }
}

//! Asynchronous trace recording: encrypt, queue, batch-write.
//!
//! [`TraceRecorder::record`] is non-blocking and infallible from the caller's
//! point of view: bodies are encrypted, the row joins a mutex-guarded queue,
//! and reaching [`FLUSH_THRESHOLD`] entries triggers an async flush. A
//! background task flushes every [`FLUSH_INTERVAL`] regardless; it is
//! cancelled via token on [`stop`](TraceRecorder::stop) and never keeps the
//! process alive on its own. Flushes swap the batch out atomically and a
//! failed write is logged and dropped — trace loss is preferred to ever
//! blocking the live request path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::crypto::CryptoService;
use crate::store::SqliteStore;

/// Queue length that triggers an immediate flush.
pub const FLUSH_THRESHOLD: usize = 100;
/// Background flush period.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// One completed request/response pair, before encryption.
#[derive(Debug, Clone)]
pub struct TraceDraft {
    /// Row id, generated by the caller so conversation messages can link to
    /// their trace before the row is flushed.
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub request_id: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub endpoint: String,
    pub request_body: Value,
    pub response_body: Option<Value>,
    pub latency_ms: i64,
    pub ttfb_ms: Option<i64>,
    pub gateway_overhead_ms: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub status_code: Option<u16>,
}

/// An encrypted trace row ready for the store.
#[derive(Debug, Clone)]
pub struct TraceRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub request_id: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub endpoint: String,
    pub request_body_encrypted: String,
    pub request_body_iv: String,
    pub response_body_encrypted: Option<String>,
    pub response_body_iv: Option<String>,
    pub latency_ms: i64,
    pub ttfb_ms: Option<i64>,
    pub gateway_overhead_ms: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub status_code: Option<u16>,
    pub encryption_key_version: u32,
    pub created_at: DateTime<Utc>,
}

struct Inner {
    queue: Mutex<Vec<TraceRow>>,
    store: Arc<SqliteStore>,
    crypto: Arc<CryptoService>,
    cancel: CancellationToken,
}

impl Inner {
    /// Swaps the batch out under the lock, then writes it. Failures are
    /// logged and the batch is not retried.
    async fn flush(&self) {
        let batch = match self.queue.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(e) => {
                tracing::error!("trace queue lock failed (poisoned?): {}", e);
                return;
            }
        };
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(e) = self.store.insert_traces(batch).await {
            tracing::error!("trace flush failed, dropping {} rows: {}", count, e);
        } else {
            tracing::debug!("flushed {} trace rows", count);
        }
    }
}

/// Singleton recorder bound at startup and shared by all request handlers.
#[derive(Clone)]
pub struct TraceRecorder {
    inner: Arc<Inner>,
}

impl TraceRecorder {
    /// Builds the recorder and spawns the periodic flusher.
    pub fn start(store: Arc<SqliteStore>, crypto: Arc<CryptoService>) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Vec::new()),
            store,
            crypto,
            cancel: CancellationToken::new(),
        });
        let flusher = inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = flusher.cancel.cancelled() => break,
                    _ = tick.tick() => flusher.flush().await,
                }
            }
        });
        Self { inner }
    }

    /// Encrypts and enqueues one trace. Never blocks the caller and never
    /// fails: an encryption problem drops the trace with an error log.
    pub fn record(&self, draft: TraceDraft) {
        let crypto = &self.inner.crypto;
        let request = match crypto.encrypt_str(draft.tenant_id, &draft.request_body.to_string()) {
            Ok(enc) => enc,
            Err(e) => {
                tracing::error!(request_id = %draft.request_id, "dropping trace, request encrypt failed: {}", e);
                return;
            }
        };
        let response = match &draft.response_body {
            Some(body) => match crypto.encrypt_str(draft.tenant_id, &body.to_string()) {
                Ok(enc) => Some(enc),
                Err(e) => {
                    tracing::error!(request_id = %draft.request_id, "trace response encrypt failed, storing without body: {}", e);
                    None
                }
            },
            None => None,
        };

        let row = TraceRow {
            id: draft.id,
            tenant_id: draft.tenant_id,
            request_id: draft.request_id,
            model: draft.model,
            provider: draft.provider,
            endpoint: draft.endpoint,
            request_body_encrypted: request.ciphertext,
            request_body_iv: request.iv,
            response_body_encrypted: response.as_ref().map(|r| r.ciphertext.clone()),
            response_body_iv: response.map(|r| r.iv),
            latency_ms: draft.latency_ms,
            ttfb_ms: draft.ttfb_ms,
            gateway_overhead_ms: draft.gateway_overhead_ms,
            prompt_tokens: draft.prompt_tokens,
            completion_tokens: draft.completion_tokens,
            total_tokens: draft.total_tokens,
            status_code: draft.status_code,
            encryption_key_version: self.inner.crypto.key_version(),
            created_at: Utc::now(),
        };

        let should_flush = match self.inner.queue.lock() {
            Ok(mut queue) => {
                queue.push(row);
                queue.len() >= FLUSH_THRESHOLD
            }
            Err(e) => {
                tracing::error!("trace queue lock failed (poisoned?), dropping trace: {}", e);
                false
            }
        };
        if should_flush {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.flush().await });
        }
    }

    /// Flushes the current batch immediately. Used on graceful shutdown.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Cancels the periodic flusher. The in-memory batch is not drained.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Current queue depth (rows recorded but not yet flushed).
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

//! # Weft
//!
//! Core library of the Weft multi-tenant LLM gateway. The HTTP surface lives
//! in the `serve` crate; everything here is transport-agnostic:
//!
//! - [`crypto`]: AES-256-GCM with per-tenant HKDF-derived keys ([`CryptoService`]).
//! - [`tenant`]: the tenant/agent/API-key model and the resolved [`TenantContext`].
//! - [`cache`]: key-hash → context LRU ([`TenantCache`], [`hash_api_key`]).
//! - [`resolve`]: agent → tenant → parent chain resolution ([`Resolver`], [`Directory`]).
//! - [`merge`]: merge-policy rewrite of outgoing chat bodies ([`merge::apply`]).
//! - [`provider`]: upstream adapters behind one [`Provider`] contract
//!   (OpenAI-compatible incl. Ollama, Azure).
//! - [`sse`]: byte-exact SSE pass-through with side-channel capture
//!   ([`sse::passthrough`], [`SseCapture`]).
//! - [`mcp`]: JSON-RPC `tools/call` round-trip ([`McpRoundTrip`]).
//! - [`conversation`]: encrypted append-only message log and snapshots
//!   ([`ConversationManager`]).
//! - [`store`]: SQLite persistence shared by the above ([`SqliteStore`]).
//! - [`trace`]: asynchronous encrypted trace recording ([`TraceRecorder`]).
//!
//! Per chat request the serve crate drives: auth middleware → resolver (on
//! cache miss) → merge engine → conversation injection → provider adapter →
//! SSE pipe or MCP round-trip → fire-and-forget trace record.
//!
//! The "singletons" (cache, crypto, recorder, store) are plain values
//! constructed once at startup and passed into handlers; nothing here is
//! ambient global state.

pub mod cache;
pub mod conversation;
pub mod crypto;
pub mod mcp;
pub mod merge;
pub mod provider;
pub mod resolve;
pub mod sse;
pub mod store;
pub mod tenant;
pub mod trace;

pub use cache::{hash_api_key, TenantCache};
pub use conversation::{ConversationContext, ConversationError, ConversationManager};
pub use crypto::{CryptoError, CryptoService, Encrypted};
pub use mcp::{McpOutcome, McpRoundTrip};
pub use provider::{
    provider_for, FallbackCredentials, Provider, ProviderError, ProxyRequest, ProxyResponse,
};
pub use resolve::{Directory, ResolveError, Resolver};
pub use sse::{passthrough, SseCapture};
pub use store::{SqliteStore, StoreError};
pub use tenant::{
    Agent, AgentConfig, ApiKeyRecord, KeyStatus, ListPolicy, McpEndpoint, MergePolicies,
    ProviderConfig, ProviderKind, SystemPromptPolicy, Tenant, TenantContext, TenantStatus,
};
pub use trace::{TraceDraft, TraceRecorder};

//! End-to-end tests: real gateway on a random port, mock upstreams in-process.

mod auth;
mod chat_proxy;
mod common;
mod conversations;
mod mcp_round_trip;
mod sse_stream;

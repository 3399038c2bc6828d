//! User-facing Rust SDK for the Chatter realtime chat service.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP client for configuration and health endpoints.
//! - `auth`: session token storage, expiry, and legacy-key migration.
//! - `stream`: reconnecting Server-Sent-Events client and event model.
//! - `retry`: shared retry and backoff utilities.

/// HTTP API client and request/response types.
pub mod api;
/// Session token lifecycle and the auth collaborator trait.
pub mod auth;
/// Retry and backoff helpers used across the SDK.
pub mod retry;
/// Realtime event stream client, event model, and transport.
pub mod stream;

//! Realtime event stream modules.
//!
//! - `client`: reconnecting subscription with kind-keyed listener dispatch.
//! - `event`: event model shared with the stream service.
//! - `sse`: frame decoder for the chunked byte stream.
//! - `transport`: byte stream acquisition over HTTP.

/// Reconnecting event stream client and listener registry.
pub mod client;
/// Stream event model and kind tags.
pub mod event;
/// SSE framing decoder.
pub mod sse;
/// Transport trait and HTTP implementation.
pub mod transport;

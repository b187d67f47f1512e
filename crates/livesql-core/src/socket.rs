//! Client socket seam.
//!
//! The transport (websocket, SSE, ...) lives outside this crate. Subscriptions
//! and sync sessions only need to push messages to a client and, for sync, to
//! ask it questions and await the answer.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A connected client.
#[async_trait]
pub trait ClientSocket: Send + Sync {
    /// Stable identifier, used to tear down everything the client owns on
    /// disconnect.
    fn id(&self) -> &str;

    /// Fire-and-forget message on `channel`.
    fn emit(&self, channel: &str, payload: Value);

    /// Sends `payload` on `channel` and waits for the client's reply.
    async fn request(&self, channel: &str, payload: Value) -> Result<Value>;
}

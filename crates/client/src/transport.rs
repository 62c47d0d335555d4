//! Transport abstraction for the MCP conversation.

use async_trait::async_trait;
use serde_json::Value;

use mcporter_domain::Result;

use crate::protocol::JsonRpcResponse;

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the corresponding response.
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a JSON-RPC notification (no response expected).
    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if the transport is still usable.
    fn is_alive(&self) -> bool;

    /// Tear the transport down. Idempotent; never blocks indefinitely.
    async fn close(&self);
}

/// Capability handed to HTTP transports to attach a bearer token per
/// request, refreshing behind the scenes when the cached token expires.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A valid access token, or `None` when no token has been obtained yet
    /// (the first connect of an OAuth flow runs anonymously and is expected
    /// to be rejected with 401).
    async fn bearer_token(&self) -> Result<Option<String>>;
}

//! `McpClient` — the typed MCP conversation over any transport.

use serde_json::Value;

use mcporter_domain::{Error, Result};

use crate::protocol::{
    self, InitializeResult, ToolCallResult, ToolDef, ToolsListResult,
};
use crate::transport::McpTransport;

/// An MCP client bound to one transport. `connect` performs the protocol
/// handshake; the typed operations map onto `tools/*` and `resources/*`
/// requests.
pub struct McpClient {
    transport: Box<dyn McpTransport>,
    client_name: String,
}

impl McpClient {
    pub fn new(transport: Box<dyn McpTransport>, client_name: impl Into<String>) -> Self {
        Self {
            transport,
            client_name: client_name.into(),
        }
    }

    /// Perform the MCP handshake: `initialize` followed by the
    /// `notifications/initialized` notification.
    pub async fn connect(&self) -> Result<InitializeResult> {
        let params = protocol::initialize_params(&self.client_name);
        let params_value = serde_json::to_value(&params)?;

        let resp = self
            .transport
            .send_request("initialize", Some(params_value))
            .await?;
        let result_value = resp
            .into_result()
            .map_err(|e| Error::Protocol(format!("initialize failed: {e}")))?;
        let init: InitializeResult = serde_json::from_value(result_value)
            .map_err(|e| Error::Protocol(format!("bad initialize result: {e}")))?;

        self.transport
            .send_notification("notifications/initialized", None)
            .await?;

        tracing::debug!(
            server = ?init.server_info.as_ref().map(|s| s.name.as_str()),
            protocol = %init.protocol_version,
            "MCP handshake complete"
        );
        Ok(init)
    }

    /// Discover tools, following `nextCursor` pagination to the end.
    pub async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let resp = self.transport.send_request("tools/list", params).await?;
            let result_value = resp
                .into_result()
                .map_err(|e| Error::Protocol(format!("tools/list failed: {e}")))?;
            let page: ToolsListResult = serde_json::from_value(result_value)
                .map_err(|e| Error::Protocol(format!("bad tools/list result: {e}")))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Call a tool. Tool-level faults come back inside the result envelope
    /// (`is_error`), not as an `Err`.
    pub async fn call_tool(&self, tool: &str, arguments: Option<Value>) -> Result<ToolCallResult> {
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments.unwrap_or_else(|| serde_json::json!({})),
        });

        let resp = self.transport.send_request("tools/call", Some(params)).await?;
        let result_value = resp
            .into_result()
            .map_err(|e| Error::Protocol(format!("tools/call '{tool}' failed: {e}")))?;
        serde_json::from_value(result_value)
            .map_err(|e| Error::Protocol(format!("bad tools/call result: {e}")))
    }

    /// List resources; the raw result is passed through untyped.
    pub async fn list_resources(&self, params: Option<Value>) -> Result<Value> {
        let resp = self.transport.send_request("resources/list", params).await?;
        resp.into_result()
            .map_err(|e| Error::Protocol(format!("resources/list failed: {e}")))
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Tear down the transport. Idempotent.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

//! Streamable HTTP transport: JSON-RPC over per-request POSTs.
//!
//! The modern MCP HTTP transport. Each request POSTs the JSON-RPC envelope
//! to the server URL; the response body is either plain JSON or a short
//! `text/event-stream` carrying the response as a single event. The server
//! may assign a session via the `Mcp-Session-Id` header, which is echoed on
//! every subsequent request and released with a DELETE on close.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use mcporter_domain::{Error, Result};

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::sse::drain_events;
use crate::transport::{McpTransport, TokenProvider};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Best-effort deadline for the session-release DELETE on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct StreamableHttpTransport {
    http: reqwest::Client,
    url: String,
    /// Resolved at materialization; placeholders are already substituted.
    headers: BTreeMap<String, String>,
    token: Option<Arc<dyn TokenProvider>>,
    session_id: parking_lot::Mutex<Option<String>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(
        http: reqwest::Client,
        url: &str,
        headers: BTreeMap<String, String>,
        token: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        Self {
            http,
            url: url.to_string(),
            headers,
            token,
            session_id: parking_lot::Mutex::new(None),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        }
    }

    async fn post(&self, body: String) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body);
        if !self.headers.contains_key("Accept") {
            request = request.header("Accept", "application/json, text/event-stream");
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(session) = self.session_id.lock().clone() {
            request = request.header(SESSION_HEADER, session);
        }
        if let Some(provider) = &self.token {
            if let Some(bearer) = provider.bearer_token().await? {
                request = request.bearer_auth(bearer);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("POST {}: {e}", self.url)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized(format!("HTTP {status} from {}", self.url)));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP {status} from {}", self.url)));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }

        Ok(response)
    }

    /// Pull the JSON-RPC response with the given id out of a response body,
    /// which is either plain JSON or a short SSE stream.
    async fn read_response(&self, response: reqwest::Response, id: u64) -> Result<JsonRpcResponse> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("reading response from {}: {e}", self.url)))?;

        if content_type.starts_with("text/event-stream") {
            let mut buffer = body;
            // A trailing partial event is still parseable after padding.
            buffer.push_str("\n\n");
            for event in drain_events(&mut buffer) {
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                }
            }
            return Err(Error::Transport(format!(
                "no response for request {id} in event stream from {}",
                self.url
            )));
        }

        serde_json::from_str::<JsonRpcResponse>(&body).map_err(|e| {
            Error::Transport(format!(
                "bad JSON-RPC response from {}: {e}",
                self.url
            ))
        })
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Transport("transport is closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, url = %self.url, "sending MCP request over HTTP");
        let response = self.post(json).await?;
        self.read_response(response, id).await
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut notif = JsonRpcNotification::new(method);
        notif.params = params;
        let json = serde_json::to_string(&notif)?;
        self.post(json).await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        // Release the server-side session if one was assigned.
        let session = self.session_id.lock().take();
        if let Some(session) = session {
            let request = self
                .http
                .delete(&self.url)
                .header(SESSION_HEADER, session)
                .timeout(CLOSE_TIMEOUT);
            if let Err(e) = request.send().await {
                tracing::debug!(error = %e, url = %self.url, "session release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> StreamableHttpTransport {
        StreamableHttpTransport::new(
            reqwest::Client::new(),
            "https://example.com/mcp",
            BTreeMap::new(),
            None,
        )
    }

    #[test]
    fn starts_alive_without_io() {
        let t = transport();
        assert!(t.is_alive());
        assert!(t.session_id.lock().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_without_session() {
        let t = transport();
        t.close().await;
        t.close().await;
        assert!(!t.is_alive());
    }

    #[tokio::test]
    async fn request_after_close_fails() {
        let t = transport();
        t.close().await;
        let err = t.send_request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}

//! SSE transport: the fallback HTTP transport for servers that do not
//! implement streamable HTTP.
//!
//! A GET against the server URL opens the event stream. The server's first
//! `endpoint` event names the POST target for requests; responses flow back
//! on the stream as `message` events and are routed to waiting callers by
//! request id.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use mcporter_domain::{Error, Result};

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{McpTransport, TokenProvider};

/// Deadline for the server to announce its message endpoint.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-request response deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One parsed SSE event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Extract complete events from an SSE buffer.
///
/// Events are delimited by `\n\n`. Each block may contain `event:`,
/// `data:`, `id:`, or `retry:` lines; multiple `data:` lines join with a
/// newline. The buffer is drained in-place: consumed bytes are removed and
/// any trailing partial event remains for the next call.
pub(crate) fn drain_events(buffer: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // remove the \n\n delimiter

        let mut event = None;
        let mut data_lines = Vec::new();
        for line in block.lines() {
            let line = line.trim();
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim().to_string());
            }
        }

        let data = data_lines.join("\n");
        if event.is_some() || !data.is_empty() {
            events.push(SseEvent { event, data });
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SseShared {
    http: reqwest::Client,
    headers: BTreeMap<String, String>,
    token: Option<Arc<dyn TokenProvider>>,
    endpoint: tokio::sync::OnceCell<reqwest::Url>,
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    alive: AtomicBool,
}

/// SSE transport over a long-lived GET stream plus per-request POSTs.
pub struct SseTransport {
    shared: Arc<SseShared>,
    next_id: AtomicU64,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the server's endpoint event.
    ///
    /// Headers must already be resolved. A 401/403 on the GET surfaces as a
    /// typed [`Error::Unauthorized`] so the orchestrator can react.
    pub async fn connect(
        http: reqwest::Client,
        url: &str,
        headers: BTreeMap<String, String>,
        token: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self> {
        let base = reqwest::Url::parse(url)
            .map_err(|e| Error::Transport(format!("bad SSE url '{url}': {e}")))?;

        let mut request = http.get(base.clone()).header("Accept", "text/event-stream");
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(provider) = &token {
            if let Some(bearer) = provider.bearer_token().await? {
                request = request.bearer_auth(bearer);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("SSE connect to {url}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized(format!("HTTP {status} from {url}")));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP {status} from {url}")));
        }

        let shared = Arc::new(SseShared {
            http,
            headers,
            token,
            endpoint: tokio::sync::OnceCell::new(),
            pending: parking_lot::Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        });

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stream(response, base, shared.clone(), endpoint_tx));

        let transport = Self {
            shared,
            next_id: AtomicU64::new(1),
            reader: parking_lot::Mutex::new(Some(reader)),
        };

        match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(endpoint)) => {
                let _ = transport.shared.endpoint.set(endpoint);
                Ok(transport)
            }
            Ok(Err(_)) => {
                transport.close().await;
                Err(Error::Transport(format!(
                    "SSE stream from {url} closed before announcing an endpoint"
                )))
            }
            Err(_) => {
                transport.close().await;
                Err(Error::Transport(format!(
                    "SSE server at {url} did not announce an endpoint within {ENDPOINT_TIMEOUT:?}"
                )))
            }
        }
    }

    async fn post_message(&self, body: String) -> Result<Option<JsonRpcResponse>> {
        let endpoint = self
            .shared
            .endpoint
            .get()
            .ok_or_else(|| Error::Transport("SSE endpoint not established".into()))?;

        let mut request = self
            .shared
            .http
            .post(endpoint.clone())
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in &self.shared.headers {
            request = request.header(name, value);
        }
        if let Some(provider) = &self.shared.token {
            if let Some(bearer) = provider.bearer_token().await? {
                request = request.bearer_auth(bearer);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("SSE post to {endpoint}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Unauthorized(format!("HTTP {status} from {endpoint}")));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP {status} from {endpoint}")));
        }

        // Some servers answer the POST directly instead of (or as well as)
        // emitting the response on the stream.
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        if is_json {
            let body = response.text().await.unwrap_or_default();
            if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&body) {
                return Ok(Some(resp));
            }
        }
        Ok(None)
    }
}

/// Pump the event stream: resolve the endpoint, then route `message`
/// responses to their waiters.
async fn read_stream(
    mut response: reqwest::Response,
    base: reqwest::Url,
    shared: Arc<SseShared>,
    endpoint_tx: oneshot::Sender<reqwest::Url>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut buffer = String::new();

    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for event in drain_events(&mut buffer) {
                    match event.event.as_deref() {
                        Some("endpoint") => {
                            match base.join(event.data.trim()) {
                                Ok(url) => {
                                    if let Some(tx) = endpoint_tx.take() {
                                        let _ = tx.send(url);
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        endpoint = %event.data,
                                        error = %e,
                                        "SSE server announced an unparseable endpoint"
                                    );
                                }
                            }
                        }
                        Some("message") | None => {
                            match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                                Ok(resp) => {
                                    let waiter = shared.pending.lock().remove(&resp.id);
                                    match waiter {
                                        Some(tx) => {
                                            let _ = tx.send(resp);
                                        }
                                        None => tracing::debug!(
                                            id = resp.id,
                                            "SSE response with no waiter, dropping"
                                        ),
                                    }
                                }
                                Err(_) => tracing::debug!(
                                    data = %event.data,
                                    "skipping non-response SSE message"
                                ),
                            }
                        }
                        Some(other) => {
                            tracing::debug!(event = other, "ignoring SSE event");
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "SSE stream error");
                break;
            }
        }
    }

    shared.alive.store(false, Ordering::SeqCst);
    // Wake every waiter; dropped senders surface as transport errors.
    shared.pending.lock().clear();
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(Error::Transport("SSE stream is closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        tracing::debug!(id, method, "sending MCP request over SSE");
        match self.post_message(json).await {
            Ok(Some(resp)) => {
                self.shared.pending.lock().remove(&id);
                return Ok(resp);
            }
            Ok(None) => {}
            Err(e) => {
                self.shared.pending.lock().remove(&id);
                return Err(e);
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::Transport("SSE stream closed mid-request".into())),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(Error::Timeout(REQUEST_TIMEOUT))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut notif = JsonRpcNotification::new(method);
        notif.params = params;
        let json = serde_json::to_string(&notif)?;
        self.post_message(json).await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.pending.lock().clear();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_event_with_name() {
        let mut buf = String::from("event: endpoint\ndata: /messages?session=abc\n\n");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?session=abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_unnamed_event() {
        let mut buf = String::from("data: {\"hello\":\"world\"}\n\n");
        let events = drain_events(&mut buf);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "{\"hello\":\"world\"}");
    }

    #[test]
    fn drain_multiple_events() {
        let mut buf = String::from("data: first\n\ndata: second\n\n");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn drain_partial_event_stays_in_buffer() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn drain_multi_line_data_joins_with_newline() {
        let mut buf = String::from("data: line one\ndata: line two\n\n");
        let events = drain_events(&mut buf);
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn drain_ignores_id_and_retry_lines() {
        let mut buf = String::from("event: message\nid: 42\nretry: 5000\ndata: payload\n\n");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "payload");
    }

    #[test]
    fn drain_skips_fully_empty_blocks() {
        let mut buf = String::from("\n\n");
        assert!(drain_events(&mut buf).is_empty());
    }

    #[test]
    fn drain_incremental_buffering() {
        let mut buf = String::from("data: chunk1");
        assert!(drain_events(&mut buf).is_empty());
        buf.push_str("\n\ndata: chunk2\n\n");
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn relative_endpoint_resolves_against_base() {
        let base = reqwest::Url::parse("https://example.com/sse").unwrap();
        let joined = base.join("/messages?session=1").unwrap();
        assert_eq!(joined.as_str(), "https://example.com/messages?session=1");
    }
}

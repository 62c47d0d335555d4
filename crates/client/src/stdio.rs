//! Stdio transport: a child process speaking newline-delimited JSON-RPC.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use mcporter_domain::{Error, Result};

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::reap::ChildHandle;
use crate::transport::McpTransport;

/// Maximum number of non-JSON lines to skip before declaring the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// Per-request response deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Stdio transport: communicates with a child process over stdin/stdout.
///
/// Each JSON-RPC message is a single newline-delimited line. The
/// `request_lock` serializes entire request/response cycles to prevent
/// response mismatching when multiple callers use the same server.
pub struct StdioTransport {
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: ChildHandle,
    /// Serializes full request/response cycles.
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    /// Spawn a child process. `env` entries must already be resolved; the
    /// caller drops entries whose resolved value is empty before calling.
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: &Path,
        env: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            // stderr is always piped, never inherited; the reaper buffers it.
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if cwd.as_os_str().is_empty() {
            tracing::debug!(command, "no cwd for stdio server, inheriting");
        } else {
            cmd.current_dir(cwd);
        }
        for (key, value) in &env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Transport(format!("failed to spawn '{command}': {e}"))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::Transport(format!("failed to capture stdin of '{command}'"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Transport(format!("failed to capture stdout of '{command}'"))
        })?;

        let command_line = if args.is_empty() {
            command.to_string()
        } else {
            format!("{command} {}", args.join(" "))
        };
        tracing::debug!(command = %command_line, cwd = %cwd.display(), "spawned stdio MCP server");

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: ChildHandle::supervise(child, command_line),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    /// Root process id of the child, for diagnostics and tests.
    pub fn pid(&self) -> Option<u32> {
        self.child.pid()
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Write a line of JSON to stdin.
    async fn write_line(&self, json: &str) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Transport("MCP server process has exited".into()));
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::Transport("stdin already closed".into()))?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read a line of JSON from stdout, skipping any empty or non-JSON lines.
    ///
    /// Gives up after [`MAX_SKIP_LINES`] non-JSON lines to prevent spinning
    /// on a misconfigured server that writes logging to stdout.
    async fn read_line(&self) -> Result<String> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Transport("MCP server process has exited".into()));
        }

        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes_read = stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(Error::Transport("MCP server process has exited".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Skip lines that don't look like JSON (e.g. logging on stdout).
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(Error::Transport(
                    "MCP server produced too many non-JSON lines on stdout".into(),
                ));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from MCP server stdout");
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        // Serialize the entire request/response cycle so concurrent callers
        // cannot read each other's responses.
        let _guard = self.request_lock.lock().await;

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, "sending MCP request");
        self.write_line(&json).await?;

        // Read lines until we get a response matching our ID. Servers may
        // interleave notifications; those have no `id` and are skipped.
        let result = tokio::time::timeout(REQUEST_TIMEOUT, async {
            loop {
                let line = self.read_line().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                    tracing::debug!(
                        expected_id = id,
                        got_id = resp.id,
                        "received response for different request, continuing"
                    );
                    continue;
                }
                tracing::debug!(line = %line, "skipping non-matching message from MCP server");
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout(REQUEST_TIMEOUT)),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut notif = JsonRpcNotification::new(method);
        notif.params = params;
        let json = serde_json::to_string(&notif)?;
        tracing::debug!(method, "sending MCP notification");
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.child.has_exited()
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Drop stdin first: a well-behaved server exits on EOF, which lets
        // the reaper's soft-close step succeed without signals.
        {
            let mut guard = self.stdin.lock().await;
            if let Some(mut stdin) = guard.take() {
                if let Err(e) = stdin.shutdown().await {
                    tracing::debug!(error = %e, "error closing MCP server stdin");
                }
            }
        }
        self.child.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sh(script: &str) -> StdioTransport {
        StdioTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            Path::new("."),
            BTreeMap::new(),
        )
        .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_response_roundtrip() {
        // Replies to the first request with a canned response for id 1.
        let transport = spawn_sh(
            r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#,
        );
        let resp = transport.send_request("test/echo", None).await.unwrap();
        assert_eq!(resp.id, 1);
        assert_eq!(resp.result.unwrap()["ok"], serde_json::json!(true));
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_json_lines_are_skipped() {
        let transport = spawn_sh(
            r#"read line; echo 'starting up...'; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{}}'"#,
        );
        let resp = transport.send_request("test/echo", None).await.unwrap();
        assert_eq!(resp.id, 1);
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_server_surfaces_transport_error() {
        let transport = spawn_sh("exit 0");
        // Give the child time to exit before we talk to it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = transport.send_request("test/echo", None).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_) | Error::Io(_)));
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn env_is_passed_to_child() {
        let transport = StdioTransport::spawn(
            "sh",
            &[
                "-c".to_string(),
                r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"val":"'"$MCP_TEST_VAL"'"}}\n'"#
                    .to_string(),
            ],
            Path::new("."),
            BTreeMap::from([("MCP_TEST_VAL".to_string(), "hello".to_string())]),
        )
        .unwrap();
        let resp = transport.send_request("test/echo", None).await.unwrap();
        assert_eq!(resp.result.unwrap()["val"], serde_json::json!("hello"));
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_twice_is_safe() {
        let transport = spawn_sh("read line");
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_alive());
    }
}

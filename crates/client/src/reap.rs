//! Child process supervision for stdio transports.
//!
//! Every stdio child gets a [`ChildHandle`]: its stderr is drained into a
//! bounded in-memory buffer (never inherited), and teardown escalates
//! stdin-close → SIGTERM → SIGKILL across the whole process tree, each step
//! bounded by its own timeout. Shutdown never blocks indefinitely: if the
//! child survives SIGKILL a single warning is logged and control returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Child;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeouts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wait after closing stdin before signalling.
pub const SOFT_CLOSE_TIMEOUT: Duration = Duration::from_millis(700);
/// Wait after SIGTERM before escalating to SIGKILL.
pub const SIGTERM_TIMEOUT: Duration = Duration::from_millis(700);
/// Wait after SIGKILL before giving up.
pub const SIGKILL_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on buffered child stderr.
const STDERR_BUFFER_MAX: usize = 64 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stderr buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded stderr accumulator. When full, the oldest quarter is dropped so
/// the tail of the output survives.
pub struct StderrBuffer {
    text: String,
    max_chars: usize,
}

impl StderrBuffer {
    fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            max_chars,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.max_chars {
            let keep = self.max_chars * 3 / 4;
            let drain_count = self.text.len() - keep;
            // Find a char boundary to avoid splitting a multi-byte character.
            let mut boundary = drain_count;
            while boundary < self.text.len() && !self.text.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.text.drain(..boundary);
        }
    }

    fn snapshot(&self) -> String {
        self.text.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChildHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns a spawned child for the duration of a stdio transport.
pub struct ChildHandle {
    pid: Option<u32>,
    command_line: String,
    child: tokio::sync::Mutex<Child>,
    stderr: Arc<Mutex<StderrBuffer>>,
    /// `Some(code)` once an exit status has been observed; `Some(None)`
    /// means the child died to a signal.
    exit_code: Mutex<Option<Option<i32>>>,
    reaped: AtomicBool,
}

impl ChildHandle {
    /// Take ownership of a freshly spawned child. The child's stderr must
    /// still be attached (piped); it is moved into a background reader that
    /// fills the stderr buffer.
    pub fn supervise(mut child: Child, command_line: String) -> Self {
        let stderr_buf = Arc::new(Mutex::new(StderrBuffer::new(STDERR_BUFFER_MAX)));

        if let Some(mut stderr) = child.stderr.take() {
            let buf = stderr_buf.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            buf.lock().push(&String::from_utf8_lossy(&chunk[..n]));
                        }
                    }
                }
            });
        }

        Self {
            pid: child.id(),
            command_line,
            child: tokio::sync::Mutex::new(child),
            stderr: stderr_buf,
            exit_code: Mutex::new(None),
            reaped: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Everything the child has written to stderr so far (bounded).
    pub fn stderr_snapshot(&self) -> String {
        self.stderr.lock().snapshot()
    }

    /// Exit code once observed. `Some(None)` means killed by a signal.
    pub fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit_code.lock()
    }

    /// Whether the child has been observed to exit.
    pub fn has_exited(&self) -> bool {
        if self.exit_code().is_some() {
            return true;
        }
        if let Ok(mut child) = self.child.try_lock() {
            if let Ok(Some(status)) = child.try_wait() {
                *self.exit_code.lock() = Some(status.code());
                return true;
            }
        }
        false
    }

    /// Tear the child down with bounded escalation. Idempotent. The caller
    /// must have dropped its stdin handle first so the soft-close step can
    /// take effect.
    pub async fn close(&self) {
        if self.reaped.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut child = self.child.lock().await;
        let status = self.escalate(&mut child).await;
        if let Some(status) = status {
            *self.exit_code.lock() = Some(status.code());
        }
        self.emit_stderr();
    }

    async fn escalate(&self, child: &mut Child) -> Option<std::process::ExitStatus> {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }

        // Step 1: stdin is closed; give the child a moment to exit cleanly.
        if let Ok(result) = tokio::time::timeout(SOFT_CLOSE_TIMEOUT, child.wait()).await {
            return result.ok();
        }

        // Step 2: SIGTERM across the tree.
        tracing::debug!(pid = ?self.pid, command = %self.command_line, "child ignored close, sending SIGTERM");
        self.signal_tree(Signal::Term, child);
        if let Ok(result) = tokio::time::timeout(SIGTERM_TIMEOUT, child.wait()).await {
            return result.ok();
        }

        // Step 3: SIGKILL across the tree.
        tracing::debug!(pid = ?self.pid, command = %self.command_line, "child ignored SIGTERM, sending SIGKILL");
        self.signal_tree(Signal::Kill, child);
        if let Ok(result) = tokio::time::timeout(SIGKILL_TIMEOUT, child.wait()).await {
            return result.ok();
        }

        tracing::warn!(
            pid = ?self.pid,
            command = %self.command_line,
            "child still alive after SIGKILL, giving up"
        );
        None
    }

    #[cfg(unix)]
    fn signal_tree(&self, signal: Signal, _child: &mut Child) {
        let Some(root) = self.pid else { return };
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Descendants first so the root cannot respawn or re-parent them
        // mid-walk.
        for pid in descendants(root) {
            unsafe { libc::kill(pid as libc::pid_t, sig) };
        }
        unsafe { libc::kill(root as libc::pid_t, sig) };
    }

    /// Without POSIX signals the escalation stops at the root process.
    #[cfg(not(unix))]
    fn signal_tree(&self, _signal: Signal, child: &mut Child) {
        let _ = child.start_kill();
    }

    /// Dump buffered stderr when the child failed or when
    /// `MCPORTER_STDIO_LOGS=1` asks for it unconditionally.
    fn emit_stderr(&self) {
        let failed = match self.exit_code() {
            Some(Some(0)) => false,
            // Non-zero exit, signal death, or no status observed at all.
            _ => true,
        };
        let forced = std::env::var("MCPORTER_STDIO_LOGS").is_ok_and(|v| v == "1");
        if !(failed || forced) {
            return;
        }

        let output = self.stderr_snapshot();
        if output.trim().is_empty() {
            return;
        }
        tracing::warn!(
            command = %self.command_line,
            exit_code = ?self.exit_code(),
            "stderr from MCP server:\n{}",
            output.trim_end()
        );
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process tree enumeration (POSIX)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All live descendants of `root`, found via one `ps` snapshot.
#[cfg(unix)]
fn descendants(root: u32) -> Vec<u32> {
    let output = match std::process::Command::new("ps")
        .args(["-eo", "pid=,ppid="])
        .output()
    {
        Ok(out) if out.status.success() => out,
        _ => return Vec::new(),
    };
    let table = String::from_utf8_lossy(&output.stdout);
    collect_descendants(&table, root)
}

#[cfg(unix)]
fn collect_descendants(ps_table: &str, root: u32) -> Vec<u32> {
    use std::collections::HashMap;

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for line in ps_table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(ppid)) = (fields.next(), fields.next()) else {
            continue;
        };
        let (Ok(pid), Ok(ppid)) = (pid.parse::<u32>(), ppid.parse::<u32>()) else {
            continue;
        };
        children.entry(ppid).or_default().push(pid);
    }

    let mut found = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                found.push(kid);
                queue.push(kid);
            }
        }
    }
    found
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_buffer_keeps_tail_when_full() {
        let mut buf = StderrBuffer::new(100);
        for i in 0..50 {
            buf.push(&format!("line {i}\n"));
        }
        let text = buf.snapshot();
        assert!(text.len() <= 100);
        assert!(text.contains("line 49"));
        assert!(!text.contains("line 0\n"));
    }

    #[test]
    fn stderr_buffer_respects_char_boundaries() {
        let mut buf = StderrBuffer::new(16);
        buf.push("ééééééééééééééééééééé");
        // Must not panic and must still hold valid utf-8.
        assert!(buf.snapshot().chars().all(|c| c == 'é'));
    }

    #[cfg(unix)]
    #[test]
    fn collect_descendants_walks_transitive_children() {
        let table = "\
  10   1
  20  10
  30  20
  40  10
  99   1
";
        let mut pids = collect_descendants(table, 10);
        pids.sort_unstable();
        assert_eq!(pids, vec![20, 30, 40]);
    }

    #[cfg(unix)]
    #[test]
    fn collect_descendants_empty_for_leaf() {
        let table = "  10   1\n  20  10\n";
        assert!(collect_descendants(table, 20).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn collect_descendants_ignores_garbage_lines() {
        let table = "header\n  x  y\n  20  10\n";
        assert_eq!(collect_descendants(table, 10), vec![20]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_reaps_a_cooperative_child() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "read line"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().unwrap();
        drop(child.stdin.take());

        let handle = ChildHandle::supervise(child, "sh -c 'read line'".into());
        let start = std::time::Instant::now();
        handle.close().await;
        assert!(start.elapsed() < SOFT_CLOSE_TIMEOUT + Duration::from_millis(200));
        assert!(handle.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_escalates_past_ignored_sigterm() {
        // Ignores both stdin EOF and SIGTERM; only SIGKILL can end it.
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "trap '' TERM; echo boom >&2; while true; do sleep 1; done"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().unwrap();
        drop(child.stdin.take());
        let pid = child.id().unwrap();

        let handle = ChildHandle::supervise(child, "stubborn".into());
        // Give the child a moment to install its trap and write stderr.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let start = std::time::Instant::now();
        handle.close().await;
        let bound = SOFT_CLOSE_TIMEOUT + SIGTERM_TIMEOUT + SIGKILL_TIMEOUT + Duration::from_millis(200);
        assert!(
            start.elapsed() < bound,
            "close took {:?}, bound {:?}",
            start.elapsed(),
            bound
        );

        // The root process must be gone.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        assert!(!alive, "child {pid} survived close()");

        // Killed by signal → stderr was buffered and an exit was recorded.
        assert!(handle.stderr_snapshot().contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_is_idempotent() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "read line"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().unwrap();
        drop(child.stdin.take());

        let handle = ChildHandle::supervise(child, "sh".into());
        handle.close().await;
        handle.close().await;
    }
}

//! Spawn a process whose stdout is JSONL and stream the decoded values.
//!
//! The child runs in its own process group so termination reaches anything it
//! spawned. Two timeouts are enforced by a periodic tick rather than blocking
//! reads: a startup timeout (no output at all yet) and an idle timeout
//! (silence after some output). Stderr counts as output for both but is only
//! reported when the process exits non-zero on its own.
//!
//! The final stream item, if the run did not end cleanly, is exactly one
//! [`StreamError`]. It is produced only after both pipes are drained and the
//! child has been reaped.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Stderr kept for error reports, from the tail.
const STDERR_LIMIT: usize = 16 * 1024;
const MAX_TICK: Duration = Duration::from_secs(1);
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process {command} (pid {pid}) was aborted")]
    Aborted { command: String, pid: u32 },
    #[error("process {command} timed out after {}ms without any output", .after.as_millis())]
    StartupTimeout { command: String, after: Duration },
    #[error("process {command} timed out after {}ms without output", .after.as_millis())]
    IdleTimeout { command: String, after: Duration },
    #[error("process {command} exited with {}{}", describe_exit(.code, .signal), stderr_suffix(.stderr))]
    Exit {
        command: String,
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },
    #[error("I/O error on {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StartupTimeout { .. } | Self::IdleTimeout { .. })
    }
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (code, signal) {
        (Some(c), _) => format!("code {c}"),
        (None, Some(s)) => format!("signal {s}"),
        (None, None) => "unknown status".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

// ── Options ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
    /// Max silence after the first output.
    pub idle_timeout: Duration,
    /// Max wait for the first output. `None` means the idle timeout.
    pub startup_timeout: Option<Duration>,
    /// Wait between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl SpawnOptions {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            cancel: None,
            idle_timeout: Duration::from_secs(300),
            startup_timeout: None,
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn effective_startup_timeout(&self) -> Duration {
        self.startup_timeout.unwrap_or(self.idle_timeout)
    }

    fn tick_interval(&self) -> Duration {
        self.idle_timeout
            .min(self.effective_startup_timeout())
            .min(MAX_TICK)
            .max(MIN_TICK)
    }
}

// ── Stream ───────────────────────────────────────────────────────────────

pub type StreamItem = Result<Value, StreamError>;

/// Decoded stdout values in write order. Dropping the stream terminates the
/// process group.
pub struct JsonlStream {
    rx: mpsc::UnboundedReceiver<StreamItem>,
    pid: Option<u32>,
    _stop: DropGuard,
}

impl JsonlStream {
    /// Pid of the child (also its process group id). `None` if spawning failed.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Drain the stream, returning every value or the terminal error.
    pub async fn collect_values(mut self) -> Result<Vec<Value>, StreamError> {
        let mut values = Vec::new();
        while let Some(item) = self.rx.recv().await {
            values.push(item?);
        }
        Ok(values)
    }
}

impl Stream for JsonlStream {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Spawn `opts.command` and start streaming. Must be called inside a Tokio runtime.
pub fn spawn_jsonl(opts: SpawnOptions) -> JsonlStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();

    let mut cmd = Command::new(&opts.command);
    cmd.args(&opts.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(dir) = &opts.cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }

    let pid = match cmd.spawn() {
        Ok(child) => {
            let pid = child.id();
            info!(command = %opts.command, pid = ?pid, "spawned subprocess");
            tokio::spawn(drive(child, pid.unwrap_or(0), opts, tx, stop.clone()));
            pid
        }
        Err(source) => {
            warn!(command = %opts.command, "spawn failed: {source}");
            let _ = tx.send(Err(StreamError::Spawn {
                command: opts.command,
                source,
            }));
            None
        }
    };

    JsonlStream {
        rx,
        pid,
        _stop: stop.drop_guard(),
    }
}

// ── Driver ───────────────────────────────────────────────────────────────

/// Why the driver terminated the child, if it did.
#[derive(Debug, Clone, Copy)]
enum Termination {
    Aborted,
    StartupTimeout(Duration),
    IdleTimeout(Duration),
    /// Consumer dropped the stream; nothing is reported.
    Dropped,
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        // Group may not exist yet or already be gone; try the leader directly.
        // SAFETY: as above.
        unsafe { libc::kill(pid, signal) };
    }
}

fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

fn push_stderr(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
    if buf.len() > STDERR_LIMIT {
        let mut cut = buf.len() - STDERR_LIMIT;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

/// Strip the line terminator (`\n` or `\r\n`) left by `read_until`.
fn strip_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Decode one raw stdout line. `None` for blank lines and for anything that
/// is not a JSON document, including invalid UTF-8.
fn decode_line(raw: &[u8], pid: u32, command: &str) -> Option<Value> {
    let trimmed = raw.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(trimmed) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(pid, command = %command, error = %e, len = trimmed.len(), "dropping malformed JSONL line");
            None
        }
    }
}

async fn drive(
    mut child: Child,
    pid: u32,
    opts: SpawnOptions,
    tx: mpsc::UnboundedSender<StreamItem>,
    stop: CancellationToken,
) {
    let command = opts.command.clone();
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        signal_group(pid, libc::SIGKILL);
        let _ = child.wait().await;
        let _ = tx.send(Err(StreamError::Io {
            command,
            source: std::io::Error::other("child pipes were not captured"),
        }));
        return;
    };
    // Raw bytes: a line that is not UTF-8 must not end the stream.
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let mut out_line: Vec<u8> = Vec::new();
    let mut err_line: Vec<u8> = Vec::new();

    let cancel = opts.cancel.clone().unwrap_or_default();
    let idle = opts.idle_timeout;
    let startup = opts.effective_startup_timeout();
    let started = Instant::now();
    let mut last_output: Option<Instant> = None;
    let mut stderr_buf = String::new();
    let mut termination: Option<Termination> = None;
    let mut term_sent_at: Option<Instant> = None;
    let mut killed = false;
    let mut stdout_done = false;
    let mut stderr_done = false;

    let mut ticker = tokio::time::interval(opts.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if cancel.is_cancelled() {
        debug!(pid, "cancelled before first read");
        termination = Some(Termination::Aborted);
        signal_group(pid, libc::SIGTERM);
        term_sent_at = Some(Instant::now());
    }

    // Timeouts and cancellation stay armed until the child is reaped, even
    // after it has closed both pipes.
    let waited = loop {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut out_line), if !stdout_done => match read {
                Ok(0) => stdout_done = true,
                Ok(_) => {
                    last_output = Some(Instant::now());
                    if let Some(value) = decode_line(strip_newline(&out_line), pid, &command) {
                        let _ = tx.send(Ok(value));
                    }
                    out_line.clear();
                }
                Err(e) => {
                    warn!(pid, error = %e, "stdout read failed");
                    stdout_done = true;
                }
            },
            read = stderr.read_until(b'\n', &mut err_line), if !stderr_done => match read {
                Ok(0) => stderr_done = true,
                Ok(_) => {
                    last_output = Some(Instant::now());
                    let line = String::from_utf8_lossy(strip_newline(&err_line));
                    debug!(pid, "stderr: {line}");
                    push_stderr(&mut stderr_buf, &line);
                    err_line.clear();
                }
                Err(e) => {
                    warn!(pid, error = %e, "stderr read failed");
                    stderr_done = true;
                }
            },
            status = child.wait(), if stdout_done && stderr_done => break status,
            _ = cancel.cancelled(), if termination.is_none() => {
                info!(pid, command = %command, "cancellation requested, terminating");
                termination = Some(Termination::Aborted);
                signal_group(pid, libc::SIGTERM);
                term_sent_at = Some(Instant::now());
            },
            _ = stop.cancelled(), if termination.is_none() => {
                debug!(pid, "stream dropped, terminating");
                termination = Some(Termination::Dropped);
                signal_group(pid, libc::SIGTERM);
                term_sent_at = Some(Instant::now());
            },
            _ = ticker.tick() => {
                if let Some(sent) = term_sent_at {
                    if !killed && sent.elapsed() >= opts.kill_grace {
                        warn!(pid, "process group ignored SIGTERM, sending SIGKILL");
                        signal_group(pid, libc::SIGKILL);
                        killed = true;
                    }
                    continue;
                }
                let timed_out = match last_output {
                    None if started.elapsed() > startup => Some(Termination::StartupTimeout(startup)),
                    Some(at) if at.elapsed() > idle => Some(Termination::IdleTimeout(idle)),
                    _ => None,
                };
                if let Some(t) = timed_out {
                    warn!(pid, command = %command, reason = ?t, "subprocess timed out, terminating");
                    termination = Some(t);
                    signal_group(pid, libc::SIGTERM);
                    term_sent_at = Some(Instant::now());
                }
            },
        }
    };

    let status = match waited {
        Ok(s) => s,
        Err(source) => {
            let _ = tx.send(Err(StreamError::Io { command, source }));
            return;
        }
    };
    let (code, signal) = exit_parts(&status);
    debug!(pid, ?code, ?signal, "subprocess exited");

    let error = match termination {
        Some(Termination::Dropped) => None,
        Some(Termination::Aborted) => Some(StreamError::Aborted { command, pid }),
        Some(Termination::StartupTimeout(after)) => {
            Some(StreamError::StartupTimeout { command, after })
        }
        Some(Termination::IdleTimeout(after)) => Some(StreamError::IdleTimeout { command, after }),
        None if !status.success() => Some(StreamError::Exit {
            command,
            code,
            signal,
            stderr: stderr_buf,
        }),
        None => None,
    };
    if let Some(e) = error {
        let _ = tx.send(Err(e));
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

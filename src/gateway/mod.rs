//! Lifecycle and request/response contract of the automation subprocess.
//!
//! The process speaks line-delimited JSON on stdio: it announces itself with
//! a `ready` frame, then answers each [`GatewayRequest`] with a `response`
//! frame echoing the request id. Calls are serialized through one async
//! mutex, so concurrent callers queue in FIFO order.

pub mod protocol;

use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::session::{NullTranscript, TranscriptEntry, TranscriptSink};

pub use protocol::{ActionError, ActionErrorKind, GatewayFrame, GatewayRequest, GatewayResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayState {
    NotStarted,
    Starting,
    Ready,
    Busy,
    Terminating,
    Stopped,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("automation process did not become ready: {0}")]
    Startup(String),
}

impl From<GatewayError> for ActionError {
    fn from(e: GatewayError) -> Self {
        ActionError::new(ActionErrorKind::GatewayStartup, e.to_string())
    }
}

enum ReaderEvent {
    Frame(GatewayFrame),
    Unreadable(String),
    Closed,
}

struct GatewayProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: mpsc::UnboundedReceiver<ReaderEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for GatewayProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
        for t in &self.tasks {
            t.abort();
        }
    }
}

impl GatewayProcess {
    fn spawn(cfg: &GatewayConfig, sink: Arc<dyn TranscriptSink>) -> Result<Self, GatewayError> {
        let mut command = Command::new(&cfg.program);
        if !cfg.args.is_empty() {
            command.args(&cfg.args);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| GatewayError::Spawn {
            program: cfg.program.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            GatewayError::Startup("failed to capture stdin of automation process".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::Startup("failed to capture stdout of automation process".into())
        })?;
        let stderr = child.stderr.take();

        let (tx, frames) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let ev = match serde_json::from_str::<GatewayFrame>(line) {
                            Ok(frame) => ReaderEvent::Frame(frame),
                            Err(_) => ReaderEvent::Unreadable(line.to_string()),
                        };
                        if tx.send(ev).is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = tx.send(ReaderEvent::Closed);
                        break;
                    }
                }
            }
        }));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "gateway", line = %line, "automation stderr");
                    sink.browser_log(&line);
                }
            }));
        }

        info!(program = %cfg.program, pid = ?child.id(), "spawned automation process");
        Ok(Self {
            child,
            stdin: Some(stdin),
            frames,
            tasks,
        })
    }

    async fn send(&mut self, req: &GatewayRequest) -> std::io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"))?;
        let mut line = serde_json::to_vec(req)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await
    }

    async fn wait_ready(&mut self, limit: Duration) -> Result<(), GatewayError> {
        let deadline = Instant::now() + limit;
        loop {
            match timeout_at(deadline, self.frames.recv()).await {
                Err(_) => {
                    return Err(GatewayError::Startup(format!(
                        "no ready handshake within {}ms",
                        limit.as_millis()
                    )));
                }
                Ok(Some(ReaderEvent::Frame(GatewayFrame::Ready { version }))) => {
                    debug!(?version, "automation process ready");
                    return Ok(());
                }
                Ok(Some(ReaderEvent::Frame(other))) => {
                    debug!(frame = ?other, "ignoring frame before handshake");
                }
                Ok(Some(ReaderEvent::Unreadable(line))) => {
                    debug!(line = %line, "ignoring non-protocol output before handshake");
                }
                Ok(Some(ReaderEvent::Closed)) | Ok(None) => {
                    let status = self.child.try_wait().ok().flatten();
                    return Err(GatewayError::Startup(format!(
                        "process exited before handshake ({})",
                        status.map(|s| s.to_string()).unwrap_or_else(|| "stdout closed".into())
                    )));
                }
            }
        }
    }
}

struct BusyGuard<'a>(&'a StdMutex<GatewayState>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut st = lock_state(self.0);
        if *st == GatewayState::Busy {
            *st = GatewayState::Ready;
        }
    }
}

fn lock_state(m: &StdMutex<GatewayState>) -> MutexGuard<'_, GatewayState> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One owned automation process per session.
pub struct AutomationGateway {
    cfg: GatewayConfig,
    state: StdMutex<GatewayState>,
    process: Mutex<Option<GatewayProcess>>,
    next_id: AtomicU64,
    consecutive_failures: AtomicU32,
    transcript: Arc<dyn TranscriptSink>,
}

impl std::fmt::Debug for AutomationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationGateway")
            .field("program", &self.cfg.program)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

impl AutomationGateway {
    pub fn new(cfg: GatewayConfig) -> Self {
        Self::with_transcript(cfg, Arc::new(NullTranscript))
    }

    pub fn with_transcript(cfg: GatewayConfig, transcript: Arc<dyn TranscriptSink>) -> Self {
        Self {
            cfg,
            state: StdMutex::new(GatewayState::NotStarted),
            process: Mutex::new(None),
            next_id: AtomicU64::new(1),
            consecutive_failures: AtomicU32::new(0),
            transcript,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.cfg
    }

    pub fn state(&self) -> GatewayState {
        lock_state(&self.state).clone()
    }

    fn set_state(&self, next: GatewayState) {
        let mut st = lock_state(&self.state);
        debug!(from = ?*st, to = ?next, "gateway state");
        *st = next;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// True once `max_consecutive_failures` process-level failures happened in a row.
    pub fn is_unhealthy(&self) -> bool {
        self.consecutive_failures() >= self.cfg.max_consecutive_failures
    }

    fn note_failure(&self) {
        let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(consecutive = n, "automation process failure");
    }

    /// Forget earlier failures, giving the next task a fresh budget.
    pub fn clear_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Spawn the process and wait for its handshake. No-op when already running.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let mut guard = self.process.lock().await;
        if guard.is_some() && matches!(self.state(), GatewayState::Ready | GatewayState::Busy) {
            return Ok(());
        }
        // whatever is left from a failed run gets killed on drop
        guard.take();
        self.set_state(GatewayState::Starting);

        let mut proc = match GatewayProcess::spawn(&self.cfg, self.transcript.clone()) {
            Ok(p) => p,
            Err(e) => {
                self.note_failure();
                self.set_state(GatewayState::Failed(e.to_string()));
                return Err(e);
            }
        };
        if let Err(e) = proc.wait_ready(self.cfg.startup_timeout()).await {
            self.note_failure();
            self.set_state(GatewayState::Failed(e.to_string()));
            return Err(e);
        }
        *guard = Some(proc);
        self.set_state(GatewayState::Ready);
        Ok(())
    }

    /// Send one action and wait for its response or `limit`, whichever is first.
    pub async fn invoke(&self, action: &str, params: Value, limit: Duration) -> GatewayResult {
        let mut guard = self.process.lock().await;
        let Some(proc) = guard.as_mut() else {
            return Err(ActionError::new(
                ActionErrorKind::ProcessCrash,
                format!("automation process is not running ({:?})", self.state()),
            ));
        };

        self.set_state(GatewayState::Busy);
        let _busy = BusyGuard(&self.state);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = GatewayRequest {
            id,
            action: action.to_string(),
            params,
        };
        debug!(id, action, "gateway request");

        if let Err(e) = proc.send(&req).await {
            let err = ActionError::new(
                ActionErrorKind::ProcessCrash,
                format!("failed to write request: {e}"),
            );
            guard.take();
            self.note_failure();
            self.set_state(GatewayState::Failed(err.message.clone()));
            self.record(&req, &Err(err.clone()));
            return Err(err);
        }

        let deadline = Instant::now() + limit;
        let mut unreadable: Option<String> = None;
        let result = loop {
            match timeout_at(deadline, proc.frames.recv()).await {
                Err(_) => {
                    self.note_failure();
                    let Some(line) = unreadable.take() else {
                        break Err(ActionError::new(
                            ActionErrorKind::ActionTimeout,
                            format!("`{action}` timed out after {}ms", limit.as_millis()),
                        ));
                    };
                    let msg = format!(
                        "no readable response to `{action}` within {}ms; got: {}",
                        limit.as_millis(),
                        line.chars().take(200).collect::<String>()
                    );
                    if self.is_unhealthy() {
                        warn!("automation process keeps writing unreadable output");
                        guard.take();
                        self.set_state(GatewayState::Failed(msg.clone()));
                    }
                    break Err(ActionError::new(ActionErrorKind::ProcessCrash, msg));
                }
                Ok(Some(ReaderEvent::Frame(frame))) => match frame {
                    GatewayFrame::Log { message } => {
                        debug!(target: "gateway", message = %message, "automation log");
                        self.transcript.browser_log(&message);
                    }
                    GatewayFrame::Ready { .. } => {}
                    response => {
                        if let Some((rid, res)) = response.into_result() {
                            if rid == id {
                                self.clear_failures();
                                break res;
                            }
                            debug!(stale = rid, current = id, "discarding late response");
                        }
                    }
                },
                Ok(Some(ReaderEvent::Unreadable(line))) => {
                    warn!(line = %line, "unreadable output from automation process");
                    unreadable = Some(line);
                }
                Ok(Some(ReaderEvent::Closed)) | Ok(None) => {
                    let status = proc.child.try_wait().ok().flatten();
                    let msg = format!(
                        "automation process exited ({})",
                        status.map(|s| s.to_string()).unwrap_or_else(|| "stdout closed".into())
                    );
                    guard.take();
                    self.note_failure();
                    self.set_state(GatewayState::Failed(msg.clone()));
                    break Err(ActionError::new(ActionErrorKind::ProcessCrash, msg));
                }
            }
        };

        self.record(&req, &result);
        result
    }

    fn record(&self, req: &GatewayRequest, result: &GatewayResult) {
        self.transcript.record(TranscriptEntry::GatewayExchange {
            request: req.clone(),
            response: match result {
                Ok(v) => serde_json::json!({"ok": true, "data": v}),
                Err(e) => serde_json::json!({"ok": false, "error": e.to_payload()}),
            },
        });
    }

    /// Close stdin, give the process a grace period to exit, then kill it.
    pub async fn stop(&self) {
        let mut guard = self.process.lock().await;
        let Some(mut proc) = guard.take() else {
            if self.state() != GatewayState::NotStarted {
                self.set_state(GatewayState::Stopped);
            }
            return;
        };
        self.set_state(GatewayState::Terminating);
        drop(proc.stdin.take());
        match timeout(self.cfg.shutdown_grace(), proc.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "automation process exited"),
            Ok(Err(e)) => warn!(error = %e, "waiting for automation process failed"),
            Err(_) => {
                warn!("automation process ignored shutdown; killing");
                if let Err(e) = proc.child.kill().await {
                    warn!(error = %e, "kill failed");
                }
            }
        }
        // let the readers drain what the process wrote before exiting
        for task in proc.tasks.drain(..) {
            let _ = timeout(self.cfg.shutdown_grace(), task).await;
        }
        self.set_state(GatewayState::Stopped);
    }
}

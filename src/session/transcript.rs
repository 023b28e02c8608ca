use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::gateway::GatewayRequest;
use crate::llm::{Message, Usage};
use crate::session::error::SessionError;

pub const TRANSCRIPT_FILE: &str = "session.jsonl";
pub const BROWSER_LOG_FILE: &str = "agent-browser.log";

/// One line of `session.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    SessionStart { session_id: String, model: String },
    Message { message: Message },
    GatewayExchange { request: GatewayRequest, response: Value },
    Error { category: String, message: String },
    Reset,
    Usage { usage: Usage },
}

/// Append-only, best-effort persistence. Implementations must not block.
pub trait TranscriptSink: Send + Sync {
    fn record(&self, entry: TranscriptEntry);
    fn browser_log(&self, line: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullTranscript;

impl TranscriptSink for NullTranscript {
    fn record(&self, _entry: TranscriptEntry) {}
    fn browser_log(&self, _line: &str) {}
}

#[derive(Serialize)]
struct Line<'a> {
    ts: String,
    #[serde(flatten)]
    entry: &'a TranscriptEntry,
}

enum WriterCmd {
    Entry(DateTime<Utc>, TranscriptEntry),
    BrowserLog(DateTime<Utc>, String),
    Flush(oneshot::Sender<()>),
}

/// Writes the transcript from a background task fed through an unbounded channel.
#[derive(Debug)]
pub struct JsonlTranscript {
    tx: mpsc::UnboundedSender<WriterCmd>,
    closed_warned: AtomicBool,
}

/// Create `<runs_dir>/<YYYYmmdd_HHMMSS>`, adding a numeric suffix on collision.
pub fn create_run_dir(runs_dir: &Path) -> Result<PathBuf, SessionError> {
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    fs::create_dir_all(runs_dir).map_err(|e| SessionError::CreateDirError {
        path: runs_dir.display().to_string(),
        source: e,
    })?;
    let mut candidate = runs_dir.join(&stamp);
    let mut n = 1;
    while candidate.exists() {
        n += 1;
        candidate = runs_dir.join(format!("{stamp}_{n}"));
    }
    fs::create_dir(&candidate).map_err(|e| SessionError::CreateDirError {
        path: candidate.display().to_string(),
        source: e,
    })?;
    Ok(candidate)
}

fn open_append(path: &Path) -> Result<tokio::fs::File, SessionError> {
    let f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SessionError::OpenError {
            path: path.display().to_string(),
            source: e,
        })?;
    Ok(tokio::fs::File::from_std(f))
}

fn encode(ts: DateTime<Utc>, entry: &TranscriptEntry) -> Result<Vec<u8>, SessionError> {
    let mut line = serde_json::to_vec(&Line {
        ts: ts.to_rfc3339(),
        entry,
    })?;
    line.push(b'\n');
    Ok(line)
}

impl JsonlTranscript {
    /// Open both log files in `dir` and start the writer task.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        let mut transcript = open_append(&dir.join(TRANSCRIPT_FILE))?;
        let mut browser_log = open_append(&dir.join(BROWSER_LOG_FILE))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCmd>();

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let res = match cmd {
                    WriterCmd::Entry(ts, entry) => match encode(ts, &entry) {
                        Ok(line) => transcript.write_all(&line).await.map_err(SessionError::from),
                        Err(e) => Err(e),
                    },
                    WriterCmd::BrowserLog(ts, line) => {
                        let text = format!("[{}] {}\n", ts.format("%H:%M:%S%.3f"), line);
                        browser_log
                            .write_all(text.as_bytes())
                            .await
                            .map_err(SessionError::from)
                    }
                    WriterCmd::Flush(done) => {
                        let _ = transcript.flush().await;
                        let _ = browser_log.flush().await;
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(e) = res {
                    error!(error = %e, "transcript write failed");
                }
            }
            let _ = transcript.flush().await;
            let _ = browser_log.flush().await;
        });

        Ok(Self {
            tx,
            closed_warned: AtomicBool::new(false),
        })
    }

    fn send(&self, cmd: WriterCmd) {
        if self.tx.send(cmd).is_err() && !self.closed_warned.swap(true, Ordering::Relaxed) {
            warn!("transcript writer is gone; dropping entries");
        }
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(WriterCmd::Flush(done));
        let _ = wait.await;
    }
}

impl TranscriptSink for JsonlTranscript {
    fn record(&self, entry: TranscriptEntry) {
        self.send(WriterCmd::Entry(Utc::now(), entry));
    }

    fn browser_log(&self, line: &str) {
        self.send(WriterCmd::BrowserLog(Utc::now(), line.to_string()));
    }
}

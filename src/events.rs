//! Run events and notifiers.
//!
//! Components emit `RunEvent`s into an `EventSink`; a dispatcher task forwards each
//! event to every registered `Notifier`. The JSON-lines notifier leaves a record in the
//! workspace for reporting tools to consume after the run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::phase::{Phase, PhaseStatus};
use crate::scheduler::JobStatus;
use crate::throttle::Mode;

/// Events emitted while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    SessionStarted {
        session_id: Uuid,
        target: String,
        mode: Mode,
        resumed: bool,
    },
    PhaseStarted {
        phase: Phase,
    },
    PhaseResolved {
        phase: Phase,
        status: PhaseStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    JobFinished {
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<Phase>,
        job: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    Escalated {
        provider: String,
        concurrency: usize,
        rate_limit: u32,
        delay_secs: u64,
    },
    /// A tool produced a non-empty artifact.
    Finding {
        phase: Phase,
        tool: String,
        artifact: PathBuf,
        lines: usize,
    },
    SessionFinished {
        completed: usize,
        skipped: usize,
        failed: usize,
    },
}

/// An event with the time it was observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Cloneable handle used to emit events. A disabled sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Stamped>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Stamped>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.tx {
            tx.send(Stamped {
                at: Utc::now(),
                event,
            })
            .ok();
        }
    }
}

/// Receives run events. Errors are logged and never stop the run.
#[async_trait]
pub trait Notifier: Send {
    fn name(&self) -> &str;
    async fn notify(&mut self, event: &Stamped) -> Result<()>;
}

/// Logs events through `tracing`.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&mut self, event: &Stamped) -> Result<()> {
        match &event.event {
            RunEvent::Finding {
                phase,
                tool,
                artifact,
                lines,
            } => info!(%phase, tool = %tool, lines, artifact = %artifact.display(), "Finding"),
            RunEvent::Escalated { provider, .. } => {
                warn!(provider = %provider, "Throttle escalated")
            }
            _ => {}
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlNotifier {
    path: PathBuf,
    file: tokio::fs::File,
}

impl JsonlNotifier {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn notify(&mut self, event: &Stamped) -> Result<()> {
        let mut line = serde_json::to_string(event).context("Failed to serialize event")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        self.file.flush().await?;
        Ok(())
    }
}

/// Start a dispatcher task. It ends once every `EventSink` clone is dropped.
pub fn spawn_dispatcher(mut notifiers: Vec<Box<dyn Notifier>>) -> (EventSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Stamped>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for notifier in notifiers.iter_mut() {
                if let Err(e) = notifier.notify(&event).await {
                    warn!(notifier = notifier.name(), error = %e, "Notifier failed");
                }
            }
        }
    });
    (EventSink::new(tx), handle)
}

//! Phase workers.
//!
//! A phase worker turns one pipeline phase into scheduler jobs and reports what came
//! out. The orchestrator only sees the `PhaseWorker` trait; `ToolWorker` is the
//! declarative implementation driven by a table of external tool invocations.

mod catalog;
mod tool;

pub use catalog::{ToolSpec, default_tools, expand, unknown_placeholders};
pub use tool::{ToolWorker, find_program};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::defense::DefenseSignal;
use crate::errors::WorkerError;
use crate::events::EventSink;
use crate::phase::Phase;
use crate::scheduler::JobSummary;
use crate::throttle::{Budget, ThrottleController};

/// Everything a worker needs to run one phase.
#[derive(Clone)]
pub struct PhaseContext {
    pub phase: Phase,
    pub target: String,
    pub workspace: PathBuf,
    /// `<workspace>/<phase-name>`
    pub output_dir: PathBuf,
    /// Budget snapshot taken when the phase started
    pub budget: Budget,
    pub throttle: Arc<ThrottleController>,
    pub cancel: CancellationToken,
    pub events: EventSink,
}

impl PhaseContext {
    pub fn new(
        phase: Phase,
        target: &str,
        workspace: &Path,
        budget: Budget,
        throttle: Arc<ThrottleController>,
    ) -> Self {
        Self {
            phase,
            target: target.to_string(),
            workspace: workspace.to_path_buf(),
            output_dir: phase_dir(workspace, phase),
            budget,
            throttle,
            cancel: CancellationToken::new(),
            events: EventSink::disabled(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }
}

/// Artifact directory of a phase inside a workspace.
pub fn phase_dir(workspace: &Path, phase: Phase) -> PathBuf {
    workspace.join(phase.name())
}

/// What a phase produced.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub jobs: JobSummary,
    /// Non-empty output files
    pub artifacts: Vec<PathBuf>,
    pub defensive_signal: Option<DefenseSignal>,
    /// Things the worker chose not to do, e.g. a tool with no input
    pub notes: Vec<String>,
}

impl PhaseOutcome {
    /// Some jobs failed but the phase still produced a result.
    pub fn is_partial(&self) -> bool {
        self.jobs.failed > 0
    }
}

/// Executes one phase.
#[async_trait]
pub trait PhaseWorker: Send + Sync {
    fn phase(&self) -> Phase;

    async fn run(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, WorkerError>;
}

/// Workers keyed by the phase they run.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: BTreeMap<Phase, Arc<dyn PhaseWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One `ToolWorker` per pipeline phase using the built-in tool table.
    pub fn with_default_tools() -> Self {
        let mut registry = Self::new();
        for phase in Phase::pipeline() {
            registry.register(Arc::new(ToolWorker::new(phase, default_tools(phase))));
        }
        registry
    }

    /// Register a worker, replacing any previous one for the same phase.
    pub fn register(&mut self, worker: Arc<dyn PhaseWorker>) {
        self.workers.insert(worker.phase(), worker);
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn PhaseWorker>> {
        self.workers.get(&phase).cloned()
    }

    pub fn phases(&self) -> impl Iterator<Item = Phase> + '_ {
        self.workers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

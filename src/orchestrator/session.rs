//! Top-level session driver.
//!
//! Starts a fresh session or resumes one from its checkpoint, then walks the phase
//! order: ask the state machine for the next phase, hand it to the registered worker,
//! and persist the resolution before moving on.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::defense::{DefenseProbe, DefenseSignal, NoProbe};
use crate::errors::{ConfigError, OrchestratorError, WorkerError};
use crate::events::{EventSink, RunEvent};
use crate::orchestrator::state::{DefenseState, Next, PhaseStateMachine, Session};
use crate::phase::{Phase, PhaseStatus};
use crate::scheduler::JobSummary;
use crate::summary::{PhaseReport, RunSummary};
use crate::throttle::{Budget, EscalationPolicy, Mode, ThrottleController};
use crate::workers::{PhaseContext, PhaseOutcome, WorkerRegistry};

/// Parameters for a fresh session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub target: String,
    pub mode: Mode,
    pub budget: Budget,
    /// Phases to skip on request
    pub skips: Vec<Phase>,
    /// Replace an existing checkpoint in the workspace
    pub force: bool,
}

/// Drives one session through the pipeline.
pub struct SessionOrchestrator {
    config: Config,
    registry: WorkerRegistry,
    policy: EscalationPolicy,
    probe: Arc<dyn DefenseProbe>,
    events: EventSink,
    cancel: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(config: Config, registry: WorkerRegistry) -> Self {
        let policy = config.file.escalation.clone();
        Self {
            config,
            registry,
            policy,
            probe: Arc::new(NoProbe),
            events: EventSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    /// Probe consulted once before the first phase of a fresh session.
    pub fn with_probe(mut self, probe: Arc<dyn DefenseProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a new session in the configured workspace.
    pub async fn start(&self, request: NewSession) -> Result<RunSummary, OrchestratorError> {
        let workspace = &self.config.workspace;
        self.config
            .ensure_directories()
            .map_err(|e| ConfigError::InvalidValue {
                key: "workspace".to_string(),
                value: workspace.display().to_string(),
                reason: e.to_string(),
            })?;

        let plan = self.config.file.phase_plan().with_skips(request.skips);
        let mut machine = PhaseStateMachine::open(workspace, plan)?;

        if machine.checkpoint_path().exists() && !request.force {
            return Err(ConfigError::InvalidValue {
                key: "workspace".to_string(),
                value: workspace.display().to_string(),
                reason: "already holds a checkpoint; use `reconflow resume` or pass --force"
                    .to_string(),
            }
            .into());
        }

        let mut session = Session::new(&request.target, workspace, request.mode, request.budget);
        machine.save(&mut session)?;
        info!(
            session_id = %session.session_id,
            target = %session.target,
            mode = %session.mode,
            "Session started"
        );

        let throttle = Arc::new(ThrottleController::new(request.budget, self.policy.clone()));
        let mut summary = RunSummary::new(&session.target, workspace.clone(), false);
        self.events.emit(RunEvent::SessionStarted {
            session_id: session.session_id,
            target: session.target.clone(),
            mode: session.mode,
            resumed: false,
        });

        if let Some(signal) = self.probe.probe(&session.target, &throttle).await {
            self.escalate(&mut session, &mut machine, &throttle, &signal, &mut summary)
                .await?;
        }

        self.drive(session, machine, throttle, summary).await
    }

    /// Resume the session whose checkpoint is at `checkpoint`.
    ///
    /// The workspace is the checkpoint's directory. The stored budget and defense state
    /// are used as-is; `skips` adds to the plan for the remaining phases.
    pub async fn resume(
        &self,
        checkpoint: &Path,
        skips: Vec<Phase>,
    ) -> Result<RunSummary, OrchestratorError> {
        let workspace = &self.config.workspace;
        let plan = self.config.file.phase_plan().with_skips(skips);
        let machine = PhaseStateMachine::open(workspace, plan)?;

        let mut session = PhaseStateMachine::load(checkpoint)?;
        if session.workspace != *workspace {
            info!(
                stored = %session.workspace.display(),
                actual = %workspace.display(),
                "Workspace moved since last save"
            );
            session.workspace = workspace.clone();
        }
        info!(
            session_id = %session.session_id,
            target = %session.target,
            next = %session.next_unresolved(),
            resolved = session.resolved_count(),
            "Resuming session"
        );

        let throttle = Arc::new(ThrottleController::restore(
            session.budget,
            self.policy.clone(),
            session.defense.escalated_by().map(String::from),
        ));
        let mut summary = RunSummary::new(&session.target, workspace.clone(), true);
        if let Some(provider) = session.defense.escalated_by() {
            summary.escalation = Some(provider.to_string());
        }
        self.events.emit(RunEvent::SessionStarted {
            session_id: session.session_id,
            target: session.target.clone(),
            mode: session.mode,
            resumed: true,
        });

        self.drive(session, machine, throttle, summary).await
    }

    async fn drive(
        &self,
        mut session: Session,
        mut machine: PhaseStateMachine,
        throttle: Arc<ThrottleController>,
        mut summary: RunSummary,
    ) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();

        loop {
            let next = machine.advance(&mut session)?;
            for (phase, reason) in machine.drain_skips() {
                let detail = reason.to_string();
                self.resolved(phase, PhaseStatus::Skipped, Some(detail.clone()));
                summary.record(report(phase, PhaseStatus::Skipped, Some(detail), None));
            }

            let phase = match next {
                Next::Done => break,
                Next::Phase(phase) => phase,
            };
            let worker = self
                .registry
                .get(phase)
                .ok_or(OrchestratorError::MissingWorker(phase))?;

            machine.mark_running(&mut session, phase);
            self.events.emit(RunEvent::PhaseStarted { phase });
            info!(%phase, "Phase started");

            let ctx = PhaseContext::new(
                phase,
                &session.target,
                &session.workspace,
                throttle.budget().await,
                Arc::clone(&throttle),
            )
            .with_cancellation(self.cancel.clone())
            .with_events(self.events.clone());

            let result = worker.run(&ctx).await;
            if self.cancel.is_cancelled() || matches!(result, Err(WorkerError::Cancelled(_))) {
                return self.interrupted(&mut session, phase, summary, started);
            }

            match result {
                Ok(outcome) => {
                    machine.mark_complete(&mut session, phase)?;
                    let detail = partial_detail(&outcome);
                    if let Some(ref d) = detail {
                        warn!(%phase, detail = %d, "Phase completed with failures");
                        summary.warn(format!("{}: {}", phase, d));
                    }
                    for note in &outcome.notes {
                        summary.warn(format!("{}: {}", phase, note));
                    }
                    self.resolved(phase, PhaseStatus::Complete, detail.clone());
                    info!(%phase, jobs = outcome.jobs.total(), "Phase complete");

                    let signal = outcome.defensive_signal.clone();
                    summary.record(report(phase, PhaseStatus::Complete, detail, Some(outcome)));
                    if let Some(signal) = signal {
                        self.escalate(&mut session, &mut machine, &throttle, &signal, &mut summary)
                            .await?;
                    }
                }
                Err(WorkerError::ToolUnavailable { tool, .. }) => {
                    machine.mark_skipped(&mut session, phase)?;
                    let detail = format!("'{}' is not installed", tool);
                    warn!(%phase, %tool, "Tool unavailable, phase skipped");
                    summary.warn(format!("{}: {}", phase, detail));
                    self.resolved(phase, PhaseStatus::Skipped, Some(detail.clone()));
                    summary.record(report(phase, PhaseStatus::Skipped, Some(detail), None));
                }
                Err(e) => {
                    machine.mark_failed(&mut session, phase)?;
                    let detail = e.to_string();
                    warn!(%phase, error = %detail, "Phase failed, continuing");
                    summary.warn(format!("{}: {}", phase, detail));
                    self.resolved(phase, PhaseStatus::Failed, Some(detail.clone()));
                    summary.record(report(phase, PhaseStatus::Failed, Some(detail), None));
                }
            }
        }

        summary.elapsed = started.elapsed();
        self.events.emit(RunEvent::SessionFinished {
            completed: session.completed_phases.len(),
            skipped: session.skipped_phases.len(),
            failed: session.failed_phases.len(),
        });
        info!(
            completed = session.completed_phases.len(),
            skipped = session.skipped_phases.len(),
            failed = session.failed_phases.len(),
            "Session finished"
        );
        Ok(summary)
    }

    /// Apply a defensive signal: tighten the throttle, persist the new defense state and
    /// skip escalation-sensitive phases from now on. Signals after the first are ignored.
    async fn escalate(
        &self,
        session: &mut Session,
        machine: &mut PhaseStateMachine,
        throttle: &ThrottleController,
        signal: &DefenseSignal,
        summary: &mut RunSummary,
    ) -> Result<(), OrchestratorError> {
        let Some(escalation) = throttle.escalate(&signal.provider).await else {
            return Ok(());
        };

        session.defense = DefenseState {
            escalated: true,
            provider: Some(escalation.provider.clone()),
        };
        session.budget = escalation.budget;
        machine.extend_escalation_skips(escalation.skip_phases.iter().copied());
        machine.save(session)?;

        summary.escalation = Some(escalation.provider.clone());
        summary.warn(format!(
            "{} detected via {}; concurrency {} -> {}, delay {}s -> {}s",
            escalation.provider,
            signal.source,
            escalation.previous.max_concurrency,
            escalation.budget.max_concurrency,
            escalation.previous.delay_secs,
            escalation.budget.delay_secs
        ));
        self.events.emit(RunEvent::Escalated {
            provider: escalation.provider,
            concurrency: escalation.budget.max_concurrency,
            rate_limit: escalation.budget.rate_limit,
            delay_secs: escalation.budget.delay_secs,
        });
        Ok(())
    }

    /// Stop after an interrupt. The checkpoint keeps the last resolved phase.
    fn interrupted(
        &self,
        session: &mut Session,
        phase: Phase,
        mut summary: RunSummary,
        started: Instant,
    ) -> Result<RunSummary, OrchestratorError> {
        session.running = None;
        if let Err(e) = self.config.clean_tmp() {
            warn!(error = %e, "Failed to remove scratch directory");
        }
        warn!(%phase, "Run interrupted, checkpoint left at last resolved phase");
        summary.interrupted = Some(phase);
        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    fn resolved(&self, phase: Phase, status: PhaseStatus, detail: Option<String>) {
        self.events.emit(RunEvent::PhaseResolved {
            phase,
            status,
            detail,
        });
    }
}

fn report(
    phase: Phase,
    status: PhaseStatus,
    detail: Option<String>,
    outcome: Option<PhaseOutcome>,
) -> PhaseReport {
    let (jobs, artifacts) = outcome
        .map(|o| (o.jobs, o.artifacts))
        .unwrap_or((JobSummary::default(), Vec::new()));
    PhaseReport {
        phase,
        status,
        detail,
        jobs,
        artifacts,
    }
}

fn partial_detail(outcome: &PhaseOutcome) -> Option<String> {
    outcome.is_partial().then(|| {
        format!(
            "{} of {} jobs failed",
            outcome.jobs.failed,
            outcome.jobs.total()
        )
    })
}

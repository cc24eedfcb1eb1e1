//! Typed error hierarchy for the reconflow orchestrator.
//!
//! Each subsystem owns one enum:
//! - `ConfigError`: invalid CLI, environment or file input (always fatal)
//! - `StateError`: checkpoint persistence and phase ordering
//! - `SchedulerError`: job queue misuse and spawn failures
//! - `WorkerError`: per-phase worker failures (never fatal to the run)
//! - `OrchestratorError`: what the session driver surfaces to the CLI

use std::path::PathBuf;
use thiserror::Error;

use crate::phase::Phase;

/// Invalid configuration. Reported before any work starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unknown phase '{0}'. Run 'reconflow phases' to list valid names")]
    UnknownPhase(String),

    #[error("Invalid target '{0}': expected a hostname such as example.com")]
    InvalidTarget(String),

    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration in {origin}: {}", .problems.join("; "))]
    Invalid {
        origin: String,
        problems: Vec<String>,
    },
}

/// Checkpoint and phase-ordering errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Checkpoint at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize session: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Phase {phase} cannot resolve before {pending}")]
    OutOfOrder { phase: Phase, pending: Phase },

    #[error("Workspace {0} is locked by another reconflow process")]
    Locked(PathBuf),
}

/// Errors from the job scheduler itself. Individual job failures are not errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job id '{0}' is already queued in this run")]
    DuplicateJob(String),

    #[error("Job '{id}' has an empty argv")]
    EmptyArgv { id: String },
}

/// Errors a phase worker returns to the orchestrator.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Required tool '{tool}' for phase {phase} is not installed")]
    ToolUnavailable { phase: Phase, tool: String },

    #[error("Phase {phase} produced no usable output: {reason}")]
    PhaseFailure { phase: Phase, reason: String },

    #[error("Phase {0} was interrupted")]
    Cancelled(Phase),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the session orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Run interrupted during phase {0}")]
    Interrupted(Phase),

    #[error("No worker registered for phase {0}")]
    MissingWorker(Phase),
}

impl OrchestratorError {
    /// Whether the run must stop. Worker failures never reach this type; they
    /// degrade into warnings on the summary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::State(_) | Self::Interrupted(_) | Self::MissingWorker(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_invalid_value_carries_key() {
        let err = ConfigError::InvalidValue {
            key: "RECONFLOW_CONCURRENCY".to_string(),
            value: "zero".to_string(),
            reason: "expected a positive integer".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("RECONFLOW_CONCURRENCY"));
        assert!(msg.contains("zero"));
    }

    #[test]
    fn state_error_corrupt_carries_path() {
        let path = PathBuf::from("/ws/checkpoint.json");
        let err = StateError::Corrupt {
            path: path.clone(),
            reason: "missing field `target`".to_string(),
        };
        match &err {
            StateError::Corrupt { path: p, reason } => {
                assert_eq!(p, &path);
                assert!(reason.contains("target"));
            }
            _ => panic!("Expected Corrupt"),
        }
    }

    #[test]
    fn worker_error_tool_unavailable_names_phase() {
        let err = WorkerError::ToolUnavailable {
            phase: Phase::PortScan,
            tool: "naabu".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("port-scan"));
        assert!(msg.contains("naabu"));
    }

    #[test]
    fn worker_error_converts_from_scheduler_error() {
        let err: WorkerError = SchedulerError::DuplicateJob("recon-1".into()).into();
        assert!(matches!(
            err,
            WorkerError::Scheduler(SchedulerError::DuplicateJob(ref id)) if id == "recon-1"
        ));
    }

    #[test]
    fn orchestrator_errors_are_fatal() {
        let config: OrchestratorError = ConfigError::UnknownPhase("nope".into()).into();
        assert!(config.is_fatal());

        let state: OrchestratorError = StateError::Locked(PathBuf::from("/ws")).into();
        assert!(state.is_fatal());

        assert!(OrchestratorError::Interrupted(Phase::Crawl).is_fatal());
        assert!(OrchestratorError::MissingWorker(Phase::Cloud).is_fatal());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::UnknownPhase("x".into()));
        assert_std_error(&StateError::Locked(PathBuf::from("/x")));
        assert_std_error(&SchedulerError::DuplicateJob("x".into()));
        assert_std_error(&WorkerError::Cancelled(Phase::Recon));
    }
}

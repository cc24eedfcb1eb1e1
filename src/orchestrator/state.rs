//! Session state and the checkpointed phase state machine.
//!
//! The whole session is serialized to `<workspace>/checkpoint.json` after every phase
//! resolution. A checkpoint is loaded in full or rejected; a partially valid file is
//! never used to resume.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::StateError;
use crate::phase::{Phase, PhasePlan, PhaseStatus, SkipReason};
use crate::throttle::{Budget, Mode};

/// Current checkpoint format.
pub const SCHEMA_VERSION: u32 = 1;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LOCK_FILE: &str = ".reconflow.lock";

/// Defensive-signal state of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefenseState {
    pub escalated: bool,
    pub provider: Option<String>,
}

impl DefenseState {
    /// Provider label, only when escalated.
    pub fn escalated_by(&self) -> Option<&str> {
        if self.escalated {
            self.provider.as_deref().or(Some("unknown"))
        } else {
            None
        }
    }
}

/// One pipeline run against one target. This is the checkpoint body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub schema_version: u32,
    pub session_id: Uuid,
    pub target: String,
    pub workspace: PathBuf,
    pub current_phase: Phase,
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub mode: Mode,
    pub defense: DefenseState,
    pub completed_phases: Vec<Phase>,
    pub skipped_phases: Vec<Phase>,
    pub failed_phases: Vec<Phase>,
    pub budget: Budget,
    /// Phase currently executing; never persisted
    #[serde(skip)]
    pub running: Option<Phase>,
}

impl Session {
    pub fn new(target: &str, workspace: &Path, mode: Mode, budget: Budget) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: Uuid::new_v4(),
            target: target.to_string(),
            workspace: workspace.to_path_buf(),
            current_phase: Phase::Recon,
            started_at: now,
            saved_at: now,
            mode,
            defense: DefenseState::default(),
            completed_phases: Vec::new(),
            skipped_phases: Vec::new(),
            failed_phases: Vec::new(),
            budget,
            running: None,
        }
    }

    /// Status of `phase` in this session.
    pub fn status(&self, phase: Phase) -> PhaseStatus {
        if self.completed_phases.contains(&phase) {
            PhaseStatus::Complete
        } else if self.skipped_phases.contains(&phase) {
            PhaseStatus::Skipped
        } else if self.failed_phases.contains(&phase) {
            PhaseStatus::Failed
        } else if self.running == Some(phase) {
            PhaseStatus::Running
        } else {
            PhaseStatus::Pending
        }
    }

    pub fn is_resolved(&self, phase: Phase) -> bool {
        self.status(phase).is_terminal()
    }

    /// First phase in canonical order that has not resolved, or `Done`.
    pub fn next_unresolved(&self) -> Phase {
        Phase::pipeline()
            .find(|p| !self.is_resolved(*p))
            .unwrap_or(Phase::Done)
    }

    pub fn resolved_count(&self) -> usize {
        self.completed_phases.len() + self.skipped_phases.len() + self.failed_phases.len()
    }

    pub fn is_finished(&self) -> bool {
        self.next_unresolved().is_done()
    }

    pub fn is_escalated(&self) -> bool {
        self.defense.escalated
    }

    /// Check the resolved lists form a prefix of the canonical order.
    fn check_consistency(&self) -> Result<(), String> {
        let resolved = self.resolved_count();
        let pipeline: Vec<Phase> = Phase::pipeline().collect();
        if resolved > pipeline.len() {
            return Err(format!("{} phases resolved, only {} exist", resolved, pipeline.len()));
        }
        for phase in self
            .completed_phases
            .iter()
            .chain(&self.skipped_phases)
            .chain(&self.failed_phases)
        {
            if phase.is_done() {
                return Err("'done' cannot appear in a phase list".to_string());
            }
        }
        for (i, phase) in pipeline.iter().enumerate() {
            let hits = [
                &self.completed_phases,
                &self.skipped_phases,
                &self.failed_phases,
            ]
            .iter()
            .map(|list| list.iter().filter(|p| *p == phase).count())
            .sum::<usize>();
            let expected = usize::from(i < resolved);
            if hits != expected {
                return Err(if hits > 1 {
                    format!("phase '{}' is recorded more than once", phase)
                } else {
                    format!("resolved phases are not a prefix of the order (at '{}')", phase)
                });
            }
        }
        let next = self.next_unresolved();
        if self.current_phase != next {
            return Err(format!(
                "current_phase is '{}' but the next unresolved phase is '{}'",
                self.current_phase, next
            ));
        }
        if !self.budget.validate().is_empty() {
            return Err(format!("invalid budget: {}", self.budget.validate().join(", ")));
        }
        Ok(())
    }
}

/// What to do after `advance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Phase(Phase),
    Done,
}

/// Exclusive advisory lock on a workspace. Released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
    _file: File,
}

impl WorkspaceLock {
    pub fn acquire(workspace: &Path) -> Result<Self, StateError> {
        fs::create_dir_all(workspace).map_err(|source| StateError::Io {
            path: workspace.to_path_buf(),
            source,
        })?;
        let path = workspace.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired workspace lock");
                Ok(Self { path, _file: file })
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(StateError::Locked(workspace.to_path_buf()))
            }
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Accept either a workspace directory or a checkpoint file path.
pub fn resolve_checkpoint(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CHECKPOINT_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Owns the canonical order, skip decisions and checkpoint persistence.
#[derive(Debug)]
pub struct PhaseStateMachine {
    checkpoint: PathBuf,
    plan: PhasePlan,
    skips: Vec<(Phase, SkipReason)>,
    _lock: Option<WorkspaceLock>,
}

impl PhaseStateMachine {
    /// Open a workspace for writing, taking its exclusive lock.
    pub fn open(workspace: &Path, plan: PhasePlan) -> Result<Self, StateError> {
        let lock = WorkspaceLock::acquire(workspace)?;
        Ok(Self {
            checkpoint: workspace.join(CHECKPOINT_FILE),
            plan,
            skips: Vec::new(),
            _lock: Some(lock),
        })
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    /// Add phases the session must skip from now on (e.g. after escalation).
    pub fn extend_escalation_skips(&mut self, phases: impl IntoIterator<Item = Phase>) {
        self.plan.escalation_skips.extend(phases);
    }

    /// Move to the next runnable phase, recording skipped phases on the way.
    pub fn advance(&mut self, session: &mut Session) -> Result<Next, StateError> {
        loop {
            let phase = session.next_unresolved();
            if phase.is_done() {
                session.current_phase = Phase::Done;
                return Ok(Next::Done);
            }
            match self.plan.skip_reason(phase, session.defense.escalated_by()) {
                Some(reason) => {
                    info!(%phase, %reason, "Skipping phase");
                    self.mark_skipped(session, phase)?;
                    self.skips.push((phase, reason));
                }
                None => {
                    session.current_phase = phase;
                    return Ok(Next::Phase(phase));
                }
            }
        }
    }

    /// Phases skipped by `advance` since the last call.
    pub fn drain_skips(&mut self) -> Vec<(Phase, SkipReason)> {
        std::mem::take(&mut self.skips)
    }

    pub fn mark_running(&self, session: &mut Session, phase: Phase) {
        session.current_phase = phase;
        session.running = Some(phase);
    }

    pub fn mark_complete(&self, session: &mut Session, phase: Phase) -> Result<(), StateError> {
        self.resolve(session, phase, PhaseStatus::Complete)
    }

    pub fn mark_skipped(&self, session: &mut Session, phase: Phase) -> Result<(), StateError> {
        self.resolve(session, phase, PhaseStatus::Skipped)
    }

    pub fn mark_failed(&self, session: &mut Session, phase: Phase) -> Result<(), StateError> {
        self.resolve(session, phase, PhaseStatus::Failed)
    }

    fn resolve(
        &self,
        session: &mut Session,
        phase: Phase,
        status: PhaseStatus,
    ) -> Result<(), StateError> {
        if phase.is_done() {
            return Ok(());
        }

        let existing = session.status(phase);
        if existing.is_terminal() {
            if existing != status {
                warn!(%phase, %existing, requested = %status, "Phase already resolved, keeping first status");
            }
            return self.save(session);
        }

        let pending = session.next_unresolved();
        if pending != phase {
            return Err(StateError::OutOfOrder { phase, pending });
        }

        match status {
            PhaseStatus::Complete => session.completed_phases.push(phase),
            PhaseStatus::Skipped => session.skipped_phases.push(phase),
            PhaseStatus::Failed => session.failed_phases.push(phase),
            PhaseStatus::Pending | PhaseStatus::Running => return Ok(()),
        }
        if session.running == Some(phase) {
            session.running = None;
        }
        session.current_phase = session.next_unresolved();
        self.save(session)
    }

    /// Write the full session atomically (temp file + rename).
    pub fn save(&self, session: &mut Session) -> Result<(), StateError> {
        session.saved_at = Utc::now();
        write_checkpoint(&self.checkpoint, session)
    }

    /// Load and validate a checkpoint. Any defect rejects the whole file.
    pub fn load(path: &Path) -> Result<Session, StateError> {
        let content = fs::read_to_string(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let corrupt = |reason: String| StateError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let raw: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
        match raw.get("schema_version").and_then(|v| v.as_u64()) {
            Some(v) if v == u64::from(SCHEMA_VERSION) => {}
            Some(v) => return Err(corrupt(format!("unsupported schema_version {}", v))),
            None => return Err(corrupt("missing field `schema_version`".to_string())),
        }

        let session: Session = serde_json::from_value(raw).map_err(|e| corrupt(e.to_string()))?;
        session.check_consistency().map_err(corrupt)?;
        Ok(session)
    }
}

fn write_checkpoint(path: &Path, session: &Session) -> Result<(), StateError> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(session).map_err(StateError::Serialize)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    debug!(path = %path.display(), phase = %session.current_phase, "Checkpoint saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_machine() -> (PhaseStateMachine, Session, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let machine = PhaseStateMachine::open(dir.path(), PhasePlan::new()).unwrap();
        let session = Session::new("example.com", dir.path(), Mode::Conservative, Budget::default());
        (machine, session, dir)
    }

    fn complete_through(machine: &mut PhaseStateMachine, session: &mut Session, last: Phase) {
        loop {
            let Next::Phase(phase) = machine.advance(session).unwrap() else {
                return;
            };
            machine.mark_complete(session, phase).unwrap();
            if phase == last {
                return;
            }
        }
    }

    #[test]
    fn test_fresh_session_starts_at_recon() {
        let (mut machine, mut session, _dir) = make_machine();
        assert_eq!(machine.advance(&mut session).unwrap(), Next::Phase(Phase::Recon));
        assert!(!machine.checkpoint_path().exists());
    }

    #[test]
    fn test_mark_complete_persists_and_advances() {
        let (mut machine, mut session, _dir) = make_machine();
        complete_through(&mut machine, &mut session, Phase::Crawl);

        assert_eq!(session.current_phase, Phase::Secrets);
        let loaded = PhaseStateMachine::load(machine.checkpoint_path()).unwrap();
        assert_eq!(
            loaded.completed_phases,
            vec![Phase::Recon, Phase::TakeoverCheck, Phase::PortScan, Phase::Crawl]
        );
        assert_eq!(loaded.current_phase, Phase::Secrets);
        assert_eq!(loaded.session_id, session.session_id);
    }

    #[test]
    fn test_mark_complete_is_idempotent() {
        let (mut machine, mut session, _dir) = make_machine();
        complete_through(&mut machine, &mut session, Phase::Recon);
        machine.mark_complete(&mut session, Phase::Recon).unwrap();
        assert_eq!(session.completed_phases, vec![Phase::Recon]);
    }

    #[test]
    fn test_out_of_order_resolution_is_rejected() {
        let (machine, mut session, _dir) = make_machine();
        let err = machine.mark_complete(&mut session, Phase::Crawl).unwrap_err();
        assert!(matches!(
            err,
            StateError::OutOfOrder {
                phase: Phase::Crawl,
                pending: Phase::Recon
            }
        ));
        assert!(session.completed_phases.is_empty());
    }

    #[test]
    fn test_advance_skips_requested_and_disabled() {
        let dir = tempdir().unwrap();
        let plan = PhasePlan::new()
            .with_skips([Phase::TakeoverCheck])
            .with_disabled([Phase::PortScan]);
        let mut machine = PhaseStateMachine::open(dir.path(), plan).unwrap();
        let mut session = Session::new("example.com", dir.path(), Mode::Aggressive, Budget::default());

        complete_through(&mut machine, &mut session, Phase::Recon);
        assert_eq!(machine.advance(&mut session).unwrap(), Next::Phase(Phase::Crawl));
        assert_eq!(session.skipped_phases, vec![Phase::TakeoverCheck, Phase::PortScan]);

        let skips = machine.drain_skips();
        assert_eq!(skips[0], (Phase::TakeoverCheck, SkipReason::Requested));
        assert_eq!(skips[1], (Phase::PortScan, SkipReason::Disabled));
        assert!(machine.drain_skips().is_empty());
    }

    #[test]
    fn test_escalated_session_skips_port_scan() {
        let (mut machine, mut session, _dir) = make_machine();
        complete_through(&mut machine, &mut session, Phase::TakeoverCheck);
        session.defense = DefenseState {
            escalated: true,
            provider: Some("Cloudflare".to_string()),
        };
        assert_eq!(machine.advance(&mut session).unwrap(), Next::Phase(Phase::Crawl));
        assert_eq!(session.status(Phase::PortScan), PhaseStatus::Skipped);
    }

    #[test]
    fn test_all_phases_resolved_is_done() {
        let (mut machine, mut session, _dir) = make_machine();
        complete_through(&mut machine, &mut session, Phase::VulnerabilityScan);
        assert_eq!(machine.advance(&mut session).unwrap(), Next::Done);
        assert!(session.is_finished());
        assert_eq!(session.current_phase, Phase::Done);
    }

    #[test]
    fn test_failed_phase_counts_as_resolved() {
        let (mut machine, mut session, _dir) = make_machine();
        machine.advance(&mut session).unwrap();
        machine.mark_failed(&mut session, Phase::Recon).unwrap();
        assert_eq!(
            machine.advance(&mut session).unwrap(),
            Next::Phase(Phase::TakeoverCheck)
        );
        let loaded = PhaseStateMachine::load(machine.checkpoint_path()).unwrap();
        assert_eq!(loaded.failed_phases, vec![Phase::Recon]);
    }

    #[test]
    fn test_escalation_survives_save_and_load() {
        let (mut machine, mut session, _dir) = make_machine();
        complete_through(&mut machine, &mut session, Phase::Recon);
        session.defense = DefenseState {
            escalated: true,
            provider: Some("Akamai".to_string()),
        };
        session.budget.max_concurrency = 2;
        machine.save(&mut session).unwrap();

        let loaded = PhaseStateMachine::load(machine.checkpoint_path()).unwrap();
        assert!(loaded.is_escalated());
        assert_eq!(loaded.defense.escalated_by(), Some("Akamai"));
        assert_eq!(loaded.budget.max_concurrency, 2);
    }

    #[test]
    fn test_load_rejects_missing_field() {
        let (mut machine, mut session, _dir) = make_machine();
        complete_through(&mut machine, &mut session, Phase::Recon);

        let path = machine.checkpoint_path().to_path_buf();
        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("target");
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let err = PhaseStateMachine::load(&path).unwrap_err();
        match err {
            StateError::Corrupt { reason, .. } => assert!(reason.contains("target")),
            other => panic!("Expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_load_rejects_non_prefix_lists() {
        let (mut machine, mut session, _dir) = make_machine();
        complete_through(&mut machine, &mut session, Phase::Recon);

        let path = machine.checkpoint_path().to_path_buf();
        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["completed_phases"] = serde_json::json!(["recon", "crawl"]);
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        assert!(matches!(
            PhaseStateMachine::load(&path),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_load_rejects_garbage_and_unknown_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PhaseStateMachine::load(&path),
            Err(StateError::Corrupt { .. })
        ));

        fs::write(&path, r#"{"schema_version": 99}"#).unwrap();
        let err = PhaseStateMachine::load(&path).unwrap_err();
        assert!(err.to_string().contains("schema_version 99"));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            PhaseStateMachine::load(&dir.path().join(CHECKPOINT_FILE)),
            Err(StateError::Io { .. })
        ));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let (mut machine, mut session, dir) = make_machine();
        complete_through(&mut machine, &mut session, Phase::Recon);
        assert!(dir.path().join(CHECKPOINT_FILE).exists());
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let (machine, _session, dir) = make_machine();
        let err = PhaseStateMachine::open(dir.path(), PhasePlan::new()).unwrap_err();
        assert!(matches!(err, StateError::Locked(_)));

        drop(machine);
        assert!(PhaseStateMachine::open(dir.path(), PhasePlan::new()).is_ok());
    }

    #[test]
    fn test_resolve_checkpoint_accepts_directory() {
        let dir = tempdir().unwrap();
        assert_eq!(
            resolve_checkpoint(dir.path()),
            dir.path().join(CHECKPOINT_FILE)
        );
        let file = dir.path().join("elsewhere.json");
        assert_eq!(resolve_checkpoint(&file), file);
    }
}

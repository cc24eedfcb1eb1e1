//! Typed job descriptors.
//!
//! A job is an argv list, never a shell string. Placeholders are expanded per
//! element before a job is built, so no user-controlled text is ever interpreted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

use crate::errors::SchedulerError;

/// Identifier of a job, unique within one scheduler run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle of a job inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One external process to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub program: String,
    pub args: Vec<String>,
    /// File that receives the job's stdout
    pub stdout_path: Option<PathBuf>,
    /// File that receives the job's stderr
    pub stderr_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, program: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            stdout_path: None,
            stderr_path: None,
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Build a job from a full argv (`argv[0]` is the program).
    pub fn from_argv(id: impl Into<JobId>, argv: Vec<String>) -> Result<Self, SchedulerError> {
        let id = id.into();
        let mut parts = argv.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| SchedulerError::EmptyArgv { id: id.to_string() })?;
        Ok(Self::new(id, program).args(parts))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }

    pub fn stderr_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_path = Some(path.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line for logs. Not used for execution.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Stable 12-hex-char key derived from the argv, used to name artifacts.
    pub fn artifact_key(&self) -> String {
        artifact_key(std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)))
    }
}

/// SHA-256 over NUL-separated parts, truncated to 12 hex characters.
pub fn artifact_key<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .take(6)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_argv_splits_program() {
        let job = Job::from_argv(
            "crawl-1",
            vec!["katana".into(), "-u".into(), "https://example.com".into()],
        )
        .unwrap();
        assert_eq!(job.program, "katana");
        assert_eq!(job.args, vec!["-u", "https://example.com"]);
        assert_eq!(job.display_command(), "katana -u https://example.com");
    }

    #[test]
    fn test_from_argv_rejects_empty() {
        assert!(matches!(
            Job::from_argv("x", vec![]),
            Err(SchedulerError::EmptyArgv { .. })
        ));
        assert!(Job::from_argv("x", vec!["  ".into()]).is_err());
    }

    #[test]
    fn test_artifact_key_is_stable_and_argv_sensitive() {
        let a = Job::new("a", "httpx").args(["-l", "hosts.txt"]);
        let b = Job::new("b", "httpx").args(["-l", "hosts.txt"]);
        let c = Job::new("c", "httpx").args(["-l hosts.txt"]);

        assert_eq!(a.artifact_key(), b.artifact_key());
        assert_ne!(a.artifact_key(), c.artifact_key());
        assert_eq!(a.artifact_key().len(), 12);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}

//! Execution records for scheduled jobs.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::job::{JobId, JobStatus};

/// Tracking record for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// Exit code if the process exited normally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Error message if the job failed without an exit code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl JobRecord {
    pub fn queued(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            exit_code: None,
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Aggregate counts over one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub queued: usize,
}

impl JobSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.running + self.queued
    }

    /// Every job reached a terminal status.
    pub fn is_settled(&self) -> bool {
        self.running == 0 && self.queued == 0
    }

    pub fn all_success(&self) -> bool {
        self.is_settled() && self.failed == 0
    }

    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    /// Combine with another summary (e.g. across several scheduler runs in a phase).
    pub fn merge(&mut self, other: JobSummary) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.running += other.running;
        self.queued += other.queued;
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = JobSummary::default();
        summary.add(JobStatus::Completed);
        summary.add(JobStatus::Completed);
        summary.add(JobStatus::Failed);
        assert_eq!(summary.total(), 3);
        assert!(summary.is_settled());
        assert!(!summary.all_success());

        summary.add(JobStatus::Running);
        assert!(!summary.is_settled());
    }

    #[test]
    fn test_summary_merge() {
        let mut a = JobSummary {
            completed: 2,
            ..Default::default()
        };
        a.merge(JobSummary {
            completed: 1,
            failed: 1,
            ..Default::default()
        });
        assert_eq!(a.completed, 3);
        assert_eq!(a.failed, 1);
    }

    #[test]
    fn test_record_serializes_duration_as_millis() {
        let mut record = JobRecord::queued(JobId::new("j1"));
        record.duration = Duration::from_millis(1500);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"duration\":1500"));
        assert!(!json.contains("exit_code"));
    }
}

//! Bounded-concurrency job scheduler.
//!
//! Runs a queue of external processes with at most `max_concurrency` alive at once.
//! Each dispatched job owns a semaphore permit until its final status has been
//! recorded, so the running count can never exceed the limit and a slot is never
//! reclaimed before its job's outcome is visible in `summary()`.
//!
//! ## Example
//!
//! ```no_run
//! use reconflow::scheduler::{Job, JobScheduler};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut scheduler = JobScheduler::new(2);
//! scheduler.enqueue(Job::new("a", "subfinder").args(["-d", "example.com"]))?;
//! scheduler.enqueue(Job::new("b", "assetfinder").arg("example.com"))?;
//! let summary = scheduler.run().await;
//! println!("{} completed, {} failed", summary.completed, summary.failed);
//! # Ok(())
//! # }
//! ```

mod job;
mod state;

pub use job::{Job, JobId, JobStatus, artifact_key};
pub use state::{ExecutionTimer, JobRecord, JobSummary};

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::SchedulerError;
use crate::events::{EventSink, RunEvent};
use crate::phase::Phase;
use crate::throttle::ThrottleController;

type Records = Arc<Mutex<HashMap<JobId, JobRecord>>>;

/// How a single job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobEnd {
    Exited(i32),
    Signalled,
    SpawnFailed(String),
    TimedOut(Duration),
    Cancelled,
}

impl JobEnd {
    fn status(&self) -> JobStatus {
        match self {
            JobEnd::Exited(0) => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match self {
            JobEnd::Exited(code) => Some(*code),
            _ => None,
        }
    }

    fn error(&self) -> Option<String> {
        match self {
            JobEnd::Exited(0) => None,
            JobEnd::Exited(code) => Some(format!("exited with code {}", code)),
            JobEnd::Signalled => Some("terminated by signal".to_string()),
            JobEnd::SpawnFailed(e) => Some(format!("failed to spawn: {}", e)),
            JobEnd::TimedOut(d) => Some(format!("timed out after {}s", d.as_secs())),
            JobEnd::Cancelled => Some("cancelled".to_string()),
        }
    }
}

/// Shared state handed to each job task.
#[derive(Clone)]
struct TaskContext {
    records: Records,
    running: Arc<AtomicUsize>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    events: EventSink,
    phase: Option<Phase>,
}

/// Executes jobs with bounded concurrency.
pub struct JobScheduler {
    max_concurrency: usize,
    queue: VecDeque<Job>,
    seen: HashSet<JobId>,
    records: Records,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    tasks: JoinSet<()>,
    throttle: Option<Arc<ThrottleController>>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    events: EventSink,
    phase: Option<Phase>,
}

impl JobScheduler {
    /// Create a scheduler. `max_concurrency` is clamped to at least 1.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            queue: VecDeque::new(),
            seen: HashSet::new(),
            records: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            tasks: JoinSet::new(),
            throttle: None,
            timeout: None,
            cancel: CancellationToken::new(),
            events: EventSink::disabled(),
            phase: None,
        }
    }

    /// Gate every dispatch through a throttle controller.
    pub fn with_throttle(mut self, throttle: Arc<ThrottleController>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Kill jobs that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, events: EventSink, phase: Option<Phase>) -> Self {
        self.events = events;
        self.phase = phase;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Clear all tracking and set a new concurrency limit.
    ///
    /// Jobs from a previous `run()` have already finished because `run()` waits for
    /// them before returning.
    pub fn reset(&mut self, max_concurrency: usize) {
        self.max_concurrency = max_concurrency.max(1);
        self.queue.clear();
        self.seen.clear();
        self.lock_records().clear();
        self.running.store(0, Ordering::SeqCst);
        self.peak.store(0, Ordering::SeqCst);
    }

    /// Add a job to the pending queue. Ids must be unique within the run.
    pub fn enqueue(&mut self, job: Job) -> Result<(), SchedulerError> {
        if !self.seen.insert(job.id.clone()) {
            return Err(SchedulerError::DuplicateJob(job.id.to_string()));
        }
        self.lock_records()
            .insert(job.id.clone(), JobRecord::queued(job.id.clone()));
        self.queue.push_back(job);
        Ok(())
    }

    /// Dispatch every queued job, then wait for all of them to finish.
    pub async fn run(&mut self) -> JobSummary {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let ctx = TaskContext {
            records: Arc::clone(&self.records),
            running: Arc::clone(&self.running),
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            events: self.events.clone(),
            phase: self.phase,
        };
        let mut dispatched = 0usize;

        while let Some(job) = self.queue.pop_front() {
            let Some(permit) = self.next_slot(&semaphore).await else {
                self.finish_unstarted(&job, JobEnd::Cancelled);
                continue;
            };

            if let Some(ref throttle) = self.throttle {
                let delay = throttle.current_delay().await;
                if dispatched > 0 && !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
                tokio::select! {
                    _ = throttle.acquire() => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
            if self.cancel.is_cancelled() {
                self.finish_unstarted(&job, JobEnd::Cancelled);
                continue;
            }

            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            if let Some(record) = self.lock_records().get_mut(&job.id) {
                record.status = JobStatus::Running;
            }
            debug!(job = %job.id, command = %job.display_command(), running = now_running, "Dispatching job");

            dispatched += 1;
            let ctx = ctx.clone();
            self.tasks.spawn(run_job(job, permit, ctx));
        }

        self.wait_all().await;
        self.summary()
    }

    /// Block until every dispatched job has a terminal status.
    pub async fn wait_all(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Job task panicked");
            }
        }
    }

    /// Counts of jobs by status.
    pub fn summary(&self) -> JobSummary {
        let mut summary = JobSummary::default();
        for record in self.lock_records().values() {
            summary.add(record.status);
        }
        summary
    }

    /// Snapshot of every job record, ordered by id.
    pub fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.lock_records().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Jobs running right now.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running jobs seen since the last reset.
    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn next_slot(&self, semaphore: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        }
    }

    fn finish_unstarted(&self, job: &Job, end: JobEnd) {
        if let Some(record) = self.lock_records().get_mut(&job.id) {
            record.status = end.status();
            record.error = end.error();
        }
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run one job to completion, record its outcome, then release its slot.
async fn run_job(job: Job, permit: OwnedSemaphorePermit, ctx: TaskContext) {
    let timer = ExecutionTimer::start();
    let end = execute(&job, ctx.timeout, &ctx.cancel).await;
    let status = end.status();

    if status == JobStatus::Failed {
        warn!(job = %job.id, reason = %end.error().unwrap_or_default(), "Job failed");
    } else {
        debug!(job = %job.id, "Job completed");
    }

    {
        let mut records = ctx.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(&job.id) {
            record.status = status;
            record.exit_code = end.exit_code();
            record.error = end.error();
            record.duration = timer.elapsed();
        }
    }
    ctx.running.fetch_sub(1, Ordering::SeqCst);
    drop(permit);

    ctx.events.emit(RunEvent::JobFinished {
        phase: ctx.phase,
        job: job.id.to_string(),
        status,
        exit_code: end.exit_code(),
        duration_ms: timer.elapsed().as_millis() as u64,
    });
}

async fn execute(job: &Job, timeout: Option<Duration>, cancel: &CancellationToken) -> JobEnd {
    let mut cmd = match build_command(job) {
        Ok(cmd) => cmd,
        Err(e) => return JobEnd::SpawnFailed(e.to_string()),
    };

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return JobEnd::SpawnFailed(e.to_string()),
    };
    let pid = child.id();

    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(code) => JobEnd::Exited(code),
                None => JobEnd::Signalled,
            },
            Err(e) => JobEnd::SpawnFailed(e.to_string()),
        },
        _ = deadline => {
            terminate_group(pid);
            child.kill().await.ok();
            JobEnd::TimedOut(timeout.unwrap_or_default())
        }
        _ = cancel.cancelled() => {
            terminate_group(pid);
            child.kill().await.ok();
            JobEnd::Cancelled
        }
    }
}

fn build_command(job: &Job) -> std::io::Result<Command> {
    let mut cmd = Command::new(&job.program);
    cmd.args(&job.args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    cmd.stdout(match job.stdout_path {
        Some(ref path) => Stdio::from(std::fs::File::create(path)?),
        None => Stdio::null(),
    });
    cmd.stderr(match job.stderr_path {
        Some(ref path) => Stdio::from(std::fs::File::create(path)?),
        None => Stdio::null(),
    });
    if let Some(ref dir) = job.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &job.env {
        cmd.env(key, value);
    }

    // Own process group so cancellation reaches grandchildren too.
    #[cfg(unix)]
    cmd.process_group(0);

    Ok(cmd)
}

/// Send SIGTERM to the job's whole process group.
fn terminate_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; the group id is the child's own pid
        // because it was spawned with process_group(0).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::throttle::{Budget, EscalationPolicy};
    use std::time::Instant;

    fn sleep_job(id: &str, secs: &str) -> Job {
        Job::new(id, "sleep").arg(secs)
    }

    #[test]
    fn test_enqueue_rejects_duplicate_ids() {
        let mut scheduler = JobScheduler::new(2);
        scheduler.enqueue(Job::new("recon-1", "true")).unwrap();
        let err = scheduler.enqueue(Job::new("recon-1", "false")).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob(ref id) if id == "recon-1"));
        assert_eq!(scheduler.summary().queued, 1);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        assert_eq!(JobScheduler::new(0).max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_status() {
        let mut scheduler = JobScheduler::new(4);
        scheduler.enqueue(Job::new("ok", "true")).unwrap();
        scheduler.enqueue(Job::new("bad", "false")).unwrap();
        scheduler
            .enqueue(Job::new("missing", "reconflow-no-such-binary"))
            .unwrap();

        let summary = scheduler.run().await;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 2);
        assert!(summary.is_settled());

        let records = scheduler.records();
        let bad = records.iter().find(|r| r.id.as_str() == "bad").unwrap();
        assert_eq!(bad.exit_code, Some(1));
        let missing = records.iter().find(|r| r.id.as_str() == "missing").unwrap();
        assert!(missing.error.as_deref().unwrap().contains("spawn"));
    }

    #[tokio::test]
    async fn test_running_never_exceeds_limit() {
        for limit in [1usize, 2, 3] {
            let mut scheduler = JobScheduler::new(limit);
            for i in 0..6 {
                scheduler.enqueue(sleep_job(&format!("job-{}", i), "0.2")).unwrap();
            }
            let summary = scheduler.run().await;
            assert_eq!(summary.completed, 6);
            assert!(scheduler.peak_running() <= limit);
            assert_eq!(scheduler.peak_running(), limit);
            assert_eq!(scheduler.running(), 0);
        }
    }

    #[tokio::test]
    async fn test_rapid_churn_keeps_count_consistent() {
        let mut scheduler = JobScheduler::new(3);
        for i in 0..40 {
            scheduler.enqueue(Job::new(format!("t-{}", i), "true")).unwrap();
        }
        let summary = scheduler.run().await;
        assert_eq!(summary.completed, 40);
        assert_eq!(summary.running, 0);
        assert!(scheduler.peak_running() <= 3);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_siblings() {
        let mut scheduler = JobScheduler::new(2);
        scheduler.enqueue(Job::new("fail", "false")).unwrap();
        scheduler.enqueue(sleep_job("slow", "0.3")).unwrap();
        scheduler.enqueue(Job::new("after", "true")).unwrap();

        let summary = scheduler.run().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 2);
    }

    #[tokio::test]
    async fn test_timeout_kills_job() {
        let mut scheduler = JobScheduler::new(1).with_timeout(Duration::from_millis(200));
        scheduler.enqueue(sleep_job("hang", "30")).unwrap();

        let started = Instant::now();
        let summary = scheduler.run().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(summary.failed, 1);
        let record = &scheduler.records()[0];
        assert!(record.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_running_and_queued_jobs() {
        let token = CancellationToken::new();
        let mut scheduler = JobScheduler::new(1).with_cancellation(token.clone());
        scheduler.enqueue(sleep_job("long", "30")).unwrap();
        scheduler.enqueue(sleep_job("never", "30")).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let started = Instant::now();
        let summary = scheduler.run().await;
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(summary.failed, 2);
        assert!(
            scheduler
                .records()
                .iter()
                .all(|r| r.error.as_deref() == Some("cancelled"))
        );
    }

    #[tokio::test]
    async fn test_stdout_written_to_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hosts.txt");
        let mut scheduler = JobScheduler::new(1);
        scheduler
            .enqueue(Job::new("echo", "echo").arg("a.example.com").stdout_to(&out))
            .unwrap();
        scheduler.run().await;
        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            "a.example.com"
        );
    }

    #[tokio::test]
    async fn test_throttle_counts_each_dispatch() {
        let budget = Budget {
            max_concurrency: 2,
            rate_limit: 100,
            period_secs: 60,
            delay_secs: 0,
            timeout_secs: 60,
        };
        let throttle = Arc::new(ThrottleController::new(budget, EscalationPolicy::default()));
        let mut scheduler = JobScheduler::new(2).with_throttle(Arc::clone(&throttle));
        for i in 0..5 {
            scheduler.enqueue(Job::new(format!("j{}", i), "true")).unwrap();
        }
        scheduler.run().await;
        assert_eq!(throttle.window_count().await, 5);
    }

    #[tokio::test]
    async fn test_reset_clears_tracking() {
        let mut scheduler = JobScheduler::new(2);
        scheduler.enqueue(Job::new("a", "true")).unwrap();
        scheduler.run().await;
        scheduler.reset(3);
        assert_eq!(scheduler.summary().total(), 0);
        assert_eq!(scheduler.max_concurrency(), 3);
        scheduler.enqueue(Job::new("a", "true")).unwrap();
    }
}

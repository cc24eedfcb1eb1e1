//! Declarative external-tool worker.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use super::catalog::{TemplateVars, ToolSpec, expand};
use super::{PhaseContext, PhaseOutcome, PhaseWorker};
use crate::defense::{DefenseSignal, SignalSource};
use crate::errors::WorkerError;
use crate::events::RunEvent;
use crate::phase::Phase;
use crate::scheduler::{Job, JobScheduler, JobSummary, artifact_key};
use crate::throttle::{ENV_CONCURRENCY, ENV_DELAY, ENV_RATE_LIMIT, ENV_TIMEOUT};

static BLOCKED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(429 too many requests|too many requests|rate[- ]?limited|503 service unavailable|captcha)\b",
    )
    .unwrap()
});

/// Bytes of each stderr log inspected for blocking markers.
const STDERR_SCAN_LIMIT: usize = 64 * 1024;

/// Locate `program` on `PATH`, or check it directly when it contains a slash.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Output of one tool after its stage ran.
struct Pending {
    tool: String,
    output: PathBuf,
    /// Per-item outputs to merge into `output`
    parts: Option<PathBuf>,
}

/// Runs a phase as a table of external tool invocations.
pub struct ToolWorker {
    phase: Phase,
    tools: Vec<ToolSpec>,
}

impl ToolWorker {
    pub fn new(phase: Phase, tools: Vec<ToolSpec>) -> Self {
        Self { phase, tools }
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    fn enqueue(
        &self,
        scheduler: &mut JobScheduler,
        tool: &ToolSpec,
        ctx: &PhaseContext,
        outcome: &mut PhaseOutcome,
    ) -> Result<Option<Pending>, WorkerError> {
        let input = tool.input.as_ref().map(|rel| ctx.workspace.join(rel));
        let lines = match input {
            Some(ref path) => {
                let lines = read_lines(path);
                if lines.is_empty() {
                    let note = format!("{}: no input at {}", tool.name, path.display());
                    info!(phase = %self.phase, tool = %tool.name, input = %path.display(), "Skipping tool without input");
                    outcome.notes.push(note);
                    return Ok(None);
                }
                lines
            }
            None => Vec::new(),
        };

        let output = ctx.output_dir.join(tool.output_file());
        let logs = ctx.logs_dir();

        if !tool.fan_out {
            let stdout = if tool.writes_own_output() {
                logs.join(format!("{}.stdout", tool.name))
            } else {
                output.clone()
            };
            let vars = TemplateVars {
                target: &ctx.target,
                workspace: &ctx.workspace,
                out: &output,
                input: input.as_deref(),
                item: None,
                budget: &ctx.budget,
            };
            let job = self
                .build_job(tool.name.clone(), tool, &vars, ctx)?
                .stdout_to(stdout)
                .stderr_to(logs.join(format!("{}.stderr", tool.name)));
            scheduler.enqueue(job)?;
            return Ok(Some(Pending {
                tool: tool.name.clone(),
                output,
                parts: None,
            }));
        }

        let parts = ctx.output_dir.join(format!("{}.d", tool.name));
        std::fs::create_dir_all(&parts).map_err(|e| {
            WorkerError::Other(anyhow::anyhow!(
                "Failed to create {}: {}",
                parts.display(),
                e
            ))
        })?;
        for item in &lines {
            let key = artifact_key([tool.name.as_str(), item.as_str()]);
            let item_out = parts.join(format!("{}.txt", key));
            let stdout = if tool.writes_own_output() {
                logs.join(format!("{}-{}.stdout", tool.name, key))
            } else {
                item_out.clone()
            };
            let vars = TemplateVars {
                target: &ctx.target,
                workspace: &ctx.workspace,
                out: &item_out,
                input: input.as_deref(),
                item: Some(item),
                budget: &ctx.budget,
            };
            let job = self
                .build_job(format!("{}-{}", tool.name, key), tool, &vars, ctx)?
                .stdout_to(stdout)
                .stderr_to(logs.join(format!("{}-{}.stderr", tool.name, key)));
            scheduler.enqueue(job)?;
        }
        debug!(phase = %self.phase, tool = %tool.name, items = lines.len(), "Fanned out tool");
        Ok(Some(Pending {
            tool: tool.name.clone(),
            output,
            parts: Some(parts),
        }))
    }

    fn build_job(
        &self,
        id: String,
        tool: &ToolSpec,
        vars: &TemplateVars<'_>,
        ctx: &PhaseContext,
    ) -> Result<Job, WorkerError> {
        let argv: Vec<String> = tool.argv.iter().map(|a| expand(a, vars)).collect();
        Ok(Job::from_argv(id, argv)?
            .current_dir(&ctx.output_dir)
            .env("RECONFLOW_TARGET", &ctx.target)
            .env("RECONFLOW_PHASE", self.phase.name())
            .env(ENV_CONCURRENCY, ctx.budget.max_concurrency.to_string())
            .env(ENV_RATE_LIMIT, ctx.budget.rate_limit.to_string())
            .env(ENV_DELAY, ctx.budget.delay_secs.to_string())
            .env(ENV_TIMEOUT, ctx.budget.timeout_secs.to_string()))
    }

    /// Record non-empty outputs and emit findings.
    fn collect(&self, pending: &Pending, ctx: &PhaseContext, outcome: &mut PhaseOutcome) {
        if let Some(ref parts) = pending.parts
            && let Err(e) = merge_parts(parts, &pending.output)
        {
            warn!(tool = %pending.tool, error = %e, "Failed to merge fan-out results");
            return;
        }
        let lines = count_lines(&pending.output);
        if lines == 0 {
            return;
        }
        outcome.artifacts.push(pending.output.clone());
        ctx.events.emit(RunEvent::Finding {
            phase: self.phase,
            tool: pending.tool.clone(),
            artifact: pending.output.clone(),
            lines,
        });
    }
}

#[async_trait]
impl PhaseWorker for ToolWorker {
    fn phase(&self) -> Phase {
        self.phase
    }

    async fn run(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, WorkerError> {
        let mut outcome = PhaseOutcome::default();

        let mut missing = Vec::new();
        let mut stages: BTreeMap<u32, Vec<&ToolSpec>> = BTreeMap::new();
        for tool in &self.tools {
            if find_program(tool.program()).is_some() {
                stages.entry(tool.stage).or_default().push(tool);
            } else {
                warn!(phase = %self.phase, tool = %tool.name, program = tool.program(), "Tool not installed");
                outcome
                    .notes
                    .push(format!("{}: '{}' not installed", tool.name, tool.program()));
                missing.push(tool.program().to_string());
            }
        }
        if stages.is_empty() {
            return match missing.into_iter().next() {
                Some(tool) => Err(WorkerError::ToolUnavailable {
                    phase: self.phase,
                    tool,
                }),
                None => Ok(outcome),
            };
        }

        reset_logs(&ctx.logs_dir())?;

        let mut scheduler = JobScheduler::new(ctx.budget.max_concurrency)
            .with_throttle(Arc::clone(&ctx.throttle))
            .with_timeout(ctx.budget.timeout())
            .with_cancellation(ctx.cancel.clone())
            .with_events(ctx.events.clone(), Some(self.phase));

        let mut jobs = JobSummary::default();
        for (stage, tools) in stages {
            scheduler.reset(ctx.budget.max_concurrency);
            let mut pending = Vec::new();
            for tool in tools {
                if let Some(p) = self.enqueue(&mut scheduler, tool, ctx, &mut outcome)? {
                    pending.push(p);
                }
            }
            debug!(phase = %self.phase, stage, jobs = scheduler.summary().total(), "Running stage");
            jobs.merge(scheduler.run().await);

            if ctx.cancel.is_cancelled() {
                return Err(WorkerError::Cancelled(self.phase));
            }
            for p in &pending {
                self.collect(p, ctx, &mut outcome);
            }
        }
        outcome.jobs = jobs;
        if let Some((signal, status)) = scan_for_blocking(&ctx.logs_dir()) {
            ctx.throttle.observe_status(status).await;
            outcome.defensive_signal = Some(signal);
        }

        if jobs.total() > 0 && jobs.completed == 0 {
            return Err(WorkerError::PhaseFailure {
                phase: self.phase,
                reason: format!("all {} jobs failed", jobs.failed),
            });
        }
        Ok(outcome)
    }
}

/// Start the phase with an empty logs directory so stale stderr from an
/// interrupted attempt is not scanned again.
fn reset_logs(logs: &Path) -> Result<(), WorkerError> {
    let io_err = |e: std::io::Error| {
        WorkerError::Other(anyhow::anyhow!("Failed to reset {}: {}", logs.display(), e))
    };
    if logs.exists() {
        std::fs::remove_dir_all(logs).map_err(io_err)?;
    }
    std::fs::create_dir_all(logs).map_err(io_err)
}

/// Non-empty trimmed lines, first occurrence only.
fn read_lines(path: &Path) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.to_string()))
        .map(String::from)
        .collect()
}

fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|c| c.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

/// Concatenate per-item outputs, deduplicating lines, sorted by file name.
fn merge_parts(parts: &Path, output: &Path) -> std::io::Result<()> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(parts)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut seen = HashSet::new();
    let mut merged = String::new();
    for file in files {
        for line in read_lines(&file) {
            if seen.insert(line.clone()) {
                merged.push_str(&line);
                merged.push('\n');
            }
        }
    }
    std::fs::write(output, merged)
}

/// HTTP status a blocking marker stands for.
fn marker_status(marker: &str) -> u16 {
    let marker = marker.to_lowercase();
    if marker.contains("captcha") {
        403
    } else if marker.starts_with("503") {
        503
    } else {
        429
    }
}

/// Look through stderr logs for signs the target is blocking us.
///
/// Returns the signal and the status the first marker maps to.
fn scan_for_blocking(logs: &Path) -> Option<(DefenseSignal, u16)> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(logs)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "stderr"))
        .map(|e| e.into_path())
        .collect();
    files.sort();

    files.into_iter().find_map(|file| {
        let bytes = std::fs::read(&file).ok()?;
        let head = &bytes[..bytes.len().min(STDERR_SCAN_LIMIT)];
        let text = String::from_utf8_lossy(head);
        let marker = BLOCKED_RE.find(&text)?;
        let tool = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(tool = %tool, marker = marker.as_str(), "Blocking marker in tool output");
        let signal = DefenseSignal {
            provider: "rate limiting".to_string(),
            source: SignalSource::Worker(tool),
        };
        Some((signal, marker_status(marker.as_str())))
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::throttle::{Budget, EscalationPolicy, ThrottleController};
    use crate::workers::PhaseContext;
    use std::time::Duration;
    use tempfile::tempdir;

    fn context(workspace: &Path, phase: Phase) -> PhaseContext {
        let budget = Budget {
            max_concurrency: 2,
            rate_limit: 100,
            period_secs: 60,
            delay_secs: 0,
            timeout_secs: 30,
        };
        let throttle = Arc::new(ThrottleController::new(budget, EscalationPolicy::default()));
        PhaseContext::new(phase, "example.com", workspace, budget, throttle)
    }

    #[test]
    fn test_find_program() {
        assert!(find_program("sh").is_some());
        assert!(find_program("/bin/sh").is_some());
        assert!(find_program("reconflow-no-such-tool").is_none());
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let dir = tempdir().unwrap();
        let worker = ToolWorker::new(
            Phase::PortScan,
            vec![ToolSpec::new("naabu", &["reconflow-no-such-tool", "-host", "{target}"])],
        );
        let err = worker
            .run(&context(dir.path(), Phase::PortScan))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::ToolUnavailable { phase: Phase::PortScan, ref tool } if tool == "reconflow-no-such-tool"
        ));
    }

    #[tokio::test]
    async fn test_stdout_becomes_artifact() {
        let dir = tempdir().unwrap();
        let worker = ToolWorker::new(
            Phase::Recon,
            vec![
                ToolSpec::new("echo", &["echo", "www.{target}"]).output("subdomains.txt"),
                ToolSpec::new("missing", &["reconflow-no-such-tool"]),
            ],
        );
        let ctx = context(dir.path(), Phase::Recon);
        let outcome = worker.run(&ctx).await.unwrap();

        let out = dir.path().join("recon/subdomains.txt");
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "www.example.com");
        assert_eq!(outcome.artifacts, vec![out]);
        assert_eq!(outcome.jobs.completed, 1);
        assert!(outcome.notes.iter().any(|n| n.contains("not installed")));
    }

    #[tokio::test]
    async fn test_stages_feed_later_tools() {
        let dir = tempdir().unwrap();
        let worker = ToolWorker::new(
            Phase::Recon,
            vec![
                ToolSpec::new("upper", &["tr", "a-z", "A-Z"])
                    .input("recon/subdomains.txt")
                    .stage(1),
                ToolSpec::new("seed", &["sh", "-c", "printf 'a.example.com\\nb.example.com\\n' > {out}"])
                    .output("subdomains.txt"),
            ],
        );
        let outcome = worker.run(&context(dir.path(), Phase::Recon)).await.unwrap();
        assert_eq!(outcome.jobs.completed, 2);
        // tr reads stdin, which is null, so the second stage output is empty
        assert_eq!(outcome.artifacts, vec![dir.path().join("recon/subdomains.txt")]);
    }

    #[tokio::test]
    async fn test_fan_out_runs_one_job_per_line() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("recon")).unwrap();
        std::fs::write(
            dir.path().join("recon/live.txt"),
            "https://a.example.com\nhttps://b.example.com\nhttps://a.example.com\n\n",
        )
        .unwrap();

        let worker = ToolWorker::new(
            Phase::Fuzz,
            vec![
                ToolSpec::new("probe", &["echo", "{item}/admin"])
                    .input("recon/live.txt")
                    .output("paths.txt")
                    .fan_out(),
            ],
        );
        let outcome = worker.run(&context(dir.path(), Phase::Fuzz)).await.unwrap();
        assert_eq!(outcome.jobs.completed, 2);

        let merged = std::fs::read_to_string(dir.path().join("fuzz/paths.txt")).unwrap();
        let mut lines: Vec<&str> = merged.lines().collect();
        lines.sort();
        assert_eq!(
            lines,
            vec!["https://a.example.com/admin", "https://b.example.com/admin"]
        );
    }

    #[tokio::test]
    async fn test_missing_input_skips_tool() {
        let dir = tempdir().unwrap();
        let worker = ToolWorker::new(
            Phase::Crawl,
            vec![ToolSpec::new("cat", &["cat", "{input}"]).input("recon/live.txt")],
        );
        let outcome = worker.run(&context(dir.path(), Phase::Crawl)).await.unwrap();
        assert_eq!(outcome.jobs.total(), 0);
        assert!(outcome.notes[0].contains("no input"));
    }

    #[tokio::test]
    async fn test_all_jobs_failing_is_phase_failure() {
        let dir = tempdir().unwrap();
        let worker = ToolWorker::new(Phase::Cloud, vec![ToolSpec::new("fail", &["false"])]);
        let err = worker
            .run(&context(dir.path(), Phase::Cloud))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::PhaseFailure { phase: Phase::Cloud, .. }));
    }

    #[tokio::test]
    async fn test_rate_limit_marker_reports_signal() {
        let dir = tempdir().unwrap();
        let worker = ToolWorker::new(
            Phase::Crawl,
            vec![ToolSpec::new(
                "noisy",
                &["sh", "-c", "echo '[WRN] 429 Too Many Requests' >&2; echo ok"],
            )],
        );
        let ctx = context(dir.path(), Phase::Crawl);
        let outcome = worker.run(&ctx).await.unwrap();
        let signal = outcome.defensive_signal.unwrap();
        assert_eq!(signal.source, SignalSource::Worker("noisy".to_string()));
        assert_eq!(ctx.throttle.current_delay().await, Duration::from_secs(5));
    }

    #[test]
    fn test_marker_status() {
        assert_eq!(marker_status("429 Too Many Requests"), 429);
        assert_eq!(marker_status("rate-limited"), 429);
        assert_eq!(marker_status("503 Service Unavailable"), 503);
        assert_eq!(marker_status("CAPTCHA"), 403);
    }

    #[tokio::test]
    async fn test_stale_stderr_from_earlier_attempt_is_ignored() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Phase::Crawl);
        std::fs::create_dir_all(ctx.logs_dir()).unwrap();
        std::fs::write(
            ctx.logs_dir().join("old-attempt.stderr"),
            "[WRN] 429 Too Many Requests\n",
        )
        .unwrap();

        let worker = ToolWorker::new(Phase::Crawl, vec![ToolSpec::new("quiet", &["echo", "ok"])]);
        let outcome = worker.run(&ctx).await.unwrap();
        assert!(outcome.defensive_signal.is_none());
        assert!(!ctx.logs_dir().join("old-attempt.stderr").exists());
        assert_eq!(ctx.throttle.current_delay().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancelled_phase_reports_cancelled() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Phase::Screenshot);
        ctx.cancel.cancel();
        let worker = ToolWorker::new(Phase::Screenshot, vec![ToolSpec::new("s", &["sleep", "5"])]);
        assert!(matches!(
            worker.run(&ctx).await,
            Err(WorkerError::Cancelled(Phase::Screenshot))
        ));
    }
}

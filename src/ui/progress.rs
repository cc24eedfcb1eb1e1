use anyhow::Result;
use async_trait::async_trait;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::events::{Notifier, RunEvent, Stamped};
use crate::phase::{Phase, PhaseStatus};
use crate::scheduler::JobStatus;
use crate::ui::icons::{CHECK, CROSS, FINDING, RUNNING, SHIELD, SKIP, SPARKLE};

/// Terminal UI for a pipeline run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Phase bar: resolved phases out of the pipeline length
/// - Job bar: spinner with finished/failed job counts for the current phase
pub struct PipelineUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    job_bar: ProgressBar,
    verbose: bool,
    jobs_done: AtomicUsize,
    jobs_failed: AtomicUsize,
}

impl PipelineUI {
    /// Create the UI. `already_resolved` pre-fills the phase bar on resume.
    pub fn new(total_phases: u64, already_resolved: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");
        phase_bar.set_position(already_resolved);

        let job_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let job_bar = multi.add(ProgressBar::new_spinner());
        job_bar.set_style(job_style);
        job_bar.set_prefix("  Jobs");

        Self {
            multi,
            phase_bar,
            job_bar,
            verbose,
            jobs_done: AtomicUsize::new(0),
            jobs_failed: AtomicUsize::new(0),
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    pub fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn start_phase(&self, phase: Phase) {
        self.jobs_done.store(0, Ordering::SeqCst);
        self.jobs_failed.store(0, Ordering::SeqCst);
        self.phase_bar
            .set_message(format!("{}", style(phase.name()).yellow()));
        self.job_bar.set_message("starting...");
        self.job_bar.enable_steady_tick(Duration::from_millis(100));
        self.print_line(format!(
            "{} {} {}",
            RUNNING,
            style(phase.name()).yellow().bold(),
            style(phase.descriptor().summary).dim()
        ));
    }

    pub fn job_finished(&self, job: &str, status: JobStatus) {
        let done = self.jobs_done.fetch_add(1, Ordering::SeqCst) + 1;
        let failed = if status == JobStatus::Failed {
            self.jobs_failed.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.jobs_failed.load(Ordering::SeqCst)
        };
        self.job_bar
            .set_message(format!("{} finished, {} failed", style(done).cyan(), failed));
        if self.verbose {
            self.print_line(format!(
                "    {} {} {}",
                style("→").dim(),
                style(job).dim(),
                style(status).dim()
            ));
        }
    }

    pub fn phase_resolved(&self, phase: Phase, status: PhaseStatus, detail: Option<&str>) {
        self.phase_bar.inc(1);
        self.job_bar.disable_steady_tick();
        let detail = detail
            .map(|d| format!(" {}", style(format!("({})", d)).dim()))
            .unwrap_or_default();
        let line = match status {
            PhaseStatus::Complete => format!("{} {}{}", CHECK, style(phase).green().bold(), detail),
            PhaseStatus::Skipped => format!("{} {}{}", SKIP, style(phase).dim(), detail),
            _ => format!("{} {}{}", CROSS, style(phase).red().bold(), detail),
        };
        self.print_line(line);
    }

    pub fn finding(&self, tool: &str, lines: usize) {
        self.print_line(format!(
            "    {} {} {}",
            FINDING,
            style(tool).cyan(),
            style(format!("{} lines", lines)).dim()
        ));
    }

    pub fn escalated(&self, provider: &str, concurrency: usize, delay_secs: u64) {
        self.print_line(format!(
            "{} {} detected, slowing down (concurrency {}, delay {}s)",
            SHIELD,
            style(provider).magenta().bold(),
            concurrency,
            delay_secs
        ));
    }

    pub fn finish(&self) {
        self.job_bar.finish_and_clear();
        self.phase_bar.finish_with_message(format!("{}done", SPARKLE));
    }

    /// Clear the bars without a completion message (interrupt, fatal error).
    pub fn abandon(&self) {
        self.job_bar.finish_and_clear();
        self.phase_bar.abandon();
    }
}

/// Drives a `PipelineUI` from run events.
pub struct UiNotifier {
    ui: Arc<PipelineUI>,
}

impl UiNotifier {
    pub fn new(ui: Arc<PipelineUI>) -> Self {
        Self { ui }
    }
}

#[async_trait]
impl Notifier for UiNotifier {
    fn name(&self) -> &str {
        "ui"
    }

    async fn notify(&mut self, event: &Stamped) -> Result<()> {
        match &event.event {
            RunEvent::PhaseStarted { phase } => self.ui.start_phase(*phase),
            RunEvent::JobFinished { job, status, .. } => self.ui.job_finished(job, *status),
            RunEvent::PhaseResolved {
                phase,
                status,
                detail,
            } => self.ui.phase_resolved(*phase, *status, detail.as_deref()),
            RunEvent::Finding { tool, lines, .. } => self.ui.finding(tool, *lines),
            RunEvent::Escalated {
                provider,
                concurrency,
                delay_secs,
                ..
            } => self.ui.escalated(provider, *concurrency, *delay_secs),
            RunEvent::SessionStarted { .. } | RunEvent::SessionFinished { .. } => {}
        }
        Ok(())
    }
}

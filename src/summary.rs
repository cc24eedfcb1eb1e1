//! End-of-run summary.
//!
//! Non-fatal problems (missing tools, failed phases, skipped work) are collected here
//! while the session runs and printed once it ends.

use console::style;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use crate::phase::{Phase, PhaseStatus};
use crate::scheduler::JobSummary;
use crate::ui::icons::{CHECK, CLOCK, CROSS, SHIELD, SKIP, WARN};

/// Outcome of one phase within this invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub detail: Option<String>,
    pub jobs: JobSummary,
    pub artifacts: Vec<PathBuf>,
}

/// Everything that happened during one `run` or `resume`.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub target: String,
    pub workspace: PathBuf,
    pub resumed: bool,
    pub phases: Vec<PhaseReport>,
    pub warnings: Vec<String>,
    /// Provider that triggered escalation during this invocation
    pub escalation: Option<String>,
    /// Phase that was running when the run was interrupted
    pub interrupted: Option<Phase>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(target: &str, workspace: PathBuf, resumed: bool) -> Self {
        Self {
            target: target.to_string(),
            workspace,
            resumed,
            ..Default::default()
        }
    }

    pub fn record(&mut self, report: PhaseReport) {
        self.phases.push(report);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.iter().filter(|p| p.status == status).count()
    }

    pub fn jobs(&self) -> JobSummary {
        let mut total = JobSummary::default();
        for report in &self.phases {
            total.merge(report.jobs);
        }
        total
    }

    /// Plain-text rendering used by `print` and tests.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} {} {}",
            style("Summary for").bold(),
            style(&self.target).cyan().bold(),
            style(format!("({})", self.workspace.display())).dim()
        );

        for report in &self.phases {
            let icon = match report.status {
                PhaseStatus::Complete => CHECK,
                PhaseStatus::Skipped => SKIP,
                _ => CROSS,
            };
            let mut line = format!("  {}{:<20} {}", icon, report.phase.name(), report.status);
            if report.jobs.total() > 0 {
                let _ = write!(
                    line,
                    "  {} jobs, {} failed",
                    report.jobs.total(),
                    report.jobs.failed
                );
            }
            if !report.artifacts.is_empty() {
                let _ = write!(line, "  {} artifacts", report.artifacts.len());
            }
            if let Some(ref detail) = report.detail {
                let _ = write!(line, "  {}", style(detail).dim());
            }
            let _ = writeln!(out, "{}", line);
        }

        if let Some(ref provider) = self.escalation {
            let _ = writeln!(out, "  {}escalated after {} was detected", SHIELD, provider);
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\n{}", style("Warnings:").yellow().bold());
            for warning in &self.warnings {
                let _ = writeln!(out, "  {}{}", WARN, warning);
            }
        }

        let _ = writeln!(
            out,
            "\n  {}{} complete, {} skipped, {} failed in {}s",
            CLOCK,
            self.count(PhaseStatus::Complete),
            self.count(PhaseStatus::Skipped),
            self.count(PhaseStatus::Failed),
            self.elapsed.as_secs()
        );
        out
    }

    pub fn print(&self) {
        println!("{}", self.render());
    }
}

//! Phase listing and session status commands.

use anyhow::Result;
use console::style;
use std::path::Path;

use reconflow::orchestrator::PhaseStateMachine;
use reconflow::orchestrator::state::resolve_checkpoint;
use reconflow::phase::{PHASES, Phase, PhaseStatus};
use reconflow::ui::icons::{CHECK, CROSS, RUNNING, SHIELD, SKIP};

pub fn cmd_phases() {
    println!();
    println!("{:<4} {:<20} {:<16} Description", "#", "Phase", "After");
    println!("{:<4} {:<20} {:<16} -----------", "--", "-----", "-----");
    for descriptor in PHASES.iter().filter(|d| !d.phase.is_done()) {
        let after = descriptor
            .predecessor
            .map(Phase::name)
            .unwrap_or("-");
        let marker = if descriptor.escalation_sensitive {
            format!(" {}", style("(skipped when escalated)").dim())
        } else {
            String::new()
        };
        println!(
            "{:<4} {:<20} {:<16} {}{}",
            descriptor.phase.position() + 1,
            descriptor.name,
            after,
            descriptor.summary,
            marker
        );
    }
    println!();
}

pub fn cmd_status(path: &Path) -> Result<()> {
    let checkpoint = resolve_checkpoint(path);
    let session = PhaseStateMachine::load(&checkpoint)?;

    println!();
    println!("Session:    {}", session.session_id);
    println!("Target:     {}", style(&session.target).cyan().bold());
    println!("Workspace:  {}", session.workspace.display());
    println!("Mode:       {}", session.mode);
    println!(
        "Started:    {}",
        session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "Saved:      {}",
        session.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "Budget:     concurrency {}, {} req/{}s, delay {}s, timeout {}s",
        session.budget.max_concurrency,
        session.budget.rate_limit,
        session.budget.period_secs,
        session.budget.delay_secs,
        session.budget.timeout_secs
    );
    if let Some(provider) = session.defense.escalated_by() {
        println!("Defense:    {}escalated ({})", SHIELD, provider);
    }
    println!();

    let next = session.next_unresolved();
    for phase in Phase::pipeline() {
        let status = session.status(phase);
        let icon = match status {
            PhaseStatus::Complete => CHECK.to_string(),
            PhaseStatus::Skipped => SKIP.to_string(),
            PhaseStatus::Failed => CROSS.to_string(),
            _ if phase == next => RUNNING.to_string(),
            _ => "   ".to_string(),
        };
        println!("  {}{:<20} {}", icon, phase.name(), status);
    }
    println!();

    if session.is_finished() {
        println!("Session finished.");
    } else {
        println!(
            "Next phase: {}. Resume with: reconflow resume {}",
            style(next).yellow().bold(),
            session.workspace.display()
        );
    }
    println!();
    Ok(())
}

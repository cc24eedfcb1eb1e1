//! Session execution: `reconflow run` and `reconflow resume`.

use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use reconflow::config::{Config, validate_target};
use reconflow::defense::{DefenseProbe, NetworkProbe, NoProbe};
use reconflow::errors::OrchestratorError;
use reconflow::events::{EventSink, JsonlNotifier, LogNotifier, Notifier, spawn_dispatcher};
use reconflow::orchestrator::state::{CHECKPOINT_FILE, resolve_checkpoint};
use reconflow::orchestrator::{NewSession, PhaseStateMachine, SessionOrchestrator};
use reconflow::phase::Phase;
use reconflow::summary::RunSummary;
use reconflow::throttle::BudgetOverrides;
use reconflow::ui::{PipelineUI, UiNotifier};

use super::super::{Cli, RunArgs, init_logging};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let target = validate_target(&args.target)?;
    let workspace = match &args.workspace {
        Some(dir) => dir.clone(),
        None => Config::default_workspace(&target, cli.config.as_deref())?,
    };
    let config = Config::load(&workspace, cli.config.as_deref())?;
    config
        .ensure_directories()
        .with_context(|| format!("Failed to create workspace {}", config.workspace.display()))?;
    let _guard = init_logging(cli.verbose, Some(&config.log_dir));

    let mode = args.mode.unwrap_or(config.file.defaults.mode);
    let cli_overrides = BudgetOverrides {
        concurrency: args.concurrency,
        rate_limit: args.rate_limit,
        delay_secs: args.delay,
        timeout_secs: args.timeout,
    };
    let budget = config.resolve_budget(mode, BudgetOverrides::from_env()?, cli_overrides)?;

    let probe: Arc<dyn DefenseProbe> = if args.no_probe || !config.file.defaults.probe {
        Arc::new(NoProbe)
    } else {
        Arc::new(NetworkProbe::new(PROBE_TIMEOUT)?)
    };

    println!(
        "{} {} {}",
        style("Target").bold(),
        style(&target).cyan().bold(),
        style(format!(
            "({} mode, concurrency {}, {} req/{}s, delay {}s)",
            mode, budget.max_concurrency, budget.rate_limit, budget.period_secs, budget.delay_secs
        ))
        .dim()
    );
    println!("{} {}", style("Workspace").bold(), config.workspace.display());

    let registry = config.file.worker_registry();
    let run = RunHarness::start(&config, 0, cli.verbose).await?;
    let orchestrator = SessionOrchestrator::new(config.clone(), registry)
        .with_probe(probe)
        .with_events(run.events.clone())
        .with_cancellation(run.cancel.clone());

    let result = orchestrator
        .start(NewSession {
            target,
            mode,
            budget,
            skips: args.skips(),
            force: args.force,
        })
        .await;
    drop(orchestrator);
    run.finish(result, &config.workspace).await
}

pub async fn cmd_resume(cli: &Cli, path: &Path, skips: Vec<Phase>) -> Result<()> {
    let checkpoint = resolve_checkpoint(path);
    // Read-only load first so a corrupt file is reported before anything is touched.
    let session = PhaseStateMachine::load(&checkpoint)?;
    let workspace = checkpoint_workspace(&checkpoint);
    let config = Config::load(&workspace, cli.config.as_deref())?;
    config
        .ensure_directories()
        .with_context(|| format!("Failed to prepare workspace {}", config.workspace.display()))?;
    let _guard = init_logging(cli.verbose, Some(&config.log_dir));

    if session.is_finished() {
        println!(
            "Session {} for {} already finished. Nothing to resume.",
            session.session_id, session.target
        );
        return Ok(());
    }

    println!(
        "{} {} {}",
        style("Resuming").bold(),
        style(&session.target).cyan().bold(),
        style(format!(
            "at {} ({} of {} phases resolved)",
            session.next_unresolved(),
            session.resolved_count(),
            Phase::pipeline().count()
        ))
        .dim()
    );

    let registry = config.file.worker_registry();
    let run = RunHarness::start(&config, session.resolved_count() as u64, cli.verbose).await?;
    let orchestrator = SessionOrchestrator::new(config.clone(), registry)
        .with_events(run.events.clone())
        .with_cancellation(run.cancel.clone());

    let result = orchestrator.resume(&checkpoint, skips).await;
    drop(orchestrator);
    run.finish(result, &config.workspace).await
}

/// Workspace that holds `checkpoint`.
fn checkpoint_workspace(checkpoint: &Path) -> PathBuf {
    match checkpoint.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// UI, event dispatch and interrupt handling around one orchestrator call.
struct RunHarness {
    ui: Arc<PipelineUI>,
    events: EventSink,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl RunHarness {
    async fn start(config: &Config, already_resolved: u64, verbose: bool) -> Result<Self> {
        let total = Phase::pipeline().count() as u64;
        let ui = Arc::new(PipelineUI::new(total, already_resolved, verbose));
        let notifiers: Vec<Box<dyn Notifier>> = vec![
            Box::new(LogNotifier),
            Box::new(JsonlNotifier::open(&config.events_file).await?),
            Box::new(UiNotifier::new(Arc::clone(&ui))),
        ];
        let (events, dispatcher) = spawn_dispatcher(notifiers);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping running jobs");
                trigger.cancel();
            }
        });

        Ok(Self {
            ui,
            events,
            cancel,
            dispatcher,
        })
    }

    /// Flush events, then print the summary. Every `EventSink` clone other than ours
    /// must already be dropped.
    async fn finish(
        self,
        result: Result<RunSummary, OrchestratorError>,
        workspace: &Path,
    ) -> Result<()> {
        let Self {
            ui,
            events,
            dispatcher,
            ..
        } = self;
        drop(events);
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "Event dispatcher stopped abnormally");
        }

        match result {
            Ok(summary) => match summary.interrupted {
                Some(phase) => {
                    ui.abandon();
                    summary.print();
                    print_resume_hint(workspace);
                    Err(OrchestratorError::Interrupted(phase).into())
                }
                None => {
                    ui.finish();
                    summary.print();
                    info!(workspace = %workspace.display(), "Run complete");
                    Ok(())
                }
            },
            Err(e) => {
                ui.abandon();
                if workspace.join(CHECKPOINT_FILE).exists() {
                    print_resume_hint(workspace);
                }
                Err(e.into())
            }
        }
    }
}

fn print_resume_hint(workspace: &Path) {
    println!(
        "\nResume with: {}",
        style(format!("reconflow resume {}", workspace.display())).bold()
    );
}

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use reconflow::phase::Phase;
use reconflow::throttle::Mode;

mod cmd;

#[derive(Parser)]
#[command(name = "reconflow")]
#[command(version, about = "Resumable recon pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a reconflow.toml. Replaces the normal search order.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new session against a target
    Run(RunArgs),
    /// Continue an interrupted session from its checkpoint
    Resume {
        /// Workspace directory or checkpoint file
        path: PathBuf,

        /// Skip a remaining phase (repeatable)
        #[arg(long = "skip", value_name = "PHASE")]
        skip: Vec<Phase>,
    },
    /// Show the state of a session
    Status {
        /// Workspace directory or checkpoint file
        path: PathBuf,
    },
    /// List the pipeline phases in order
    Phases,
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Hostname or IP address to scan
    pub target: String,

    /// Workspace directory (default: <workspace_root>/<target>)
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// conservative or aggressive
    #[arg(short, long)]
    pub mode: Option<Mode>,

    /// Skip a phase (repeatable)
    #[arg(long = "skip", value_name = "PHASE")]
    pub skip: Vec<Phase>,

    #[arg(long)]
    pub skip_port_scan: bool,

    #[arg(long)]
    pub skip_fuzz: bool,

    #[arg(long)]
    pub skip_screenshot: bool,

    /// Maximum concurrent jobs
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Requests per period
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Delay between dispatches, in seconds
    #[arg(long)]
    pub delay: Option<u64>,

    /// Per-job timeout, in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Do not check for CDN/WAF fronting before the first phase
    #[arg(long)]
    pub no_probe: bool,

    /// Replace an existing checkpoint in the workspace
    #[arg(long)]
    pub force: bool,
}

impl RunArgs {
    /// `--skip` values plus the dedicated `--skip-*` flags.
    pub fn skips(&self) -> Vec<Phase> {
        let mut skips = self.skip.clone();
        for (flag, phase) in [
            (self.skip_port_scan, Phase::PortScan),
            (self.skip_fuzz, Phase::Fuzz),
            (self.skip_screenshot, Phase::Screenshot),
        ] {
            if flag && !skips.contains(&phase) {
                skips.push(phase);
            }
        }
        skips
    }
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Write a starter reconflow.toml
    Init {
        /// Directory to write into
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

/// Install the global subscriber.
///
/// Stderr gets `RUST_LOG` (or warnings, debug with `-v`). When `log_dir` is given, a
/// JSON file layer records debug events to `<log_dir>/reconflow.log`; keep the returned
/// guard alive until exit so it flushes.
pub fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default = if verbose {
        "reconflow=debug"
    } else {
        "reconflow=warn"
    };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "reconflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new("reconflow=debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, args).await?,
        Commands::Resume { path, skip } => cmd::cmd_resume(&cli, path, skip.clone()).await?,
        Commands::Status { path } => {
            let _guard = init_logging(cli.verbose, None);
            cmd::cmd_status(path)?
        }
        Commands::Phases => cmd::cmd_phases(),
        Commands::Config { command } => {
            let _guard = init_logging(cli.verbose, None);
            cmd::cmd_config(&cli, command.clone())?
        }
    }

    Ok(())
}

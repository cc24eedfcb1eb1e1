use regex::Regex;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

use crate::errors::ConfigError;
use crate::orchestrator::state::{CHECKPOINT_FILE, LOCK_FILE};
use crate::phase::Phase;
use crate::recon_config::ReconToml;
use crate::throttle::{Budget, BudgetOverrides, Mode};

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)+$")
        .unwrap()
});

/// Runtime configuration for one workspace.
///
/// Bridges the file configuration with the paths and values a session needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: PathBuf,
    pub checkpoint_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_dir: PathBuf,
    pub events_file: PathBuf,
    /// Scratch space removed on interrupt
    pub tmp_dir: PathBuf,
    /// The underlying file configuration
    pub file: ReconToml,
    /// Where `file` was read from, if anywhere
    pub source: Option<PathBuf>,
}

impl Config {
    /// Load configuration for `workspace`, searching for a config file as documented
    /// in [`crate::recon_config`]. Invalid files are rejected.
    pub fn load(workspace: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let workspace = std::path::absolute(workspace).map_err(|e| ConfigError::InvalidValue {
            key: "workspace".to_string(),
            value: workspace.display().to_string(),
            reason: e.to_string(),
        })?;
        let (file, source) = ReconToml::discover(explicit, Some(&workspace))?;
        let origin = source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in defaults".to_string());
        file.check(&origin)?;
        debug!(workspace = %workspace.display(), config = %origin, "Configuration loaded");

        Ok(Self {
            checkpoint_file: workspace.join(CHECKPOINT_FILE),
            lock_file: workspace.join(LOCK_FILE),
            log_dir: workspace.join("logs"),
            events_file: workspace.join("events.jsonl"),
            tmp_dir: workspace.join(".tmp"),
            workspace,
            file,
            source,
        })
    }

    /// Default workspace for `target` under the configured root.
    pub fn default_workspace(
        target: &str,
        explicit: Option<&Path>,
    ) -> Result<PathBuf, ConfigError> {
        let (file, _) = ReconToml::discover(explicit, None)?;
        Ok(file.defaults.workspace_root.join(target))
    }

    /// Budget for `mode`: file values, then environment, then CLI.
    pub fn resolve_budget(
        &self,
        mode: Mode,
        env: BudgetOverrides,
        cli: BudgetOverrides,
    ) -> Result<Budget, ConfigError> {
        let budget = env.merge(cli).apply(self.file.budget_for(mode));
        let problems = budget.validate();
        if problems.is_empty() {
            Ok(budget)
        } else {
            Err(ConfigError::Invalid {
                origin: "budget overrides".to_string(),
                problems,
            })
        }
    }

    pub fn phase_dir(&self, phase: Phase) -> PathBuf {
        self.workspace.join(phase.name())
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.workspace)?;
        std::fs::create_dir_all(&self.log_dir)?;
        std::fs::create_dir_all(&self.tmp_dir)?;
        Ok(())
    }

    /// Remove the scratch directory. Missing is fine.
    pub fn clean_tmp(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.tmp_dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Normalize and check a target. Accepts hostnames and IP addresses.
pub fn validate_target(raw: &str) -> Result<String, ConfigError> {
    let target = raw.trim().trim_end_matches('.').to_lowercase();
    if target.parse::<IpAddr>().is_ok() || HOSTNAME_RE.is_match(&target) {
        Ok(target)
    } else {
        Err(ConfigError::InvalidTarget(raw.to_string()))
    }
}

//! File configuration for reconflow.
//!
//! Settings are layered file → environment → CLI. This module owns the file layer,
//! read from `reconflow.toml`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [defaults]
//! mode = "conservative"
//! workspace_root = "recon"
//! probe = true
//!
//! [budgets.conservative]
//! max_concurrency = 4
//! rate_limit = 60
//!
//! [escalation]
//! concurrency_factor = 0.5
//! delay_factor = 2.0
//! skip_phases = ["port-scan"]
//!
//! [phases.fuzz]
//! enabled = false
//!
//! [[phases.crawl.tools]]
//! name = "gau"
//! argv = ["gau", "{target}"]
//! output = "urls.txt"
//! ```
//!
//! # Search order
//!
//! 1. `--config <path>` (must exist)
//! 2. `<workspace>/reconflow.toml`
//! 3. `<config dir>/reconflow/reconflow.toml`
//! 4. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::errors::ConfigError;
use crate::phase::{Phase, PhasePlan};
use crate::throttle::{Budget, EscalationPolicy, Mode};
use crate::workers::{ToolSpec, ToolWorker, WorkerRegistry, default_tools};

pub const CONFIG_FILE: &str = "reconflow.toml";

/// Default settings for every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Scan mode when `--mode` is not given
    #[serde(default)]
    pub mode: Mode,
    /// Directory that holds one workspace per target
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Probe the target for CDN/WAF fronting before the first phase
    #[serde(default = "default_probe")]
    pub probe: bool,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("recon")
}

fn default_probe() -> bool {
    true
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            workspace_root: default_workspace_root(),
            probe: default_probe(),
        }
    }
}

/// Partial budget; unset fields keep the mode's default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl BudgetOverride {
    pub fn apply(&self, budget: Budget) -> Budget {
        Budget {
            max_concurrency: self.max_concurrency.unwrap_or(budget.max_concurrency),
            rate_limit: self.rate_limit.unwrap_or(budget.rate_limit),
            period_secs: self.period_secs.unwrap_or(budget.period_secs),
            delay_secs: self.delay_secs.unwrap_or(budget.delay_secs),
            timeout_secs: self.timeout_secs.unwrap_or(budget.timeout_secs),
        }
    }
}

/// Per-mode budget overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetsSection {
    #[serde(default)]
    pub conservative: BudgetOverride,
    #[serde(default)]
    pub aggressive: BudgetOverride,
}

/// Settings for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Replaces the built-in tool table for this phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
}

fn default_enabled() -> bool {
    true
}

impl Default for PhaseSection {
    fn default() -> Self {
        Self {
            enabled: true,
            tools: None,
        }
    }
}

/// The complete reconflow.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconToml {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub budgets: BudgetsSection,
    #[serde(default)]
    pub escalation: EscalationPolicy,
    /// Keyed by phase name
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseSection>,
}

impl ReconToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from(CONFIG_FILE),
            message: e.to_string(),
        })
    }

    /// Find and load the first config file in search order.
    ///
    /// Returns the parsed config and the file it came from, if any.
    pub fn discover(
        explicit: Option<&Path>,
        workspace: Option<&Path>,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        for candidate in search_paths(workspace) {
            if candidate.is_file() {
                debug!(path = %candidate.display(), "Loading config");
                return Ok((Self::load(&candidate)?, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize reconflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Budget for `mode` with this file's overrides applied.
    pub fn budget_for(&self, mode: Mode) -> Budget {
        let overrides = match mode {
            Mode::Conservative => &self.budgets.conservative,
            Mode::Aggressive => &self.budgets.aggressive,
        };
        overrides.apply(Budget::for_mode(mode))
    }

    fn section(&self, phase: Phase) -> Option<&PhaseSection> {
        self.phases.get(phase.name())
    }

    pub fn phase_enabled(&self, phase: Phase) -> bool {
        self.section(phase).is_none_or(|s| s.enabled)
    }

    pub fn disabled_phases(&self) -> Vec<Phase> {
        Phase::pipeline()
            .filter(|p| !self.phase_enabled(*p))
            .collect()
    }

    /// Tool table for `phase`: the file's list if present, else the built-in one.
    pub fn tools_for(&self, phase: Phase) -> Vec<ToolSpec> {
        self.section(phase)
            .and_then(|s| s.tools.clone())
            .unwrap_or_else(|| default_tools(phase))
    }

    /// Base phase plan: disabled phases plus escalation skips.
    pub fn phase_plan(&self) -> PhasePlan {
        PhasePlan::new()
            .with_disabled(self.disabled_phases())
            .with_escalation_skips(self.escalation.skip_phases.iter().copied())
    }

    /// One `ToolWorker` per pipeline phase.
    pub fn worker_registry(&self) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for phase in Phase::pipeline() {
            registry.register(Arc::new(ToolWorker::new(phase, self.tools_for(phase))));
        }
        registry
    }

    /// Validate the configuration and return any problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for mode in [Mode::Conservative, Mode::Aggressive] {
            for p in self.budget_for(mode).validate() {
                problems.push(format!("budgets.{}: {}", mode, p));
            }
        }
        problems.extend(self.escalation.validate());
        if self.escalation.skip_phases.contains(&Phase::Done) {
            problems.push("escalation.skip_phases cannot contain 'done'".to_string());
        }

        for (name, section) in &self.phases {
            let phase = match name.parse::<Phase>() {
                Ok(p) if !p.is_done() => p,
                _ => {
                    problems.push(format!("phases.{}: unknown phase", name));
                    continue;
                }
            };
            let Some(ref tools) = section.tools else {
                continue;
            };
            let mut names = HashSet::new();
            for tool in tools {
                if !names.insert(tool.name.as_str()) {
                    problems.push(format!("phases.{}: duplicate tool '{}'", phase, tool.name));
                }
                for p in tool.validate() {
                    problems.push(format!("phases.{}: {}", phase, p));
                }
            }
        }

        problems
    }

    /// `validate` as a `Result`.
    pub fn check(&self, origin: &str) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                origin: origin.to_string(),
                problems,
            })
        }
    }
}

/// Candidate config files after `--config`, in priority order.
pub fn search_paths(workspace: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(ws) = workspace {
        paths.push(ws.join(CONFIG_FILE));
    }
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("reconflow").join(CONFIG_FILE));
    }
    paths
}

/// Commented starter file written by `reconflow config init`.
pub fn starter_config() -> String {
    format!(
        r#"# reconflow configuration

[defaults]
# conservative or aggressive
mode = "conservative"
# One workspace per target is created under this directory
workspace_root = "recon"
# Check for CDN/WAF fronting before the first phase
probe = true

# Per-mode budgets. Unset fields keep the built-in values.
[budgets.conservative]
max_concurrency = {c_conc}
rate_limit = {c_rate}
period_secs = {c_period}
delay_secs = {c_delay}
timeout_secs = {c_timeout}

[budgets.aggressive]
max_concurrency = {a_conc}
rate_limit = {a_rate}

# Applied once when a defensive signal is seen
[escalation]
concurrency_factor = 0.5
delay_factor = 2.0
rate_factor = 0.5
min_rate = 10
skip_phases = ["port-scan"]

# Disable a phase:
# [phases.fuzz]
# enabled = false

# Replace a phase's tools:
# [[phases.crawl.tools]]
# name = "gau"
# argv = ["gau", "--subs", "{{target}}"]
# output = "urls.txt"
"#,
        c_conc = Budget::for_mode(Mode::Conservative).max_concurrency,
        c_rate = Budget::for_mode(Mode::Conservative).rate_limit,
        c_period = Budget::for_mode(Mode::Conservative).period_secs,
        c_delay = Budget::for_mode(Mode::Conservative).delay_secs,
        c_timeout = Budget::for_mode(Mode::Conservative).timeout_secs,
        a_conc = Budget::for_mode(Mode::Aggressive).max_concurrency,
        a_rate = Budget::for_mode(Mode::Aggressive).rate_limit,
    )
}

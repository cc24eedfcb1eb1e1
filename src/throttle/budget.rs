//! Request budgets, scan modes and the escalation policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::phase::Phase;

/// Environment variables consumed as budget overrides.
pub const ENV_CONCURRENCY: &str = "RECONFLOW_CONCURRENCY";
pub const ENV_RATE_LIMIT: &str = "RECONFLOW_RATE_LIMIT";
pub const ENV_DELAY: &str = "RECONFLOW_DELAY";
pub const ENV_TIMEOUT: &str = "RECONFLOW_TIMEOUT";

/// Scan aggressiveness selected for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Conservative,
    Aggressive,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Conservative => write!(f, "conservative"),
            Mode::Aggressive => write!(f, "aggressive"),
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(Mode::Conservative),
            "aggressive" => Ok(Mode::Aggressive),
            _ => Err(ConfigError::InvalidValue {
                key: "mode".to_string(),
                value: s.to_string(),
                reason: "valid values: conservative, aggressive".to_string(),
            }),
        }
    }
}

/// The active request budget for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum jobs running at once inside a phase
    pub max_concurrency: usize,
    /// Requests allowed per period
    pub rate_limit: u32,
    /// Length of the rate window in seconds
    pub period_secs: u64,
    /// Delay between dispatches in seconds
    pub delay_secs: u64,
    /// Per-job timeout in seconds
    pub timeout_secs: u64,
}

impl Budget {
    /// Default budget for a scan mode.
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Conservative => Self {
                max_concurrency: 4,
                rate_limit: 60,
                period_secs: 60,
                delay_secs: 2,
                timeout_secs: 900,
            },
            Mode::Aggressive => Self {
                max_concurrency: 16,
                rate_limit: 300,
                period_secs: 60,
                delay_secs: 0,
                timeout_secs: 600,
            },
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs.max(1))
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Return a list of problems with this budget. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_concurrency == 0 {
            problems.push("max_concurrency must be at least 1".to_string());
        }
        if self.rate_limit == 0 {
            problems.push("rate_limit must be at least 1".to_string());
        }
        if self.period_secs == 0 {
            problems.push("period_secs must be at least 1".to_string());
        }
        if self.timeout_secs == 0 {
            problems.push("timeout_secs must be at least 1".to_string());
        }
        problems
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::for_mode(Mode::default())
    }
}

/// Per-field overrides from the environment or CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetOverrides {
    pub concurrency: Option<usize>,
    pub rate_limit: Option<u32>,
    pub delay_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

impl BudgetOverrides {
    /// Read `RECONFLOW_*` overrides through `lookup`. Unset variables are ignored;
    /// unparsable or zero values are a `ConfigError`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            concurrency: parse_positive(ENV_CONCURRENCY, lookup(ENV_CONCURRENCY))?,
            rate_limit: parse_positive(ENV_RATE_LIMIT, lookup(ENV_RATE_LIMIT))?,
            delay_secs: parse_var(ENV_DELAY, lookup(ENV_DELAY))?,
            timeout_secs: parse_positive(ENV_TIMEOUT, lookup(ENV_TIMEOUT))?,
        })
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Layer `other` on top of `self` (values in `other` win).
    pub fn merge(self, other: BudgetOverrides) -> Self {
        Self {
            concurrency: other.concurrency.or(self.concurrency),
            rate_limit: other.rate_limit.or(self.rate_limit),
            delay_secs: other.delay_secs.or(self.delay_secs),
            timeout_secs: other.timeout_secs.or(self.timeout_secs),
        }
    }

    pub fn apply(&self, mut budget: Budget) -> Budget {
        if let Some(c) = self.concurrency {
            budget.max_concurrency = c;
        }
        if let Some(r) = self.rate_limit {
            budget.rate_limit = r;
        }
        if let Some(d) = self.delay_secs {
            budget.delay_secs = d;
        }
        if let Some(t) = self.timeout_secs {
            budget.timeout_secs = t;
        }
        budget
    }
}

fn parse_var<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
                reason: "expected a non-negative integer".to_string(),
            }),
    }
}

fn parse_positive<T>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let parsed = parse_var::<T>(key, raw.clone())?;
    if parsed.as_ref() == Some(&T::default()) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.unwrap_or_default(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(parsed)
}

/// How the budget tightens when a defensive signal is observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Multiplier applied to max concurrency (floor 1)
    #[serde(default = "default_concurrency_factor")]
    pub concurrency_factor: f64,
    /// Multiplier applied to the dispatch delay
    #[serde(default = "default_delay_factor")]
    pub delay_factor: f64,
    /// Multiplier applied to the rate limit (floor `min_rate`)
    #[serde(default = "default_rate_factor")]
    pub rate_factor: f64,
    #[serde(default = "default_min_rate")]
    pub min_rate: u32,
    /// Phases skipped entirely once escalated
    #[serde(default = "default_skip_phases")]
    pub skip_phases: Vec<Phase>,
}

fn default_concurrency_factor() -> f64 {
    0.5
}

fn default_delay_factor() -> f64 {
    2.0
}

fn default_rate_factor() -> f64 {
    0.5
}

fn default_min_rate() -> u32 {
    10
}

fn default_skip_phases() -> Vec<Phase> {
    vec![Phase::PortScan]
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            concurrency_factor: default_concurrency_factor(),
            delay_factor: default_delay_factor(),
            rate_factor: default_rate_factor(),
            min_rate: default_min_rate(),
            skip_phases: default_skip_phases(),
        }
    }
}

impl EscalationPolicy {
    /// Tighten `budget` according to this policy.
    ///
    /// A zero delay stays at least one second so escalation always slows dispatch.
    pub fn apply(&self, budget: Budget) -> Budget {
        let concurrency = ((budget.max_concurrency as f64) * self.concurrency_factor).floor();
        let delay = ((budget.delay_secs as f64) * self.delay_factor).ceil();
        let rate = ((budget.rate_limit as f64) * self.rate_factor).floor();
        let rate_floor = self.min_rate.min(budget.rate_limit).max(1);

        Budget {
            max_concurrency: (concurrency as usize).max(1),
            rate_limit: (rate as u32).max(rate_floor),
            delay_secs: (delay as u64).max(1),
            ..budget
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(self.concurrency_factor > 0.0 && self.concurrency_factor <= 1.0) {
            problems.push(format!(
                "escalation.concurrency_factor {} must be in (0, 1]",
                self.concurrency_factor
            ));
        }
        if self.delay_factor < 1.0 {
            problems.push(format!(
                "escalation.delay_factor {} must be at least 1",
                self.delay_factor
            ));
        }
        if !(self.rate_factor > 0.0 && self.rate_factor <= 1.0) {
            problems.push(format!(
                "escalation.rate_factor {} must be in (0, 1]",
                self.rate_factor
            ));
        }
        problems
    }
}

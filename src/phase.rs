//! Phase definitions for the recon pipeline.
//!
//! This module provides:
//! - `Phase`, the typed identifier of every pipeline stage
//! - `PHASES`, the single declarative table of the canonical order
//! - `PhaseStatus`, the per-phase lifecycle used by the state machine
//! - `PhasePlan`, the enable/skip decisions applied when advancing

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// A stage of the recon pipeline. Variant order is the canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Recon,
    TakeoverCheck,
    PortScan,
    Crawl,
    Secrets,
    Fuzz,
    Screenshot,
    Cloud,
    LeakSearch,
    VulnerabilityScan,
    /// Terminal marker. Never executed.
    Done,
}

/// Static description of a phase and its place in the order.
#[derive(Debug, Clone, Copy)]
pub struct PhaseDescriptor {
    pub phase: Phase,
    /// Kebab-case name used in the CLI, checkpoint and workspace directories
    pub name: &'static str,
    /// Phase that must be resolved before this one may start
    pub predecessor: Option<Phase>,
    /// Skipped entirely once the session is escalated
    pub escalation_sensitive: bool,
    pub summary: &'static str,
}

/// The canonical phase order. Every other component derives ordering from this table.
pub const PHASES: [PhaseDescriptor; 11] = [
    PhaseDescriptor {
        phase: Phase::Recon,
        name: "recon",
        predecessor: None,
        escalation_sensitive: false,
        summary: "Subdomain enumeration and live host discovery",
    },
    PhaseDescriptor {
        phase: Phase::TakeoverCheck,
        name: "takeover-check",
        predecessor: Some(Phase::Recon),
        escalation_sensitive: false,
        summary: "Dangling DNS and subdomain takeover checks",
    },
    PhaseDescriptor {
        phase: Phase::PortScan,
        name: "port-scan",
        predecessor: Some(Phase::TakeoverCheck),
        escalation_sensitive: true,
        summary: "Port scanning of discovered hosts",
    },
    PhaseDescriptor {
        phase: Phase::Crawl,
        name: "crawl",
        predecessor: Some(Phase::PortScan),
        escalation_sensitive: false,
        summary: "URL crawling and endpoint collection",
    },
    PhaseDescriptor {
        phase: Phase::Secrets,
        name: "secrets",
        predecessor: Some(Phase::Crawl),
        escalation_sensitive: false,
        summary: "Secret scanning of crawled content",
    },
    PhaseDescriptor {
        phase: Phase::Fuzz,
        name: "fuzz",
        predecessor: Some(Phase::Secrets),
        escalation_sensitive: false,
        summary: "Content discovery fuzzing",
    },
    PhaseDescriptor {
        phase: Phase::Screenshot,
        name: "screenshot",
        predecessor: Some(Phase::Fuzz),
        escalation_sensitive: false,
        summary: "Screenshots of live web hosts",
    },
    PhaseDescriptor {
        phase: Phase::Cloud,
        name: "cloud",
        predecessor: Some(Phase::Screenshot),
        escalation_sensitive: false,
        summary: "Cloud storage and asset enumeration",
    },
    PhaseDescriptor {
        phase: Phase::LeakSearch,
        name: "leak-search",
        predecessor: Some(Phase::Cloud),
        escalation_sensitive: false,
        summary: "Public code and paste leak search",
    },
    PhaseDescriptor {
        phase: Phase::VulnerabilityScan,
        name: "vulnerability-scan",
        predecessor: Some(Phase::LeakSearch),
        escalation_sensitive: false,
        summary: "Template-based vulnerability scanning",
    },
    PhaseDescriptor {
        phase: Phase::Done,
        name: "done",
        predecessor: Some(Phase::VulnerabilityScan),
        escalation_sensitive: false,
        summary: "Pipeline finished",
    },
];

const fn order_is_consistent() -> bool {
    let mut i = 0;
    while i < PHASES.len() {
        if PHASES[i].phase as usize != i {
            return false;
        }
        match PHASES[i].predecessor {
            None => {
                if i != 0 {
                    return false;
                }
            }
            Some(prev) => {
                if i == 0 || prev as usize != i - 1 {
                    return false;
                }
            }
        }
        i += 1;
    }
    true
}

const _: () = assert!(order_is_consistent(), "PHASES table is out of order");

impl Phase {
    /// Look up the static descriptor for this phase.
    pub fn descriptor(self) -> &'static PhaseDescriptor {
        &PHASES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Position in the canonical order (0-based).
    pub fn position(self) -> usize {
        self as usize
    }

    pub fn predecessor(self) -> Option<Phase> {
        self.descriptor().predecessor
    }

    /// The phase after this one, or `None` for `Done`.
    pub fn successor(self) -> Option<Phase> {
        PHASES.get(self.position() + 1).map(|d| d.phase)
    }

    pub fn is_done(self) -> bool {
        self == Phase::Done
    }

    /// Every executable phase in canonical order (excludes `Done`).
    pub fn pipeline() -> impl Iterator<Item = Phase> {
        PHASES.iter().map(|d| d.phase).filter(|p| !p.is_done())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        PHASES
            .iter()
            .find(|d| d.name == wanted)
            .map(|d| d.phase)
            .ok_or_else(|| ConfigError::UnknownPhase(s.to_string()))
    }
}

/// Lifecycle status of a phase within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Skipped,
    Failed,
}

impl PhaseStatus {
    /// Check if the phase is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a phase was not executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Requested,
    Escalated { provider: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled in configuration"),
            Self::Requested => write!(f, "skipped on request"),
            Self::Escalated { provider } => {
                write!(f, "skipped after defensive signal ({provider})")
            }
        }
    }
}

/// Enable/skip decisions consulted when advancing through the order.
#[derive(Debug, Clone, Default)]
pub struct PhasePlan {
    /// Phases whose enabling flag is false
    pub disabled: BTreeSet<Phase>,
    /// Explicit skip instructions from the CLI
    pub skip: BTreeSet<Phase>,
    /// Phases skipped once the session is escalated
    pub escalation_skips: BTreeSet<Phase>,
}

impl PhasePlan {
    /// A plan using the descriptor table's escalation-sensitive phases.
    pub fn new() -> Self {
        Self {
            escalation_skips: PHASES
                .iter()
                .filter(|d| d.escalation_sensitive)
                .map(|d| d.phase)
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_skips(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.skip.extend(phases);
        self
    }

    pub fn with_disabled(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.disabled.extend(phases);
        self
    }

    pub fn with_escalation_skips(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.escalation_skips = phases.into_iter().collect();
        self
    }

    /// Decide whether `phase` should be skipped for a session in the given defense state.
    pub fn skip_reason(&self, phase: Phase, escalated_by: Option<&str>) -> Option<SkipReason> {
        if self.disabled.contains(&phase) {
            return Some(SkipReason::Disabled);
        }
        if self.skip.contains(&phase) {
            return Some(SkipReason::Requested);
        }
        match escalated_by {
            Some(provider) if self.escalation_skips.contains(&phase) => {
                Some(SkipReason::Escalated {
                    provider: provider.to_string(),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_matches_table() {
        let names: Vec<&str> = PHASES.iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "recon",
                "takeover-check",
                "port-scan",
                "crawl",
                "secrets",
                "fuzz",
                "screenshot",
                "cloud",
                "leak-search",
                "vulnerability-scan",
                "done",
            ]
        );
    }

    #[test]
    fn test_pipeline_excludes_done() {
        let phases: Vec<Phase> = Phase::pipeline().collect();
        assert_eq!(phases.len(), 10);
        assert_eq!(phases.first(), Some(&Phase::Recon));
        assert_eq!(phases.last(), Some(&Phase::VulnerabilityScan));
    }

    #[test]
    fn test_predecessor_and_successor() {
        assert_eq!(Phase::Recon.predecessor(), None);
        assert_eq!(Phase::Secrets.predecessor(), Some(Phase::Crawl));
        assert_eq!(Phase::Crawl.successor(), Some(Phase::Secrets));
        assert_eq!(Phase::Done.successor(), None);
    }

    #[test]
    fn test_from_str_accepts_names_and_underscores() {
        assert_eq!("crawl".parse::<Phase>().unwrap(), Phase::Crawl);
        assert_eq!("port_scan".parse::<Phase>().unwrap(), Phase::PortScan);
        assert_eq!(
            "Vulnerability-Scan".parse::<Phase>().unwrap(),
            Phase::VulnerabilityScan
        );
        assert!(matches!(
            "nmap".parse::<Phase>(),
            Err(ConfigError::UnknownPhase(_))
        ));
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&Phase::LeakSearch).unwrap();
        assert_eq!(json, "\"leak-search\"");
        let phase: Phase = serde_json::from_str("\"takeover-check\"").unwrap();
        assert_eq!(phase, Phase::TakeoverCheck);
    }

    #[test]
    fn test_skip_reason_precedence() {
        let plan = PhasePlan::new()
            .with_disabled([Phase::Fuzz])
            .with_skips([Phase::Fuzz, Phase::Cloud]);

        assert_eq!(plan.skip_reason(Phase::Fuzz, None), Some(SkipReason::Disabled));
        assert_eq!(plan.skip_reason(Phase::Cloud, None), Some(SkipReason::Requested));
        assert_eq!(plan.skip_reason(Phase::Recon, None), None);
    }

    #[test]
    fn test_port_scan_skipped_only_when_escalated() {
        let plan = PhasePlan::new();
        assert_eq!(plan.skip_reason(Phase::PortScan, None), None);
        assert_eq!(
            plan.skip_reason(Phase::PortScan, Some("Cloudflare")),
            Some(SkipReason::Escalated {
                provider: "Cloudflare".to_string()
            })
        );
        assert_eq!(plan.skip_reason(Phase::Crawl, Some("Cloudflare")), None);
    }
}

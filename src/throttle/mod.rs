//! Adaptive throttle controller.
//!
//! Bounds outbound request volume with a fixed-window counter, adapts the dispatch
//! delay to observed HTTP statuses, and tightens the whole budget once a defensive
//! signal is seen. Escalation is one-way for the lifetime of a session.
//!
//! ## Example
//!
//! ```no_run
//! use reconflow::throttle::{Budget, EscalationPolicy, Mode, ThrottleController};
//!
//! # async fn example() {
//! let throttle = ThrottleController::new(Budget::for_mode(Mode::Conservative), EscalationPolicy::default());
//! throttle.wait_for_slot().await;
//! throttle.record_request().await;
//! throttle.observe_status(429).await;
//! # }
//! ```

mod budget;
mod window;

pub use budget::{
    Budget, BudgetOverrides, ENV_CONCURRENCY, ENV_DELAY, ENV_RATE_LIMIT, ENV_TIMEOUT,
    EscalationPolicy, Mode,
};
pub use window::RateWindow;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::phase::Phase;

/// Throttle state machine. `Escalated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    #[default]
    Normal,
    Escalated,
}

/// Result of a rate-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Ok,
    Blocked { retry_after: Duration },
}

impl SlotStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SlotStatus::Ok)
    }
}

/// What changed when the controller escalated.
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub provider: String,
    pub previous: Budget,
    pub budget: Budget,
    /// Phases that must now be skipped
    pub skip_phases: Vec<Phase>,
}

/// New delay in seconds after observing `status` with `current` delay.
///
/// - `429` doubles and adds 5
/// - `503` doubles and adds 3
/// - `403` adds 2
/// - anything else decays by one, never below zero
pub fn adaptive_delay(status: u16, current: u64) -> u64 {
    match status {
        429 => current.saturating_mul(2).saturating_add(5),
        503 => current.saturating_mul(2).saturating_add(3),
        403 => current.saturating_add(2),
        _ => current.saturating_sub(1),
    }
}

#[derive(Debug)]
struct Inner {
    window: RateWindow,
    budget: Budget,
    state: ThrottleState,
    provider: Option<String>,
}

/// Shared request budget for one session. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct ThrottleController {
    inner: Mutex<Inner>,
    policy: EscalationPolicy,
}

impl ThrottleController {
    /// Create a controller in the `Normal` state.
    pub fn new(budget: Budget, policy: EscalationPolicy) -> Self {
        Self::build(budget, policy, ThrottleState::Normal, None)
    }

    /// Recreate a controller for a resumed session.
    ///
    /// A session that was already escalated stays escalated; `budget` is taken as-is
    /// because the checkpoint stores the post-escalation values.
    pub fn restore(budget: Budget, policy: EscalationPolicy, provider: Option<String>) -> Self {
        let state = if provider.is_some() {
            ThrottleState::Escalated
        } else {
            ThrottleState::Normal
        };
        Self::build(budget, policy, state, provider)
    }

    fn build(
        budget: Budget,
        policy: EscalationPolicy,
        state: ThrottleState,
        provider: Option<String>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                window: RateWindow::new(budget.rate_limit, budget.period()),
                budget,
                state,
                provider,
            }),
            policy,
        }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Check the fixed window without consuming a slot.
    pub async fn check_limit(&self) -> SlotStatus {
        let mut inner = self.inner.lock().await;
        match inner.window.blocked_for(Instant::now()) {
            None => SlotStatus::Ok,
            Some(retry_after) => SlotStatus::Blocked { retry_after },
        }
    }

    /// Sleep until `check_limit` would return `Ok`.
    pub async fn wait_for_slot(&self) {
        loop {
            match self.check_limit().await {
                SlotStatus::Ok => return,
                SlotStatus::Blocked { retry_after } => {
                    debug!(wait_ms = retry_after.as_millis() as u64, "Rate window full");
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }

    /// Count one outbound request against the current window.
    pub async fn record_request(&self) {
        let mut inner = self.inner.lock().await;
        inner.window.record(Instant::now());
    }

    /// Wait for a slot and record the request under one lock acquisition, so
    /// concurrent callers cannot both take the last slot.
    pub async fn acquire(&self) {
        loop {
            let retry_after = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                match inner.window.blocked_for(now) {
                    None => {
                        inner.window.record(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };
            tokio::time::sleep(retry_after).await;
        }
    }

    /// Apply `adaptive_delay` to the controller's current delay and return it.
    pub async fn observe_status(&self, status: u16) -> u64 {
        let mut inner = self.inner.lock().await;
        let previous = inner.budget.delay_secs;
        let next = adaptive_delay(status, previous);
        if next > previous {
            warn!(status, previous, next, "Backing off after response status");
        }
        inner.budget.delay_secs = next;
        next
    }

    /// Move to `Escalated`, tightening the budget.
    ///
    /// Returns `None` when already escalated; the first provider label is kept.
    pub async fn escalate(&self, provider: &str) -> Option<Escalation> {
        let mut inner = self.inner.lock().await;
        if inner.state == ThrottleState::Escalated {
            debug!(provider, "Already escalated, ignoring signal");
            return None;
        }

        let previous = inner.budget;
        let budget = self.policy.apply(previous);
        inner.budget = budget;
        inner.window.set_limit(budget.rate_limit);
        inner.state = ThrottleState::Escalated;
        inner.provider = Some(provider.to_string());

        info!(
            provider,
            concurrency = budget.max_concurrency,
            rate_limit = budget.rate_limit,
            delay_secs = budget.delay_secs,
            "Defensive signal observed, escalating throttle"
        );

        Some(Escalation {
            provider: provider.to_string(),
            previous,
            budget,
            skip_phases: self.policy.skip_phases.clone(),
        })
    }

    pub async fn budget(&self) -> Budget {
        self.inner.lock().await.budget
    }

    pub async fn current_delay(&self) -> Duration {
        self.inner.lock().await.budget.delay()
    }

    pub async fn state(&self) -> ThrottleState {
        self.inner.lock().await.state
    }

    pub async fn provider(&self) -> Option<String> {
        self.inner.lock().await.provider.clone()
    }

    /// Requests counted in the current window.
    pub async fn window_count(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.window.roll(Instant::now());
        inner.window.count()
    }
}

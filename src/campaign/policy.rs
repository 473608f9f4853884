//! Campaign stopping policy.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Why a campaign stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Total time budget elapsed.
    BudgetExhausted,
    /// Too long since the last kill.
    IdleLimit,
    /// Interrupted by a signal.
    Interrupted,
    /// The test source has nothing left.
    SourceExhausted,
}

/// Time limits, in whole seconds; `0` disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoppingPolicy {
    /// Total campaign time budget.
    pub total_time_secs: u64,
    /// Maximum time since the last kill.
    pub max_idle_secs: u64,
}

impl StoppingPolicy {
    /// Which limit, if any, has been exceeded.
    pub fn exceeded(&self, elapsed: Duration, since_last_kill: Duration) -> Option<StopReason> {
        if 0 < self.total_time_secs && self.total_time_secs < elapsed.as_secs() {
            Some(StopReason::BudgetExhausted)
        } else if 0 < self.max_idle_secs && self.max_idle_secs < since_last_kill.as_secs() {
            Some(StopReason::IdleLimit)
        } else {
            None
        }
    }
}

/// True while neither limit has been exceeded.
///
/// Elapsed times are truncated to whole seconds, so a budget of `100` still
/// allows testing at `100.9s`.
pub fn still_testing(
    elapsed: Duration,
    since_last_kill: Duration,
    total_time_secs: u64,
    max_idle_secs: u64,
) -> bool {
    StoppingPolicy {
        total_time_secs,
        max_idle_secs,
    }
    .exceeded(elapsed, since_last_kill)
    .is_none()
}

/// Wall-clock state the stopping policy is evaluated against.
#[derive(Debug, Clone)]
pub struct CampaignClock {
    policy: StoppingPolicy,
    started: Instant,
    last_kill: Instant,
}

impl CampaignClock {
    /// Clock starting now; the last kill is taken to be the start.
    pub fn start(policy: StoppingPolicy) -> Self {
        let now = Instant::now();
        Self {
            policy,
            started: now,
            last_kill: now,
        }
    }

    /// Note a kill recorded by this worker.
    pub fn record_kill(&mut self) {
        self.last_kill = Instant::now();
    }

    /// Limit exceeded right now, if any.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.policy
            .exceeded(self.started.elapsed(), self.last_kill.elapsed())
    }

    /// True while no limit is exceeded.
    pub fn still_testing(&self) -> bool {
        self.stop_reason().is_none()
    }

    /// Time since the clock started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

//! Campaign configuration.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::policy::StoppingPolicy;

/// Timeouts for baseline runs and the scaling rule for mutant runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    /// Time allowed for generating one test program.
    pub generator_secs: u64,
    /// Time allowed for an unmutated compile.
    pub compile_secs: u64,
    /// Time allowed for an unmutated run.
    pub run_secs: u64,
    /// Floor for a mutated compile.
    pub min_mutant_compile_secs: u64,
    /// Floor for a mutated run.
    pub min_mutant_run_secs: u64,
    /// Mutated compile timeout as a multiple of the baseline compile time.
    pub mutant_compile_multiplier: f64,
    /// Mutated run timeout as a multiple of the baseline run time.
    pub mutant_run_multiplier: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            generator_secs: 20,
            compile_secs: 5,
            run_secs: 10,
            min_mutant_compile_secs: 10,
            min_mutant_run_secs: 10,
            mutant_compile_multiplier: 5.0,
            mutant_run_multiplier: 5.0,
        }
    }
}

impl TimeoutConfig {
    /// Generator timeout.
    pub fn generator(&self) -> Duration {
        Duration::from_secs(self.generator_secs)
    }

    /// Unmutated compile timeout.
    pub fn compile(&self) -> Duration {
        Duration::from_secs(self.compile_secs)
    }

    /// Unmutated run timeout.
    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    /// Timeout for a mutated compile whose baseline took `baseline`.
    pub fn mutant_compile(&self, baseline: Duration) -> Duration {
        scaled(
            baseline,
            self.mutant_compile_multiplier,
            self.min_mutant_compile_secs,
        )
    }

    /// Timeout for a mutated run whose baseline took `baseline`.
    pub fn mutant_run(&self, baseline: Duration) -> Duration {
        scaled(baseline, self.mutant_run_multiplier, self.min_mutant_run_secs)
    }
}

fn scaled(baseline: Duration, multiplier: f64, floor_secs: u64) -> Duration {
    let floor = Duration::from_secs(floor_secs);
    let scaled = Duration::try_from_secs_f64(baseline.as_secs_f64() * multiplier).unwrap_or(floor);
    scaled.max(floor)
}

/// Configuration for one campaign worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignConfig {
    /// Shared work directory.
    pub work_dir: PathBuf,
    /// Maximum number of mutations enabled together; `1` disables batching.
    pub batch_size: NonZeroUsize,
    /// Seed for test seeds and candidate shuffling; random when `None`.
    pub seed: Option<u64>,
    /// Shuffle candidates before batching.
    pub shuffle_candidates: bool,
    /// Total time budget in seconds; `0` means unlimited.
    pub total_time_secs: u64,
    /// Maximum seconds since the last kill; `0` means unlimited.
    pub max_idle_secs: u64,
    /// Process timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            batch_size: NonZeroUsize::MIN,
            seed: None,
            shuffle_candidates: false,
            total_time_secs: 86_400,
            max_idle_secs: 86_400,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl CampaignConfig {
    /// Set work directory.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Set batch size.
    pub fn with_batch_size(mut self, batch_size: NonZeroUsize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Enable or disable candidate shuffling.
    pub fn with_shuffle_candidates(mut self, shuffle: bool) -> Self {
        self.shuffle_candidates = shuffle;
        self
    }

    /// Set total time budget.
    pub fn with_total_time_secs(mut self, secs: u64) -> Self {
        self.total_time_secs = secs;
        self
    }

    /// Set idle budget.
    pub fn with_max_idle_secs(mut self, secs: u64) -> Self {
        self.max_idle_secs = secs;
        self
    }

    /// Set timeouts.
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Stopping policy derived from the time budgets.
    pub fn stopping_policy(&self) -> StoppingPolicy {
        StoppingPolicy {
            total_time_secs: self.total_time_secs,
            max_idle_secs: self.max_idle_secs,
        }
    }

    /// Seeded random number generator for this worker.
    pub fn rng(&self) -> fastrand::Rng {
        match self.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        }
    }
}
